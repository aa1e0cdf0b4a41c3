//! Decoder for raw ULTRACAM/ULTRASPEC runs.
//!
//! `ucamraw` reads the telemetry a run leaves behind, an XML descriptor plus
//! a stream of fixed-size binary frame records, and reconstructs, for every
//! exposure, the per-CCD windowed pixel data and a scientifically
//! trustworthy mid-exposure timestamp.
//!
//! # Features
//!
//! - **Descriptor validation**: the XML header is parsed into a typed
//!   [`FrameHeader`] and cross-checked against the declared frame size
//!   before a single data byte is read.
//! - **Window decoding**: payloads are de-interleaved into plain per-CCD
//!   [`Window`] buffers with explicit geometry metadata.
//! - **GPS timestamp reconstruction**: both historical timing-block formats,
//!   the per-mode exposure formulas, the midnight defect and the other known
//!   hardware quirks, with every timestamp carrying an explicit reliability
//!   verdict.
//! - **Sequential or random access**: read frames in order for full timing
//!   accuracy, or seek anywhere and accept the documented confidence cost.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ucamraw::Run;
//!
//! fn scan() -> ucamraw::Result<()> {
//!     // Opens run042.xml + run042.dat
//!     let mut run = Run::open("data/run042")?;
//!     println!("{} frames of {:?}", run.total_frames(), run.header().mode);
//!
//!     while let Some(frame) = run.next_frame()? {
//!         println!("frame {}: {}", frame.number, frame.time);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! An unreliable timestamp is a normal, reportable outcome; decoding keeps
//! going. Only structural problems (truncation, power-on/off records,
//! unparseable descriptors) surface as errors.

// Core types and error handling
mod error;
pub mod types;

// Run decoding pipeline
pub mod descriptor;
pub mod geometry;
pub mod reader;
pub mod source;
pub mod timing;

// Core exports
pub use error::{DecodeError, HeaderError, Result};
pub use types::*;

// Pipeline exports
pub use descriptor::{FrameHeader, GainSpeed, Instrument, Mode, WhichRun};
pub use geometry::ClockRates;
pub use reader::Run;
pub use source::{ByteSource, FileSource, MemorySource};
pub use timing::{TimingResult, TimingState};
