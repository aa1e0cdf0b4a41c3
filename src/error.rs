//! Error types for raw-run decoding.
//!
//! Two layers mirror the two phases of working with a run:
//!
//! - [`HeaderError`]: construction-time failures while parsing and validating
//!   the XML run descriptor. All of these are fatal for the run.
//! - [`DecodeError`]: failures while reading the frame stream. Of these only
//!   [`DecodeError::EndOfData`] is an expected outcome: it is how a
//!   sequential read discovers the last frame has been consumed, and batch
//!   tools treat it as normal completion rather than a fault.
//!
//! An untrustworthy GPS timestamp is *not* an error at this level: it is
//! reported through [`crate::Time::reason`] so that one bad timestamp can
//! never stop the decode of subsequent frames.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for decoding operations.
pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Fatal problems with the XML run descriptor.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HeaderError {
    #[error("run descriptor is not valid XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("run descriptor node or attribute '{0}' not found")]
    MissingNode(&'static str),

    #[error("application '{0}' not recognised")]
    UnknownApplication(String),

    #[error("required parameter '{0}' missing from run descriptor")]
    MissingParameter(String),

    #[error("parameter '{name}' has unusable value '{value}'")]
    BadParameter { name: String, value: String },

    #[error("declared framesize {declared} does not match computed size {computed}")]
    FramesizeMismatch { declared: usize, computed: usize },

    #[error("firmware revision {0} not recognised")]
    UnknownVersion(i32),
}

/// Failures while reading frames from the byte stream.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("run descriptor error")]
    Header(#[from] HeaderError),

    #[error("run file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The timing block of the next frame could not be read in full. This is
    /// the ordinary way a sequential read terminates.
    #[error("end of data reached")]
    EndOfData,

    /// The timing block was complete but the pixel payload was short. A run
    /// should only ever be truncated on a frame boundary, so this indicates
    /// real corruption.
    #[error("frame {frame} truncated: expected {expected} payload bytes, got {got}")]
    Truncated { frame: u64, expected: usize, got: usize },

    /// The run is a power-on/off record and carries no science frames.
    /// Distinct from the other variants so that batch tools can skip these
    /// runs silently.
    #[error("run is a power on/off record with no science frames")]
    PowerOnOff,

    #[error("frame {frame} out of range (run holds {total} complete frames)")]
    FrameOutOfRange { frame: u64, total: u64 },
}

impl DecodeError {
    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        DecodeError::File { path, source }
    }

    /// True for the expected end-of-stream condition, which iteration treats
    /// as completion rather than failure.
    pub fn is_end_of_data(&self) -> bool {
        matches!(self, DecodeError::EndOfData)
    }
}
