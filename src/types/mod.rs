//! Core value types for decoded run data.
//!
//! Everything here is a plain owned struct with explicit geometry metadata:
//! no inheritance-style container tricks, no shared state. The decoder hands
//! these to the caller and keeps nothing back:
//!
//! - [`WindowDescriptor`] is the declared geometry of one readout window.
//! - [`Window`] pairs a descriptor with the binned pixel samples read for it.
//! - [`Ccd`] is one detector's window list for one exposure.
//! - [`Time`] is a mid-exposure timestamp with an explicit reliability
//!   verdict; [`Unreliable`] is the closed set of reasons a verdict can fail.
//! - [`DecodedFrame`] bundles a frame's CCDs with its timestamps and the
//!   [`TimingInfo`] diagnostics behind them.

mod frame;
mod time;
mod window;

// Re-export all public types
pub use frame::{Ccd, DecodedFrame};
pub use time::{Time, TimingInfo, Unreliable};
pub use window::{Window, WindowDescriptor};
