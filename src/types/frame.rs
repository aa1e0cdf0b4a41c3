//! One fully decoded exposure.

use serde::{Deserialize, Serialize};

use super::{Time, TimingInfo, Window};

/// One detector's windows for a single exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ccd {
    /// Decoded windows in descriptor order
    pub windows: Vec<Window>,
}

impl Ccd {
    pub fn new(windows: Vec<Window>) -> Self {
        Self { windows }
    }

    /// Total binned pixels across all windows.
    pub fn npix(&self) -> usize {
        self.windows.iter().map(Window::npix).sum()
    }
}

/// The decoder's output for one frame: pixel windows for every detector plus
/// the reconstructed timestamps.
///
/// For the three-detector instrument with `nblue > 1`, the blue CCD runs on
/// its own decimated cycle: `blue_time` carries its averaged mid-exposure
/// time and `bad_blue` marks the physical frames whose blue data is a
/// placeholder and should be discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// Frame number within the run, 1-based
    pub number: u64,
    /// One entry per detector (red, green, blue for ULTRACAM; one for ULTRASPEC)
    pub ccds: Vec<Ccd>,
    /// Mid-exposure time for the normally-clocked detectors
    pub time: Time,
    /// Mid-exposure time of the decimated blue channel, when `nblue > 1`
    pub blue_time: Option<Time>,
    /// This frame's blue data is a placeholder, not a real exposure
    pub bad_blue: bool,
    /// Diagnostics from the timing reconstruction
    pub timing: TimingInfo,
}
