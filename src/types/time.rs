//! Mid-exposure timestamps and their reliability verdicts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a [`Time`] could not be certified reliable.
///
/// This is a closed taxonomy: every way the timing engine can lose confidence
/// in a timestamp is listed here, and nothing in this set is an error: a
/// frame with an unreliable time still decodes fully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Unreliable {
    /// GPS receiver locked onto too few satellites (format 1 runs).
    TooFewSatellites(i16),
    /// GPS antenna failure reported in the status word.
    AntennaFailure,
    /// Receiver battery was disconnected; its clock cannot be trusted.
    BatteryDisconnected,
    /// Receiver has not synchronised since power-up.
    NotSynced,
    /// Receiver is free-running and has not verified its position.
    PositionUnverified,
    /// Exposure time in the timing block disagrees with the run descriptor.
    ExposureMismatch,
    /// The active mode's formula needs more consecutive prior timestamps
    /// than the engine currently holds.
    InsufficientHistory { needed: usize },
    /// The timing block's frame counter disagreed with the read position.
    FrameCountMismatch,
    /// A frame contributing to the blue-channel average was itself
    /// unreliable.
    ContributorUnreliable,
    /// Timestamps from this early observing era are known to be corrupt.
    PreEraFix,
}

impl fmt::Display for Unreliable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unreliable::TooFewSatellites(n) => write!(f, "too few satellites ({n})"),
            Unreliable::AntennaFailure => write!(f, "GPS antenna failure"),
            Unreliable::BatteryDisconnected => write!(f, "GPS battery disconnected"),
            Unreliable::NotSynced => {
                write!(f, "GPS clock not yet synced since power up")
            }
            Unreliable::PositionUnverified => {
                write!(f, "GPS receiver has not verified its position")
            }
            Unreliable::ExposureMismatch => {
                write!(f, "exposure times in descriptor and timing bytes differ")
            }
            Unreliable::InsufficientHistory { needed } => write!(
                f,
                "could not establish an accurate time without {needed} prior timestamp(s)"
            ),
            Unreliable::FrameCountMismatch => {
                write!(f, "frame number in timing bytes disagrees with read position")
            }
            Unreliable::ContributorUnreliable => {
                write!(f, "time of one or more contributing frames is unreliable")
            }
            Unreliable::PreEraFix => {
                write!(f, "timestamps from this era are unreliable")
            }
        }
    }
}

/// A mid-exposure time for one CCD of one frame.
///
/// `mjd` is the modified Julian day of mid-exposure and `expose` the exposure
/// length in seconds. `good` says whether the value can be trusted for
/// science; when it is `false`, `reason` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Time {
    /// Modified Julian day of mid-exposure
    pub mjd: f64,
    /// Exposure length, seconds
    pub expose: f64,
    /// Is the time thought to be reliable?
    pub good: bool,
    /// If `good` is false, the reason
    pub reason: Option<Unreliable>,
}

impl Time {
    /// A timestamp the engine certifies as reliable.
    pub fn reliable(mjd: f64, expose: f64) -> Self {
        Self { mjd, expose, good: true, reason: None }
    }

    /// A timestamp the engine could compute but cannot certify.
    pub fn unreliable(mjd: f64, expose: f64, reason: Unreliable) -> Self {
        Self { mjd, expose, good: false, reason: Some(reason) }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MJD = {}, exposure = {}, status = {}", self.mjd, self.expose, self.good)?;
        if let Some(reason) = &self.reason {
            write!(f, ", reason: {reason}")?;
        }
        Ok(())
    }
}

/// Diagnostics accompanying every reconstructed [`Time`].
///
/// Nothing here affects whether a frame decodes; it exists so timing checkers
/// can see what the engine actually worked from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingInfo {
    /// Timing-block protocol: 1 (legacy, satellite count) or 2 (GPS status word)
    pub format: u8,
    /// Frame number carried in the timing block
    pub frame_number: u64,
    /// Satellite count, format-1 runs only
    pub nsat: Option<i16>,
    /// Raw GPS status word, format-2 runs only
    pub gps_status: Option<u16>,
    /// Raw GPS MJD before any mode formula was applied
    pub gps_mjd: f64,
    /// Whether the default timestamping convention was in force at this date
    pub default_tstamp: bool,
    /// Vertical clock time per row in use, seconds
    pub vclock_frame: f64,
    /// Timing-block frame number disagreed with the reader's expectation
    pub frame_mismatch: bool,
    /// The one-day midnight defect was detected and corrected
    pub midnight_corrected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_reason_only_when_bad() {
        let good = Time::reliable(55000.2, 20.0);
        assert!(!format!("{good}").contains("reason"));

        let bad = Time::unreliable(55000.2, 20.0, Unreliable::AntennaFailure);
        let text = format!("{bad}");
        assert!(text.contains("status = false"));
        assert!(text.contains("GPS antenna failure"));
    }

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(Unreliable::TooFewSatellites(2).to_string(), "too few satellites (2)");
        assert_eq!(
            Unreliable::InsufficientHistory { needed: 3 }.to_string(),
            "could not establish an accurate time without 3 prior timestamp(s)"
        );
    }

    #[test]
    fn constructors_set_the_flag_consistently() {
        assert!(Time::reliable(50000.0, 1.0).good);
        let t = Time::unreliable(50000.0, 1.0, Unreliable::NotSynced);
        assert!(!t.good);
        assert_eq!(t.reason, Some(Unreliable::NotSynced));
    }
}
