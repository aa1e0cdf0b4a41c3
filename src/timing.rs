//! GPS timestamp reconstruction.
//!
//! Each frame record opens with a timing block written by the GPS timing
//! card. Turning those bytes into a trustworthy mid-exposure time is the most
//! intricate part of decoding a run, because the answer depends on history:
//! what the stamp actually marks within the readout cycle changed over the
//! instrument's life, several readout modes only pin down the true exposure
//! length as the *difference* of consecutive stamps, and half a dozen
//! hardware defects need detecting and correcting along the way.
//!
//! [`TimingState`] is that history, made explicit: a bounded deque of prior
//! raw GPS stamps (capacity set by the readout mode) plus the previous frame
//! number. The reader owns one per run and threads it through every call, so
//! two runs can decode side by side without cross-talk. Any frame-number step
//! other than +1 clears the history, which is why the first frame after a
//! random seek always reports with reduced confidence even when its own GPS
//! data is pristine. That trade-off is deliberate: sequential reads are the
//! only way to earn full timing accuracy.
//!
//! An unreliable time is a normal result, never an error. Every verdict is
//! recomputed from scratch each frame from the current history depth and the
//! status bits; there is no sticky "good" state.

use std::collections::VecDeque;

use tracing::warn;

use crate::descriptor::{FrameHeader, Instrument, Mode, WhichRun};
use crate::geometry::{self, ClockRates, constants};
use crate::types::{Time, TimingInfo, Unreliable};

/// Seconds per day.
const DSEC: f64 = 86400.0;

// Epoch and era thresholds, MJD.
/// Unix epoch, 1970 January 1.
const MJD_UNIX_EPOCH: f64 = 40587.0;
/// Reference date of the dateless first commissioning run, 2002 May 2.
const MJD_MAY_2002: f64 = 52396.0;
/// Fallback reference for format-1 frames with garbage embedded dates,
/// 2002 September 1.
const MJD_SEP_2002: f64 = 52518.0;
/// Timestamping convention changes. Between the first and second thresholds,
/// and after the third, stamps mark the end of the readout cycle rather than
/// the start of the exposure.
const TSTAMP_CHANGE1: f64 = 52620.0;
const TSTAMP_CHANGE2: f64 = 53469.0;
const TSTAMP_CHANGE3: f64 = 55316.0;
/// ULTRASPEC stamps before this date suffer a known corruption.
const USPEC_TIMING_FIX: f64 = 56124.0;

/// Size of the 10-second clock error that affected the May 2002 run.
const MAY_2002_CLOCK_SLIP: f64 = 10.0;

// GPS status word bits, format 2. A set bit flags the problem; an all-clear
// word is zero (the sync bit is stored inverted by the acquisition firmware).
const GPS_POSITION_UNVERIFIED: u16 = 0x0001;
const GPS_NOT_SYNCED: u16 = 0x0004;
const GPS_INVALID_TIME: u16 = 0x0080;
const GPS_ANTENNA_FAILURE: u16 = 0x0200;

// Timing block byte offsets (little-endian fields).
const FLAG_BYTE: usize = 0;
const FRAME_NUMBER: usize = 4;
// Format 1.
const F1_SECONDS: usize = 9;
const F1_NANOSECONDS: usize = 13;
const F1_DAY: usize = 17;
const F1_MONTH: usize = 18;
const F1_YEAR: usize = 19;
const F1_NSAT: usize = 21;
// Format 2. Nanoseconds are stored in units of 100 ns.
const F2_EXPOSURE_TICKS: usize = 8;
const F2_SECONDS: usize = 12;
const F2_NANOSECONDS: usize = 16;
const F2_GPS_STATUS: usize = 24;

/// Flag-byte bit marking a placeholder blue frame. The bit moved between
/// timing-block formats.
const BAD_BLUE_BIT_F1: u8 = 1 << 3;
const BAD_BLUE_BIT_F2: u8 = 1 << 4;

/// The outcome of reconstructing one frame's timing.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingResult {
    /// Mid-exposure time for the normally-clocked CCDs
    pub time: Time,
    /// Averaged blue-channel time, when the run decimates blue
    pub blue_time: Option<Time>,
    /// This frame's blue data is a placeholder
    pub bad_blue: bool,
    /// What the engine worked from
    pub info: TimingInfo,
}

/// Rolling per-run timing memory.
#[derive(Debug, Clone, Default)]
pub struct TimingState {
    previous_frame: Option<u64>,
    /// Raw GPS stamps of preceding frames, most recent first
    stamps: VecDeque<f64>,
    /// Mid-exposure times of preceding frames, for blue-channel averaging
    blue_times: VecDeque<Time>,
}

impl TimingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive prior frames currently remembered.
    pub fn depth(&self) -> usize {
        self.stamps.len()
    }

    /// Drop all history. Called by the reader on any non-sequential access.
    pub fn reset(&mut self) {
        self.previous_frame = None;
        self.stamps.clear();
        self.blue_times.clear();
    }

    /// Reconstruct the timing of one frame from its timing block.
    ///
    /// `expected_frame` is the reader's own sequential counter; a timing
    /// block that disagrees is reported, not rejected.
    pub fn update(
        &mut self,
        header: &FrameHeader,
        rates: &ClockRates,
        tbytes: &[u8],
        expected_frame: u64,
    ) -> TimingResult {
        let format = header.timing_format();
        let frame_number = u64::from(u32_at(tbytes, FRAME_NUMBER));

        let frame_mismatch = frame_number != expected_frame;
        if frame_mismatch {
            warn!(
                expected = expected_frame,
                found = frame_number,
                "timing block frame number disagrees with read position"
            );
        }

        // Any step other than +1 breaks the sequential contract and voids
        // the history.
        if self.previous_frame != Some(frame_number.wrapping_sub(1)) {
            self.stamps.clear();
            self.blue_times.clear();
        }
        self.previous_frame = Some(frame_number);

        // Reliability starts clean; the first problem found wins and the
        // verdict can only get worse from there.
        let mut reason: Option<Unreliable> = None;

        // Decode the raw GPS fields per format.
        let (nsec, nanosec, nsat, gps_status);
        match format {
            1 => {
                let mut secs = u32_at(tbytes, F1_SECONDS);
                let mut ns = u32_at(tbytes, F1_NANOSECONDS);
                // The card writes all-ones into fields it never latched.
                if secs == u32::MAX {
                    secs = 0;
                }
                if ns == u32::MAX {
                    ns = 0;
                }
                let sats = i16_at(tbytes, F1_NSAT);
                if sats <= 2 {
                    set_if_clean(&mut reason, Unreliable::TooFewSatellites(sats));
                }
                nsec = secs;
                nanosec = ns;
                nsat = Some(sats);
                gps_status = None;
            }
            _ => {
                let ticks = u32_at(tbytes, F2_EXPOSURE_TICKS);
                if (f64::from(ticks) * header.time_units - header.expose_time).abs() > 1e-9 {
                    set_if_clean(&mut reason, Unreliable::ExposureMismatch);
                }
                nsec = u32_at(tbytes, F2_SECONDS);
                nanosec = u32_at(tbytes, F2_NANOSECONDS).saturating_mul(100);
                let status = u16_at(tbytes, F2_GPS_STATUS);
                if status & GPS_ANTENNA_FAILURE != 0 {
                    set_if_clean(&mut reason, Unreliable::AntennaFailure);
                } else if status & GPS_INVALID_TIME != 0 {
                    set_if_clean(&mut reason, Unreliable::BatteryDisconnected);
                } else if status & GPS_NOT_SYNCED != 0 {
                    set_if_clean(&mut reason, Unreliable::NotSynced);
                } else if status & GPS_POSITION_UNVERIFIED != 0 {
                    set_if_clean(&mut reason, Unreliable::PositionUnverified);
                }
                nsat = None;
                gps_status = Some(status);
            }
        }

        // Raw seconds to an absolute MJD, per era.
        let frac = (f64::from(nsec) + f64::from(nanosec) / 1.0e9) / DSEC;
        let mut mjd = if format == 1 && header.which_run == WhichRun::May2002 {
            // No date information at all: seconds count from the start of the
            // reference week. Nights that ran over the week end wrapped.
            let mut mjd = MJD_MAY_2002 + frac;
            if mjd < MJD_MAY_2002 + 4.0 {
                mjd += 7.0;
            }
            // The run's clock also slipped 10 seconds once; a stamp landing
            // before its predecessor reveals it.
            if let Some(&prev) = self.stamps.front() {
                if mjd < prev {
                    mjd += MAY_2002_CLOCK_SLIP / DSEC;
                }
            }
            mjd
        } else if format == 1 {
            let day = u32::from(tbytes[F1_DAY]);
            let month = u32::from(tbytes[F1_MONTH]);
            let mut year = i32::from(u16_at(tbytes, F1_YEAR));
            // A card firmware fault wrote year 263 during September 2002.
            if month == 9 && year == 263 {
                year = 2002;
            }
            if (1..=12).contains(&month) && (1..=31).contains(&day) && year >= 2002 {
                gregorian_to_mjd(year, month, day) + f64::from(nsec % 86400) / DSEC
                    + f64::from(nanosec) / 1.0e9 / DSEC
            } else {
                // No usable date; count from the September 2002 reference.
                MJD_SEP_2002 + frac
            }
        } else {
            MJD_UNIX_EPOCH + frac
        };

        // Midnight defect: near UTC midnight the card could report the
        // previous day. The weekday parity of the stamp betrays it.
        let midnight_corrected = (mjd.floor() as i64 - 3).rem_euclid(7)
            == i64::from((nsec / 86400) % 7);
        if midnight_corrected {
            warn!(frame = frame_number, "midnight defect detected, advancing stamp one day");
            mjd += 1.0;
        }

        let default_tstamp =
            mjd < TSTAMP_CHANGE1 || (mjd > TSTAMP_CHANGE2 && mjd < TSTAMP_CHANGE3);

        self.stamps.push_front(mjd);

        let bad_blue = header.nblue > 1
            && match format {
                1 => tbytes[FLAG_BYTE] & BAD_BLUE_BIT_F1 != 0,
                _ => tbytes[FLAG_BYTE] & BAD_BLUE_BIT_F2 != 0,
            };

        // Mode-specific mid-exposure formulas.
        let (centre, exposure) = match header.instrument {
            Instrument::Ultracam => {
                self.ultracam_centre(header, rates, default_tstamp, &mut reason)
            }
            Instrument::Ultraspec => self.ultraspec_centre(header, &mut reason),
        };

        if frame_mismatch {
            set_if_clean(&mut reason, Unreliable::FrameCountMismatch);
        }

        let time = match reason.clone() {
            None => Time::reliable(centre, exposure),
            Some(r) => Time::unreliable(centre, exposure, r),
        };

        let blue_time = (header.nblue > 1).then(|| {
            self.blue_time(header.nblue as usize, &time, bad_blue)
        });

        TimingResult {
            time,
            blue_time,
            bad_blue,
            info: TimingInfo {
                format,
                frame_number,
                nsat,
                gps_status,
                gps_mjd: mjd,
                default_tstamp,
                vclock_frame: rates.vclock_frame,
                frame_mismatch,
                midnight_corrected,
            },
        }
    }

    /// ULTRACAM mid-exposure time and exposure length.
    fn ultracam_centre(
        &mut self,
        header: &FrameHeader,
        rates: &ClockRates,
        default_tstamp: bool,
        reason: &mut Option<Unreliable>,
    ) -> (f64, f64) {
        let expose = header.expose_time;
        let frame_transfer = f64::from(constants::UCAM_FT_ROWS) * rates.vclock_frame;

        match header.mode {
            Mode::FullFrameClear | Mode::FullFrameOverscan => {
                self.trim_stamps(2);
                if default_tstamp {
                    // Stamp at the start of the exposure; the chip was
                    // cleared, so the descriptor's exposure delay is exact.
                    (self.stamps[0] + expose / 2.0 / DSEC, expose)
                } else {
                    let clear_time = f64::from(
                        constants::UCAM_FT_ROWS + constants::UCAM_CLEAR_EXTRA_ROWS,
                    ) * rates.vclock_frame;
                    let readout = self.ultracam_readout(header, rates);
                    if self.stamps.len() >= 2 {
                        // The previous stamp marks the end of the previous
                        // readout, i.e. the start of this frame's clear.
                        (self.stamps[1] + (clear_time + expose / 2.0) / DSEC, expose)
                    } else {
                        // Hop back over our own readout and transfer instead;
                        // the readout estimate makes this less trustworthy.
                        set_if_clean(reason, Unreliable::InsufficientHistory { needed: 1 });
                        (
                            self.stamps[0]
                                - (readout + frame_transfer + expose / 2.0) / DSEC,
                            expose,
                        )
                    }
                }
            }

            Mode::FullFrameNoClear | Mode::OnePair | Mode::TwoPair | Mode::ThreePair => {
                self.trim_stamps(3);
                if self.stamps.len() >= 2 {
                    // Without a clear the true exposure is the stamp cadence
                    // less the frame transfer.
                    let texp = (self.stamps[0] - self.stamps[1]) * DSEC - frame_transfer;
                    if default_tstamp {
                        (self.stamps[0] + texp / 2.0 / DSEC, texp)
                    } else {
                        (self.stamps[0] - (frame_transfer + texp / 2.0) / DSEC, texp)
                    }
                } else {
                    set_if_clean(reason, Unreliable::InsufficientHistory { needed: 1 });
                    if default_tstamp {
                        (self.stamps[0] + expose / 2.0 / DSEC, expose)
                    } else {
                        (self.stamps[0] - (frame_transfer + expose / 2.0) / DSEC, expose)
                    }
                }
            }

            Mode::Drift => {
                let pipeline = geometry::drift_pipeline(header)
                    .expect("drift mode always has a pipeline");
                let nwins = pipeline.nwins;
                self.trim_stamps(nwins + 2);

                let window = &header.windows[0];
                let ny_unbinned = f64::from(window.ny * header.ybin);
                // Reduced-height transfer: only the pipeline rows move.
                let drift_transfer = (ny_unbinned + 49.0) * rates.vclock_frame;

                if default_tstamp {
                    if self.stamps.len() > nwins {
                        let texp =
                            (self.stamps[nwins - 1] - self.stamps[nwins]) * DSEC - drift_transfer;
                        (self.stamps[nwins] + texp / 2.0 / DSEC, texp)
                    } else {
                        set_if_clean(
                            reason,
                            Unreliable::InsufficientHistory { needed: nwins + 1 },
                        );
                        (self.stamps[0] + expose / 2.0 / DSEC, expose)
                    }
                } else if self.stamps.len() > nwins + 1 {
                    let texp =
                        (self.stamps[nwins] - self.stamps[nwins + 1]) * DSEC - drift_transfer;
                    // The pipeline's asymmetric placement adds a serial-shift
                    // delay of pipe_shift columns.
                    let shift = f64::from(pipeline.pipe_shift) * rates.hclock;
                    (
                        self.stamps[nwins] - (drift_transfer + shift + texp / 2.0) / DSEC,
                        texp,
                    )
                } else {
                    set_if_clean(
                        reason,
                        Unreliable::InsufficientHistory { needed: nwins + 2 },
                    );
                    (self.stamps[0] - (drift_transfer + expose / 2.0) / DSEC, expose)
                }
            }

            // Remaining variants cannot reach the timing engine: ULTRASPEC
            // modes take the other instrument branch and power records never
            // construct a reader.
            Mode::UspecOneWindow
            | Mode::UspecTwoWindows
            | Mode::UspecDrift
            | Mode::PowerOn
            | Mode::PowerOff => unreachable!("not an ULTRACAM science mode"),
        }
    }

    /// Full-chip readout time estimate for the full-frame modes.
    fn ultracam_readout(&self, header: &FrameHeader, rates: &ClockRates) -> f64 {
        let xbin = f64::from(header.xbin);
        let ybin = f64::from(header.ybin);
        let (rows, serial_shift, cols) = match header.mode {
            Mode::FullFrameOverscan => (1032.0, 540.0, 540.0),
            _ => (1024.0, 536.0, 512.0),
        };
        (rows / ybin)
            * (rates.vclock_storage * ybin
                + serial_shift * rates.hclock
                + (cols / xbin + 2.0) * rates.video)
    }

    /// ULTRASPEC mid-exposure time and exposure length.
    fn ultraspec_centre(
        &mut self,
        header: &FrameHeader,
        reason: &mut Option<Unreliable>,
    ) -> (f64, f64) {
        let expose = header.expose_time;

        if self.stamps[0] < USPEC_TIMING_FIX {
            set_if_clean(reason, Unreliable::PreEraFix);
        }

        match header.mode {
            Mode::UspecDrift => {
                let pipeline = geometry::drift_pipeline(header)
                    .expect("drift mode always has a pipeline");
                let nwins = pipeline.nwins;
                self.trim_stamps(nwins + 2);

                let window = &header.windows[0];
                let ny_unbinned = f64::from(window.ny * header.ybin);
                let drift_transfer =
                    (ny_unbinned + 1.0) * constants::USPEC_FT_ROW + constants::USPEC_FT_OFF;

                if self.stamps.len() > nwins {
                    let texp =
                        (self.stamps[nwins - 1] - self.stamps[nwins]) * DSEC - drift_transfer;
                    (self.stamps[nwins] + texp / 2.0 / DSEC, texp)
                } else {
                    set_if_clean(
                        reason,
                        Unreliable::InsufficientHistory { needed: nwins + 1 },
                    );
                    (self.stamps[0] + expose / 2.0 / DSEC, expose)
                }
            }
            _ => {
                self.trim_stamps(3);
                if header.en_clr {
                    // Clear mode: the stamp precedes the clear, and the
                    // exposure delay is exact. Reliable from the first frame.
                    (
                        self.stamps[0] + (constants::USPEC_CLR_TIME + expose / 2.0) / DSEC,
                        expose,
                    )
                } else {
                    let frame_transfer = f64::from(constants::USPEC_FT_ROWS)
                        * constants::USPEC_FT_ROW
                        + constants::USPEC_FT_OFF;
                    if self.stamps.len() >= 2 {
                        let texp = (self.stamps[0] - self.stamps[1]) * DSEC - frame_transfer;
                        (self.stamps[0] + texp / 2.0 / DSEC, texp)
                    } else {
                        set_if_clean(reason, Unreliable::InsufficientHistory { needed: 1 });
                        (self.stamps[0] + expose / 2.0 / DSEC, expose)
                    }
                }
            }
        }
    }

    /// Averaged blue-channel time over the last `nblue` physical frames.
    fn blue_time(&mut self, nblue: usize, time: &Time, bad_blue: bool) -> Time {
        self.blue_times.push_front(time.clone());

        let blue = if bad_blue {
            // Placeholder frame: hand the standard time through unchanged.
            time.clone()
        } else {
            let ncont = nblue.min(self.blue_times.len());
            let oldest = &self.blue_times[ncont - 1];
            let newest = &self.blue_times[0];
            let mut start = oldest.mjd - oldest.expose / 2.0 / DSEC;
            let end = newest.mjd + newest.expose / 2.0 / DSEC;
            let mut expose = DSEC * (end - start);

            if ncont < nblue {
                // Scale the span up to the full accumulation; it cannot be
                // certified with contributors missing.
                expose *= nblue as f64 / ncont as f64;
                start = end - expose / DSEC;
                Time::unreliable(
                    (start + end) / 2.0,
                    expose,
                    Unreliable::InsufficientHistory { needed: nblue },
                )
            } else if self.blue_times.iter().take(ncont).any(|t| !t.good) {
                Time::unreliable(
                    (start + end) / 2.0,
                    expose,
                    Unreliable::ContributorUnreliable,
                )
            } else {
                Time::reliable((start + end) / 2.0, expose)
            }
        };

        if self.blue_times.len() > nblue {
            self.blue_times.pop_back();
        }
        blue
    }

    fn trim_stamps(&mut self, capacity: usize) {
        while self.stamps.len() > capacity {
            self.stamps.pop_back();
        }
    }
}

fn set_if_clean(slot: &mut Option<Unreliable>, reason: Unreliable) {
    if slot.is_none() {
        *slot = Some(reason);
    }
}

/// Civil date to MJD (proleptic Gregorian, Fliegel–Van Flandern).
fn gregorian_to_mjd(year: i32, month: u32, day: u32) -> f64 {
    let a = i64::from((14 - month) / 12);
    let y = i64::from(year) + 4800 - a;
    let m = i64::from(month) + 12 * a - 3;
    let jdn =
        i64::from(day) + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045;
    (jdn - 2400001) as f64
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn i16_at(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
