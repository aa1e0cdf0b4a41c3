//! Byte-layout and clock-rate derivations.
//!
//! Everything in this module is a pure function of the [`FrameHeader`]: the
//! interleave layout the frame decoder needs to split a payload into per-CCD
//! windows, and the hardware clocking constants the timing engine needs to
//! model frame transfer and readout.
//!
//! The numeric values in [`constants`] are hardware calibrations taken from
//! the instrument teams' timing documents. They are not derivable from the
//! descriptor; treat any apparent discrepancy against real data as something
//! to report, not to re-fit.

use crate::descriptor::{FrameHeader, GainSpeed, Instrument, Mode};
use crate::types::WindowDescriptor;

/// Hardware timing calibrations (seconds unless noted).
pub mod constants {
    /// Vertical clock per row during frame transfer, early clock boards.
    pub const VCLOCK_FRAME_EARLY: f64 = 24.46e-6;
    /// Vertical clock per row in the storage area, early clock boards.
    pub const VCLOCK_STORAGE_EARLY: f64 = 23.3e-6;
    /// Base and per-step granularity of the programmable vertical clock.
    pub const VCLOCK_STEP: f64 = 6.0e-9;
    /// Horizontal (serial) clock per column.
    pub const HCLOCK: f64 = 0.48e-6;
    /// Correlated double sampling time per pixel, slow readout.
    pub const CDS_TIME_CDD: f64 = 10.0e-6;
    /// CDS time, fast readout.
    pub const CDS_TIME_FBB: f64 = 4.4e-6;
    /// CDS time, turbo readout.
    pub const CDS_TIME_FDD: f64 = 2.2e-6;
    /// Video pipeline switch time per pixel.
    pub const SWITCH_TIME: f64 = 1.2e-6;

    /// Rows shifted during an ULTRACAM frame transfer (image + dead rows).
    pub const UCAM_FT_ROWS: u32 = 1033;
    /// Additional rows clocked when clearing the chip before an exposure.
    pub const UCAM_CLEAR_EXTRA_ROWS: u32 = 1027;

    /// ULTRASPEC row transfer time.
    pub const USPEC_FT_ROW: f64 = 14.4e-6;
    /// ULTRASPEC fixed frame-transfer overhead.
    pub const USPEC_FT_OFF: f64 = 49.0e-6;
    /// ULTRASPEC full-chip clear time.
    pub const USPEC_CLR_TIME: f64 = 0.0309516;
    /// Rows in the ULTRASPEC drift pipeline.
    pub const USPEC_PIPELINE_ROWS: u32 = 1037;
    /// Rows shifted during a full ULTRASPEC frame transfer.
    pub const USPEC_FT_ROWS: u32 = 1072;
}

/// Interleave geometry of one ULTRACAM left/right window pair within the
/// flat payload sample array.
///
/// Samples of a pair arrive cyclically with period [`pitch`](Self::pitch):
/// `red-left, red-right, green-left, green-right, blue-left, blue-right`,
/// repeating for each successive pixel position. Right-hand windows are
/// digitised outward from the chip centre, so their column order is reversed
/// relative to the stored orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairLayout {
    /// Index of the pair's left window in `FrameHeader::windows`
    pub left: usize,
    /// Index of the pair's right window
    pub right: usize,
    /// Offset of the pair's first sample in the payload, in samples
    pub sample_offset: usize,
    /// Interleave period in samples
    pub pitch: usize,
}

/// Contiguous layout of one ULTRASPEC window within the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    /// Index of the window in `FrameHeader::windows`
    pub window: usize,
    /// Offset of the window's first sample in the payload, in samples
    pub sample_offset: usize,
}

/// Per-pair interleave layout for ULTRACAM payloads. Empty for ULTRASPEC.
pub fn pair_layouts(header: &FrameHeader) -> Vec<PairLayout> {
    if header.instrument != Instrument::Ultracam {
        return Vec::new();
    }
    // Three CCDs times left/right: six samples per binned pixel position.
    let pitch = 2 * header.instrument.ccd_count();
    let mut layouts = Vec::with_capacity(header.windows.len() / 2);
    let mut offset = 0usize;
    for (pair, pair_windows) in header.windows.chunks_exact(2).enumerate() {
        layouts.push(PairLayout {
            left: 2 * pair,
            right: 2 * pair + 1,
            sample_offset: offset,
            pitch,
        });
        offset += pitch * pair_windows[0].npix();
    }
    layouts
}

/// Sequential window layout for ULTRASPEC payloads. Empty for ULTRACAM.
pub fn window_layouts(header: &FrameHeader) -> Vec<WindowLayout> {
    if header.instrument != Instrument::Ultraspec {
        return Vec::new();
    }
    let mut layouts = Vec::with_capacity(header.windows.len());
    let mut offset = 0usize;
    for (index, window) in header.windows.iter().enumerate() {
        layouts.push(WindowLayout { window: index, sample_offset: offset });
        offset += window.npix();
    }
    layouts
}

/// The clocking rates in force for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockRates {
    /// Vertical clock per row during frame transfer, seconds
    pub vclock_frame: f64,
    /// Vertical clock per row in the storage area, seconds
    pub vclock_storage: f64,
    /// Horizontal clock per column, seconds
    pub hclock: f64,
    /// Video pipeline time per pixel (switch + CDS for the run's gain speed)
    pub video: f64,
}

impl ClockRates {
    /// Derive the rates for a run.
    ///
    /// Early-firmware runs predate the programmable vertical clock and use
    /// the fixed early-board values; later runs encode the clock setting in
    /// the descriptor's `V_FT_CLK` byte with a coarser step above 127.
    pub fn for_header(header: &FrameHeader) -> Self {
        let vclock_frame = match (header.timing_format(), header.v_ft_clk) {
            (1, _) | (_, None) => constants::VCLOCK_FRAME_EARLY,
            (_, Some(v)) if v >= 128 => {
                constants::VCLOCK_STEP * (40.0 + 320.0 * f64::from(v - 128))
            }
            (_, Some(v)) => constants::VCLOCK_STEP * (40.0 + 40.0 * f64::from(v)),
        };
        let vclock_storage = if header.timing_format() == 1 {
            constants::VCLOCK_STORAGE_EARLY
        } else {
            vclock_frame
        };
        let cds = match header.gain_speed {
            GainSpeed::Cdd => constants::CDS_TIME_CDD,
            GainSpeed::Fbb => constants::CDS_TIME_FBB,
            GainSpeed::Fdd => constants::CDS_TIME_FDD,
        };
        Self {
            vclock_frame,
            vclock_storage,
            hclock: constants::HCLOCK,
            video: constants::SWITCH_TIME + cds,
        }
    }
}

/// Geometry of a drift-mode readout pipeline.
///
/// In drift mode the window pair is not transferred through the whole chip;
/// several exposures stack up inside the image area at once, so the timing
/// engine needs to know how many windows sit in the pipeline between the
/// exposed region and the serial register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftPipeline {
    /// Windows in the pipeline at any instant
    pub nwins: usize,
    /// Rows of extra shift needed to keep the pipeline aligned
    pub pipe_shift: u32,
}

/// Drift pipeline geometry, `None` for non-drift modes.
pub fn drift_pipeline(header: &FrameHeader) -> Option<DriftPipeline> {
    let pipeline_rows = match header.mode {
        Mode::Drift => constants::UCAM_FT_ROWS,
        Mode::UspecDrift => constants::USPEC_PIPELINE_ROWS,
        _ => return None,
    };
    let window: &WindowDescriptor = header.windows.first()?;
    let ny_unbinned = window.ny * header.ybin;
    if ny_unbinned == 0 {
        return None;
    }
    let nwins =
        (((f64::from(pipeline_rows) / f64::from(ny_unbinned) + 1.0) / 2.0) as usize).max(1);
    let pipe_shift = pipeline_rows.saturating_sub((2 * nwins as u32 - 1) * ny_unbinned);
    Some(DriftPipeline { nwins, pipe_shift })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FrameHeader;

    fn pair_header(nx: u32, ny: u32) -> FrameHeader {
        let framesize = 32 + 6 * 2 * (nx as usize) * (ny as usize);
        let xml = format!(
            r#"<CCD_status>
 <data_status framesize="{framesize}">
  <header_status headerwords="16"/>
 </data_status>
 <instrument_status>
  <name>Ultracam</name>
  <application_status name="ap5_250_window1pair"/>
  <parameter_status name="X_BIN_FAC" value="1"/>
  <parameter_status name="Y_BIN_FAC" value="1"/>
  <parameter_status name="EXPOSE_TIME" value="500"/>
  <parameter_status name="GAIN_SPEED" value="{}"/>
  <parameter_status name="V_FT_CLK" value="140"/>
  <parameter_status name="X1L_START" value="100"/>
  <parameter_status name="X1R_START" value="600"/>
  <parameter_status name="Y1_START" value="1"/>
  <parameter_status name="X1_SIZE" value="{nx}"/>
  <parameter_status name="Y1_SIZE" value="{ny}"/>
 </instrument_status>
 <user><revision>120716</revision></user>
</CCD_status>"#,
            0xfbb
        );
        FrameHeader::parse(&xml).unwrap()
    }

    #[test]
    fn pair_layout_interleaves_with_period_six() {
        let header = pair_header(24, 10);
        let layouts = pair_layouts(&header);
        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].pitch, 6);
        assert_eq!(layouts[0].sample_offset, 0);
        assert_eq!((layouts[0].left, layouts[0].right), (0, 1));
    }

    #[test]
    fn programmable_vclock_uses_coarse_step_above_127() {
        let header = pair_header(24, 10);
        let rates = ClockRates::for_header(&header);
        // v_ft_clk = 140 -> 6 ns * (40 + 320 * 12)
        let expected = 6.0e-9 * (40.0 + 320.0 * 12.0);
        assert!((rates.vclock_frame - expected).abs() < 1e-15);
        assert_eq!(rates.vclock_storage, rates.vclock_frame);
        assert!((rates.video - (1.2e-6 + 4.4e-6)).abs() < 1e-15);
    }

    #[test]
    fn drift_pipeline_counts_windows_in_flight() {
        // ny_unbinned = 100 -> nwins = floor((1033/100 + 1)/2) = 5
        // pipe_shift = 1033 - 9*100 = 133
        let framesize = 32 + 6 * 2 * 24 * 100;
        let xml = format!(
            r#"<CCD_status>
 <data_status framesize="{framesize}">
  <header_status headerwords="16"/>
 </data_status>
 <instrument_status>
  <name>Ultracam</name>
  <application_status name="ap8_250_driftscan"/>
  <parameter_status name="X_BIN_FAC" value="1"/>
  <parameter_status name="Y_BIN_FAC" value="1"/>
  <parameter_status name="EXPOSE_TIME" value="10"/>
  <parameter_status name="X1L_START" value="100"/>
  <parameter_status name="X1R_START" value="600"/>
  <parameter_status name="Y1_START" value="1"/>
  <parameter_status name="X1_SIZE" value="24"/>
  <parameter_status name="Y1_SIZE" value="100"/>
 </instrument_status>
 <user><revision>130317</revision></user>
</CCD_status>"#
        );
        let header = FrameHeader::parse(&xml).unwrap();
        let pipeline = drift_pipeline(&header).unwrap();
        assert_eq!(pipeline.nwins, 5);
        assert_eq!(pipeline.pipe_shift, 133);
        assert!(drift_pipeline(&pair_header(24, 10)).is_none());
    }
}
