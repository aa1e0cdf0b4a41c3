//! XML run-descriptor parsing.
//!
//! Every run comes as a pair of files: `runNNN.xml`, describing how the
//! instrument was configured, and `runNNN.dat`, the fixed-record frame
//! stream. This module turns the XML side into a validated [`FrameHeader`].
//!
//! ## Descriptor layout
//!
//! The nodes consumed here:
//!
//! - `data_status@framesize`: total bytes per frame record
//! - `data_status/header_status@headerwords`: timing block length in 2-byte words
//! - `instrument_status/name`: `Ultracam` or `Ultraspec`
//! - `application_status@name`: readout application template, mapped to a [`Mode`]
//! - `parameter_status@name/@value`: numeric setup parameters; which ones are
//!   required depends on the mode
//! - `user/revision`: firmware revision date, when present
//!
//! Validation is strict: an unknown application, a missing required parameter
//! or a declared `framesize` that disagrees with the window geometry are all
//! fatal, because every downstream byte offset is derived from them.

use std::collections::HashMap;

use tracing::debug;

use crate::error::HeaderError;
use crate::types::WindowDescriptor;

/// Bytes per binned pixel position in the stream: the three ULTRACAM CCDs are
/// interleaved as 3 × 2-byte samples, ULTRASPEC has a single CCD.
const ULTRACAM_BYTES_PER_PIXEL: usize = 6;
const ULTRASPEC_BYTES_PER_PIXEL: usize = 2;

/// A frame record at or below this size carries no pixel data at all and
/// marks an instrument power transition.
pub const POWER_FRAME_MAX_BYTES: usize = 32;

/// Firmware revision dates with a known timing-block layout.
const KNOWN_VERSIONS: &[i32] =
    &[-1, 70514, 80127, 100222, 110921, 111205, 120716, 120813, 130303, 130317, 140331];

/// Which camera produced the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Instrument {
    /// Triple-beam camera: red, green and blue CCDs read out together.
    Ultracam,
    /// Single-CCD high-speed camera.
    Ultraspec,
}

impl Instrument {
    /// Number of detectors read out per frame.
    pub fn ccd_count(self) -> usize {
        match self {
            Instrument::Ultracam => 3,
            Instrument::Ultraspec => 1,
        }
    }

    /// Stream bytes consumed per binned pixel position.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Instrument::Ultracam => ULTRACAM_BYTES_PER_PIXEL,
            Instrument::Ultraspec => ULTRASPEC_BYTES_PER_PIXEL,
        }
    }
}

/// Readout mode of a run.
///
/// Closed set: the timing engine and the geometry layer both match on this
/// exhaustively, so a new readout application cannot be wired in half-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Mode {
    /// Full frame with a clear before each exposure
    FullFrameClear,
    /// Full frame including overscan strips
    FullFrameOverscan,
    /// Full frame, no clear, minimal dead time
    FullFrameNoClear,
    /// One left/right window pair
    OnePair,
    /// Two left/right window pairs
    TwoPair,
    /// Three left/right window pairs
    ThreePair,
    /// Drift mode: a reduced-height pipeline window pair for high frame rates
    Drift,
    /// ULTRASPEC, one window
    UspecOneWindow,
    /// ULTRASPEC, two windows
    UspecTwoWindows,
    /// ULTRASPEC drift mode
    UspecDrift,
    /// Instrument power-up record, no science data
    PowerOn,
    /// Instrument power-down record, no science data
    PowerOff,
}

impl Mode {
    /// True for the data-free power transition records.
    pub fn is_power(self) -> bool {
        matches!(self, Mode::PowerOn | Mode::PowerOff)
    }

    /// Number of left/right window pairs read directly from parameters
    /// (ULTRACAM windowed modes only).
    fn ultracam_pairs(self) -> Option<usize> {
        match self {
            Mode::OnePair | Mode::Drift => Some(1),
            Mode::TwoPair => Some(2),
            Mode::ThreePair => Some(3),
            _ => None,
        }
    }

    /// Number of plain windows read from parameters (ULTRASPEC modes only).
    fn uspec_windows(self) -> Option<usize> {
        match self {
            Mode::UspecOneWindow | Mode::UspecDrift => Some(1),
            Mode::UspecTwoWindows => Some(2),
            _ => None,
        }
    }
}

/// CCD readout speed setting, which fixes the correlated-double-sampling time
/// used by the timing formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GainSpeed {
    /// Slow / lowest noise
    Cdd,
    /// Fast
    Fbb,
    /// Turbo
    Fdd,
}

/// Observing era of the run, where it changes how timestamps are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WhichRun {
    /// The first commissioning run: timestamps are offsets from a fixed
    /// reference date, with no calendar information at all.
    May2002,
    /// Every later run.
    Generic,
}

/// Validated, immutable description of a run, built once from the XML
/// descriptor and shared by the geometry, reader and timing layers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FrameHeader {
    pub instrument: Instrument,
    pub mode: Mode,
    /// Binning factors applied on readout
    pub xbin: u32,
    pub ybin: u32,
    /// Firmware revision date, -1 when the descriptor predates revisions
    pub version: i32,
    /// Timing block length in 2-byte words
    pub headerwords: usize,
    /// Total bytes per frame record, as declared and cross-checked
    pub framesize: usize,
    /// Window geometry in readout order; left/right pairs are adjacent for
    /// ULTRACAM
    pub windows: Vec<WindowDescriptor>,
    /// Exposure delay from the descriptor, seconds
    pub expose_time: f64,
    /// Seconds per exposure tick in the timing block
    pub time_units: f64,
    /// Blue-channel decimation factor (ULTRACAM; 1 = blue read every frame)
    pub nblue: u32,
    /// Readout speed (ULTRACAM)
    pub gain_speed: GainSpeed,
    /// Vertical clock setting byte, when the descriptor carries one
    pub v_ft_clk: Option<u8>,
    /// Clear-before-exposure enabled (ULTRASPEC)
    pub en_clr: bool,
    /// Observing era
    pub which_run: WhichRun,
}

impl FrameHeader {
    /// Parse and validate an XML run descriptor.
    pub fn parse(xml: &str) -> Result<Self, HeaderError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();

        let data_status = find_node(root, "data_status")?;
        let framesize: usize = parse_attr(data_status, "framesize")?;
        let header_status = find_node(root, "header_status")?;
        let headerwords: usize = parse_attr(header_status, "headerwords")?;

        let instrument = match find_node(root, "instrument_status")?
            .children()
            .find(|n| n.has_tag_name("name"))
            .and_then(|n| n.text())
            .map(str::trim)
        {
            Some(name) if name.eq_ignore_ascii_case("ultracam") => Instrument::Ultracam,
            Some(name) if name.eq_ignore_ascii_case("ultraspec") => Instrument::Ultraspec,
            _ => return Err(HeaderError::MissingNode("instrument_status/name")),
        };

        let app = find_node(root, "application_status")?
            .attribute("name")
            .ok_or(HeaderError::MissingNode("application_status@name"))?;

        let params: HashMap<&str, &str> = root
            .descendants()
            .filter(|n| n.has_tag_name("parameter_status"))
            .filter_map(|n| Some((n.attribute("name")?, n.attribute("value")?)))
            .collect();

        let mode = application_mode(app, &params)?;

        let user = root.descendants().find(|n| n.has_tag_name("user"));
        let version = match user
            .and_then(|u| u.children().find(|n| n.has_tag_name("revision")))
            .and_then(|n| n.text())
            .map(str::trim)
            .or_else(|| params.get("REVISION").copied())
        {
            Some(text) => text.parse::<i32>().map_err(|_| HeaderError::BadParameter {
                name: "revision".into(),
                value: text.into(),
            })?,
            None => -1,
        };

        if mode.is_power() {
            // Power records have no windows, no exposure and nothing worth
            // validating beyond their identity; the reader refuses them.
            return Ok(Self {
                instrument,
                mode,
                xbin: 1,
                ybin: 1,
                version,
                headerwords,
                framesize,
                windows: Vec::new(),
                expose_time: 0.0,
                time_units: 0.0,
                nblue: 1,
                gain_speed: GainSpeed::Cdd,
                v_ft_clk: None,
                en_clr: false,
                which_run: WhichRun::Generic,
            });
        }

        if !KNOWN_VERSIONS.contains(&version) {
            return Err(HeaderError::UnknownVersion(version));
        }

        let header = match instrument {
            Instrument::Ultracam => {
                let xbin = param_bin(&params, "X_BIN_FAC")?;
                let ybin = param_bin(&params, "Y_BIN_FAC")?;
                let time_units = 1.0e-4;
                let expose_time = f64::from(param_u32(&params, "EXPOSE_TIME")?) * time_units;
                let nblue = opt_param_u32(&params, "NBLUE")?.unwrap_or(1).max(1);
                let gain_speed = match opt_param_u32(&params, "GAIN_SPEED")? {
                    None | Some(0xcdd) => GainSpeed::Cdd,
                    Some(0xfbb) => GainSpeed::Fbb,
                    Some(0xfdd) => GainSpeed::Fdd,
                    Some(other) => {
                        return Err(HeaderError::BadParameter {
                            name: "GAIN_SPEED".into(),
                            value: format!("{other:#x}"),
                        });
                    }
                };
                let v_ft_clk = opt_param_u32(&params, "V_FT_CLK")?.map(|v| v as u8);
                let windows = ultracam_windows(mode, xbin, ybin, &params)?;
                let which_run = if version == -1 && user.is_none() {
                    WhichRun::May2002
                } else {
                    WhichRun::Generic
                };

                Self {
                    instrument,
                    mode,
                    xbin,
                    ybin,
                    version,
                    headerwords,
                    framesize,
                    windows,
                    expose_time,
                    time_units,
                    nblue,
                    gain_speed,
                    v_ft_clk,
                    en_clr: false,
                    which_run,
                }
            }
            Instrument::Ultraspec => {
                let xbin = param_bin(&params, "X_BIN")?;
                let ybin = param_bin(&params, "Y_BIN")?;
                let time_units = 1.0e-3;
                let expose_time = f64::from(param_u32(&params, "DWELL")?) * time_units;
                let en_clr = opt_param_u32(&params, "EN_CLR")?.unwrap_or(0) != 0;
                let windows = uspec_windows(mode, &params)?;

                Self {
                    instrument,
                    mode,
                    xbin,
                    ybin,
                    version,
                    headerwords,
                    framesize,
                    windows,
                    expose_time,
                    time_units,
                    nblue: 1,
                    gain_speed: GainSpeed::Cdd,
                    v_ft_clk: None,
                    en_clr,
                    which_run: WhichRun::Generic,
                }
            }
        };

        header.validate()?;

        debug!(
            instrument = ?header.instrument,
            mode = ?header.mode,
            version = header.version,
            windows = header.windows.len(),
            framesize = header.framesize,
            "parsed run descriptor"
        );

        Ok(header)
    }

    /// Length of the timing block in bytes.
    pub fn timing_bytes(&self) -> usize {
        2 * self.headerwords
    }

    /// Timing-block protocol in force for this run: 1 is the legacy layout
    /// carrying a satellite count, 2 the later layout carrying a GPS status
    /// word. ULTRASPEC never used the legacy layout.
    pub fn timing_format(&self) -> u8 {
        match (self.instrument, self.version) {
            (Instrument::Ultraspec, _) => 2,
            (_, -1 | 70514 | 80127) => 1,
            _ => 2,
        }
    }

    /// Expected pixel payload length in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.instrument.bytes_per_pixel()
            * self.windows.iter().map(WindowDescriptor::npix).sum::<usize>()
    }

    /// True when the run is a power transition record rather than science
    /// data, by mode or by its tell-tale data-free record size.
    pub fn is_power_on_off(&self) -> bool {
        self.mode.is_power() || self.framesize <= POWER_FRAME_MAX_BYTES
    }

    /// Cross-check the declared framesize against the window geometry, and
    /// make sure the timing block is long enough to hold every field the
    /// timing engine reads (the GPS status word ends at byte 26).
    fn validate(&self) -> Result<(), HeaderError> {
        if self.timing_bytes() < 26 {
            return Err(HeaderError::BadParameter {
                name: "headerwords".into(),
                value: self.headerwords.to_string(),
            });
        }
        let computed = self.timing_bytes() + self.payload_bytes();
        if self.framesize != computed {
            return Err(HeaderError::FramesizeMismatch { declared: self.framesize, computed });
        }
        Ok(())
    }
}

fn find_node<'a>(
    root: roxmltree::Node<'a, 'a>,
    tag: &'static str,
) -> Result<roxmltree::Node<'a, 'a>, HeaderError> {
    root.descendants().find(|n| n.has_tag_name(tag)).ok_or(HeaderError::MissingNode(tag))
}

fn parse_attr(node: roxmltree::Node<'_, '_>, attr: &'static str) -> Result<usize, HeaderError> {
    let raw = node.attribute(attr).ok_or(HeaderError::MissingNode(attr))?;
    raw.trim()
        .parse()
        .map_err(|_| HeaderError::BadParameter { name: attr.into(), value: raw.into() })
}

fn param_u32(params: &HashMap<&str, &str>, name: &str) -> Result<u32, HeaderError> {
    opt_param_u32(params, name)?.ok_or_else(|| HeaderError::MissingParameter(name.into()))
}

/// Binning factors divide fixed chip dimensions, so zero is unusable.
fn param_bin(params: &HashMap<&str, &str>, name: &str) -> Result<u32, HeaderError> {
    match param_u32(params, name)? {
        0 => Err(HeaderError::BadParameter { name: name.into(), value: "0".into() }),
        bin => Ok(bin),
    }
}

fn opt_param_u32(params: &HashMap<&str, &str>, name: &str) -> Result<Option<u32>, HeaderError> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) => {
            // Values are decimal except for the occasional 0x-prefixed flag.
            let trimmed = raw.trim();
            let parsed = match trimmed.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => trimmed.parse(),
            };
            parsed.map(Some).map_err(|_| HeaderError::BadParameter {
                name: name.into(),
                value: (*raw).into(),
            })
        }
    }
}

/// Static readout-application table. Both the original and the later
/// `_cfg` template names are accepted.
fn application_mode(
    app: &str,
    params: &HashMap<&str, &str>,
) -> Result<Mode, HeaderError> {
    let mode = match app {
        "ap3_250_fullframe" | "appl3_fullframe_cfg" => Mode::FullFrameClear,
        "ap4_frameover" | "appl4_frameover_cfg" => Mode::FullFrameOverscan,
        "ap9_250_fullframe_mindead" | "appl9_fullframe_mindead_cfg" => Mode::FullFrameNoClear,
        "ap5_250_window1pair" | "appl5_window1pair_cfg" => Mode::OnePair,
        "ap6_250_window2pair" | "appl6_window2pair_cfg" => Mode::TwoPair,
        "ap7_250_window3pair" | "appl7_window3pair_cfg" => Mode::ThreePair,
        "ap8_250_driftscan" | "appl8_driftscan_cfg" => Mode::Drift,
        "ap1_250_poweron" | "appl1_pon_cfg" => Mode::PowerOn,
        "ap2_250_poweroff" | "appl2_pof_cfg" => Mode::PowerOff,
        // The single windowed application of ULTRASPEC covers both window
        // counts; the second window's parameters decide which.
        "ccd201_winbin_con" | "ccd201_winbin_cfg" => {
            if params.contains_key("X2_START") {
                Mode::UspecTwoWindows
            } else {
                Mode::UspecOneWindow
            }
        }
        "ccd201_driftscan_cfg" => Mode::UspecDrift,
        other => return Err(HeaderError::UnknownApplication(other.into())),
    };
    Ok(mode)
}

/// Build the ULTRACAM window list. Full-frame modes synthesize the two fixed
/// half-frame windows; windowed modes read each pair's geometry from the
/// parameters, left window first.
fn ultracam_windows(
    mode: Mode,
    xbin: u32,
    ybin: u32,
    params: &HashMap<&str, &str>,
) -> Result<Vec<WindowDescriptor>, HeaderError> {
    match mode {
        Mode::FullFrameClear | Mode::FullFrameNoClear => Ok(vec![
            WindowDescriptor::new(1, 1, 512 / xbin, 1024 / ybin),
            WindowDescriptor::new(513, 1, 512 / xbin, 1024 / ybin),
        ]),
        Mode::FullFrameOverscan => Ok(vec![
            WindowDescriptor::new(1, 1, 540 / xbin, 1032 / ybin),
            WindowDescriptor::new(541, 1, 540 / xbin, 1032 / ybin),
        ]),
        _ => {
            let npairs = mode
                .ultracam_pairs()
                .expect("ULTRACAM windowed mode must declare its pair count");
            let mut windows = Vec::with_capacity(2 * npairs);
            for n in 1..=npairs {
                let llxl = param_u32(params, &format!("X{n}L_START"))?;
                let llxr = param_u32(params, &format!("X{n}R_START"))?;
                let lly = param_u32(params, &format!("Y{n}_START"))?;
                let nx = param_u32(params, &format!("X{n}_SIZE"))?;
                let ny = param_u32(params, &format!("Y{n}_SIZE"))?;
                windows.push(WindowDescriptor::new(llxl, lly, nx, ny));
                windows.push(WindowDescriptor::new(llxr, lly, nx, ny));
            }
            Ok(windows)
        }
    }
}

fn uspec_windows(
    mode: Mode,
    params: &HashMap<&str, &str>,
) -> Result<Vec<WindowDescriptor>, HeaderError> {
    let nwin = mode.uspec_windows().expect("ULTRASPEC mode must declare its window count");
    let mut windows = Vec::with_capacity(nwin);
    for n in 1..=nwin {
        let llx = param_u32(params, &format!("X{n}_START"))?;
        let lly = param_u32(params, &format!("Y{n}_START"))?;
        let nx = param_u32(params, &format!("X{n}_SIZE"))?;
        let ny = param_u32(params, &format!("Y{n}_SIZE"))?;
        windows.push(WindowDescriptor::new(llx, lly, nx, ny));
    }
    Ok(windows)
}
