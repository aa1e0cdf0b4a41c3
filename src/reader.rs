//! Run reader: frame access and payload de-interleaving.
//!
//! A [`Run`] owns everything needed to decode one run: the parsed
//! [`FrameHeader`], a [`ByteSource`] positioned over the frame stream, the
//! sequential read counter and the [`TimingState`]. Nothing is shared, so
//! any number of runs can decode side by side.
//!
//! Reads can be sequential (`None`), by absolute frame number, or `Some(0)`
//! for the last complete frame in the stream. Only sequential reads preserve
//! the timing history; see [`crate::timing`] for why a seek costs confidence.
//!
//! Reaching the end of the stream is not a fault: [`Run::next_frame`] returns
//! `Ok(None)` there, and the `Iterator` impl simply stops, while the lower
//! level [`Run::read`] reports [`DecodeError::EndOfData`] for callers that
//! want to distinguish it themselves.

use std::path::Path;

use tracing::trace;

use crate::descriptor::{FrameHeader, Instrument};
use crate::error::{DecodeError, Result};
use crate::geometry::{self, ClockRates};
use crate::source::{ByteSource, FileSource, MemorySource};
use crate::timing::{TimingResult, TimingState};
use crate::types::{Ccd, DecodedFrame, Window};

/// An open run: header, byte source and timing memory.
#[derive(Debug)]
pub struct Run<S: ByteSource> {
    header: FrameHeader,
    rates: ClockRates,
    source: S,
    /// Frame a plain sequential read will return next (1-based)
    next_seq: u64,
    timing: TimingState,
}

impl Run<FileSource> {
    /// Open a run from its file pair: `<stem>.xml` descriptor and
    /// `<stem>.dat` frame stream.
    pub fn open<P: AsRef<Path>>(stem: P) -> Result<Self> {
        let stem = stem.as_ref();
        let xml_path = stem.with_extension("xml");
        let xml = std::fs::read_to_string(&xml_path)
            .map_err(|e| DecodeError::file_error(xml_path, e))?;
        let header = FrameHeader::parse(&xml)?;
        let dat_path = stem.with_extension("dat");
        let source = FileSource::open(&dat_path, header.framesize)
            .map_err(|e| DecodeError::file_error(dat_path, e))?;
        Self::new(header, source)
    }
}

impl Run<MemorySource> {
    /// Build a run over in-memory bytes (tests, or data fetched by another
    /// transport).
    pub fn from_bytes(xml: &str, data: Vec<u8>) -> Result<Self> {
        let header = FrameHeader::parse(xml)?;
        let source = MemorySource::new(data, header.framesize);
        Self::new(header, source)
    }
}

impl<S: ByteSource> Run<S> {
    /// Wrap a parsed header and a positioned source.
    ///
    /// Fails with [`DecodeError::PowerOnOff`] for power transition records,
    /// which carry no science frames at all.
    pub fn new(header: FrameHeader, source: S) -> Result<Self> {
        if header.is_power_on_off() {
            return Err(DecodeError::PowerOnOff);
        }
        let rates = ClockRates::for_header(&header);
        Ok(Self { header, rates, source, next_seq: 1, timing: TimingState::new() })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Complete frames currently in the stream.
    pub fn total_frames(&self) -> u64 {
        self.source.total_frames()
    }

    /// Frame a plain sequential read will return next.
    pub fn next_frame_number(&self) -> u64 {
        self.next_seq
    }

    /// Read and decode one frame.
    ///
    /// `None` reads the next sequential frame, `Some(0)` the last complete
    /// frame in the stream, any other value seeks to that frame directly.
    pub fn read(&mut self, frame: Option<u64>) -> Result<DecodedFrame> {
        let target = self.position(frame)?;
        let timing = self.decode_timing(target)?;

        let expected = self.header.payload_bytes();
        let mut payload = vec![0u8; expected];
        let got = self.source.read_upto(&mut payload)?;
        if got < expected {
            return Err(DecodeError::Truncated { frame: target, expected, got });
        }

        let ccds = self.split_payload(&payload);
        self.next_seq = target + 1;
        trace!(frame = target, ccds = ccds.len(), "decoded frame");

        Ok(DecodedFrame {
            number: target,
            ccds,
            time: timing.time,
            blue_time: timing.blue_time,
            bad_blue: timing.bad_blue,
            timing: timing.info,
        })
    }

    /// Sequential iteration form of [`read`](Self::read): `Ok(None)` at the
    /// end of the stream instead of an error.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        match self.read(None) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.is_end_of_data() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reconstruct a frame's timing without materialising its pixels.
    ///
    /// Shares the sequential-history rules with [`read`](Self::read), so a
    /// pure timing scan earns the same accuracy a full decode would.
    pub fn read_time(&mut self, frame: Option<u64>) -> Result<TimingResult> {
        let target = self.position(frame)?;
        let timing = self.decode_timing(target)?;
        self.next_seq = target + 1;
        Ok(timing)
    }

    /// Sequential iteration form of [`read_time`](Self::read_time).
    pub fn next_time(&mut self) -> Result<Option<TimingResult>> {
        match self.read_time(None) {
            Ok(timing) => Ok(Some(timing)),
            Err(e) if e.is_end_of_data() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve the target frame and position the source on it.
    fn position(&mut self, frame: Option<u64>) -> Result<u64> {
        let target = match frame {
            None => self.next_seq,
            Some(0) => {
                let total = self.source.total_frames();
                if total == 0 {
                    return Err(DecodeError::EndOfData);
                }
                total
            }
            Some(n) => {
                let total = self.source.total_frames();
                if n > total {
                    return Err(DecodeError::FrameOutOfRange { frame: n, total });
                }
                n
            }
        };
        self.source.seek_to_frame(target)?;
        Ok(target)
    }

    /// Read the timing block and run the timing engine over it. A short read
    /// here is the expected end of the stream.
    fn decode_timing(&mut self, target: u64) -> Result<TimingResult> {
        let mut tbytes = vec![0u8; self.header.timing_bytes()];
        let got = self.source.read_upto(&mut tbytes)?;
        if got < tbytes.len() {
            return Err(DecodeError::EndOfData);
        }
        Ok(self.timing.update(&self.header, &self.rates, &tbytes, target))
    }

    /// Split a payload into per-CCD windows.
    fn split_payload(&self, payload: &[u8]) -> Vec<Ccd> {
        let samples: Vec<u16> =
            payload.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        let xbin = self.header.xbin;
        let ybin = self.header.ybin;

        match self.header.instrument {
            Instrument::Ultracam => {
                let mut ccds: Vec<Vec<Window>> =
                    (0..self.header.instrument.ccd_count()).map(|_| Vec::new()).collect();

                for layout in geometry::pair_layouts(&self.header) {
                    let left = self.header.windows[layout.left];
                    let right = self.header.windows[layout.right];
                    let nx = left.nx as usize;
                    let npix = left.npix();

                    for (ccd, windows) in ccds.iter_mut().enumerate() {
                        let mut ldata = Vec::with_capacity(npix);
                        let mut rdata = vec![0u16; npix];
                        for i in 0..npix {
                            let base = layout.sample_offset + layout.pitch * i + 2 * ccd;
                            ldata.push(samples[base]);
                            // The right-hand window is digitised outward from
                            // the chip centre: reverse its columns.
                            let y = i / nx;
                            let x = i % nx;
                            rdata[y * nx + (nx - 1 - x)] = samples[base + 1];
                        }
                        windows.push(Window::new(left, xbin, ybin, ldata));
                        windows.push(Window::new(right, xbin, ybin, rdata));
                    }
                }
                ccds.into_iter().map(Ccd::new).collect()
            }
            Instrument::Ultraspec => {
                let windows = geometry::window_layouts(&self.header)
                    .into_iter()
                    .map(|layout| {
                        let desc = self.header.windows[layout.window];
                        let data = samples
                            [layout.sample_offset..layout.sample_offset + desc.npix()]
                            .to_vec();
                        Window::new(desc, xbin, ybin, data)
                    })
                    .collect();
                vec![Ccd::new(windows)]
            }
        }
    }
}

impl<S: ByteSource> Iterator for Run<S> {
    type Item = Result<DecodedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Mode;
    use crate::types::Unreliable;

    const NX: usize = 4;
    const NY: usize = 3;
    const TIMING: usize = 32;
    const FRAMESIZE: usize = TIMING + 6 * 2 * NX * NY;

    fn pair_xml() -> String {
        format!(
            r#"<CCD_status>
 <data_status framesize="{FRAMESIZE}">
  <header_status headerwords="16"/>
 </data_status>
 <instrument_status>
  <name>Ultracam</name>
  <application_status name="ap5_250_window1pair"/>
  <parameter_status name="X_BIN_FAC" value="1"/>
  <parameter_status name="Y_BIN_FAC" value="1"/>
  <parameter_status name="EXPOSE_TIME" value="500"/>
  <parameter_status name="X1L_START" value="100"/>
  <parameter_status name="X1R_START" value="600"/>
  <parameter_status name="Y1_START" value="1"/>
  <parameter_status name="X1_SIZE" value="{NX}"/>
  <parameter_status name="Y1_SIZE" value="{NY}"/>
 </instrument_status>
 <user><revision>120716</revision></user>
</CCD_status>"#
        )
    }

    /// Seconds placing stamps in the 2005-2010 default-convention window.
    const SECS_2008: u32 = ((54466.0 - 40587.0) * 86400.0) as u32;

    /// One synthetic frame: format-2 timing block plus an interleaved
    /// payload. Each sample encodes (pair position, ccd, side) so the
    /// de-interleave can be checked exactly.
    fn frame_bytes(number: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; FRAMESIZE];
        bytes[4..8].copy_from_slice(&number.to_le_bytes());
        bytes[8..12].copy_from_slice(&500u32.to_le_bytes());
        bytes[12..16].copy_from_slice(&(SECS_2008 + number).to_le_bytes());
        // status word stays 0: all clear

        for i in 0..(NX * NY) {
            for ccd in 0..3u16 {
                for side in 0..2u16 {
                    let sample = 1000 * (i as u16) + 10 * ccd + side;
                    let off = TIMING + 2 * (6 * i + 2 * ccd as usize + side as usize);
                    bytes[off..off + 2].copy_from_slice(&sample.to_le_bytes());
                }
            }
        }
        bytes
    }

    fn run_bytes(frames: u32) -> Vec<u8> {
        (1..=frames).flat_map(frame_bytes).collect()
    }

    #[test]
    fn construction_validates_and_counts_frames() {
        let run = Run::from_bytes(&pair_xml(), run_bytes(3)).unwrap();
        assert_eq!(run.total_frames(), 3);
        assert_eq!(run.header().mode, Mode::OnePair);
        assert_eq!(run.next_frame_number(), 1);
    }

    #[test]
    fn deinterleave_routes_every_sample_home() {
        let mut run = Run::from_bytes(&pair_xml(), run_bytes(1)).unwrap();
        let frame = run.read(None).unwrap();
        assert_eq!(frame.ccds.len(), 3);

        for (ccd_index, ccd) in frame.ccds.iter().enumerate() {
            assert_eq!(ccd.windows.len(), 2);
            let left = &ccd.windows[0];
            let right = &ccd.windows[1];
            assert_eq!(left.llx(), 100);
            assert_eq!(right.llx(), 600);

            for y in 0..NY as u32 {
                for x in 0..NX as u32 {
                    let i = (y * NX as u32 + x) as u16;
                    assert_eq!(left.pixel(x, y), 1000 * i + 10 * ccd_index as u16);
                    // right-hand columns arrive reversed
                    let stored = right.pixel(NX as u32 - 1 - x, y);
                    assert_eq!(stored, 1000 * i + 10 * ccd_index as u16 + 1);
                }
            }
        }
    }

    #[test]
    fn sequential_reads_never_lose_history() {
        let mut run = Run::from_bytes(&pair_xml(), run_bytes(5)).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = run.next_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 5);
        assert!(!frames[0].time.good, "first frame has no history");
        for frame in &frames[1..] {
            assert!(frame.time.good, "frame {} lost reliability", frame.number);
        }
    }

    #[test]
    fn seeking_is_observably_less_reliable_than_sequential_reading() {
        let data = run_bytes(5);

        let mut sequential = Run::from_bytes(&pair_xml(), data.clone()).unwrap();
        let mut fifth = None;
        for _ in 0..5 {
            fifth = Some(sequential.read(None).unwrap());
        }
        assert!(fifth.unwrap().time.good);

        let mut seeky = Run::from_bytes(&pair_xml(), data).unwrap();
        seeky.read(None).unwrap();
        let jumped = seeky.read(Some(5)).unwrap();
        assert!(!jumped.time.good);
        assert_eq!(
            jumped.time.reason,
            Some(Unreliable::InsufficientHistory { needed: 1 })
        );
    }

    #[test]
    fn zero_targets_the_last_complete_frame() {
        let mut run = Run::from_bytes(&pair_xml(), run_bytes(4)).unwrap();
        let last = run.read(Some(0)).unwrap();
        assert_eq!(last.number, 4);
        // and the sequential cursor follows
        assert!(run.next_frame().unwrap().is_none());
    }

    #[test]
    fn end_of_data_is_a_sentinel_not_a_fault() {
        let mut run = Run::from_bytes(&pair_xml(), run_bytes(2)).unwrap();
        assert!(run.next_frame().unwrap().is_some());
        assert!(run.next_frame().unwrap().is_some());
        assert!(run.next_frame().unwrap().is_none());
        assert!(run.next_frame().unwrap().is_none(), "EndOfData must be repeatable");

        // the lower-level read reports it as the EndOfData variant
        assert!(matches!(run.read(None), Err(DecodeError::EndOfData)));
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let mut data = run_bytes(2);
        data.truncate(FRAMESIZE + TIMING + 10);
        let mut run = Run::from_bytes(&pair_xml(), data).unwrap();
        run.read(None).unwrap();
        match run.read(None) {
            Err(DecodeError::Truncated { frame, expected, got }) => {
                assert_eq!(frame, 2);
                assert_eq!(expected, FRAMESIZE - TIMING);
                assert_eq!(got, 10);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_seek_is_reported() {
        let mut run = Run::from_bytes(&pair_xml(), run_bytes(2)).unwrap();
        assert!(matches!(
            run.read(Some(7)),
            Err(DecodeError::FrameOutOfRange { frame: 7, total: 2 })
        ));
    }

    #[test]
    fn power_on_run_is_refused_at_construction() {
        let xml = r#"<CCD_status>
 <data_status framesize="32">
  <header_status headerwords="16"/>
 </data_status>
 <instrument_status>
  <name>Ultracam</name>
  <application_status name="ap1_250_poweron"/>
 </instrument_status>
</CCD_status>"#;
        match Run::from_bytes(xml, vec![0u8; 64]) {
            Err(DecodeError::PowerOnOff) => {}
            other => panic!("expected PowerOnOff, got {other:?}"),
        }
    }

    #[test]
    fn time_scan_matches_full_decode() {
        let data = run_bytes(4);
        let mut full = Run::from_bytes(&pair_xml(), data.clone()).unwrap();
        let mut scan = Run::from_bytes(&pair_xml(), data).unwrap();

        loop {
            let frame = full.next_frame().unwrap();
            let timing = scan.next_time().unwrap();
            match (frame, timing) {
                (Some(frame), Some(timing)) => {
                    assert_eq!(frame.time, timing.time);
                    assert_eq!(frame.timing, timing.info);
                }
                (None, None) => break,
                other => panic!("scan and decode diverged: {other:?}"),
            }
        }
    }

    #[test]
    fn iterator_yields_every_frame_in_order() {
        let run = Run::from_bytes(&pair_xml(), run_bytes(3)).unwrap();
        let numbers: Vec<u64> =
            run.map(|frame| frame.unwrap().number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
