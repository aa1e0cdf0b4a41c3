//! Byte sources for the frame stream.
//!
//! The decoder does not care where the fixed-size frame records come from;
//! it only needs seek-to-frame and read semantics. [`FileSource`] covers the
//! ordinary local `runNNN.dat` file. [`MemorySource`] wraps a byte buffer
//! that was already fetched by some other transport (or built by a test);
//! the remote file-server protocol itself lives outside this crate.
//!
//! Each open run owns exactly one source and its cursor; sources are never
//! shared.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A seekable stream of fixed-size frame records.
///
/// Frames are numbered from 1, matching the frame counter embedded in the
/// timing blocks.
pub trait ByteSource {
    /// Position the cursor at the start of frame `frame` (1-based).
    fn seek_to_frame(&mut self, frame: u64) -> io::Result<()>;

    /// Fill as much of `buf` as the stream allows and return the number of
    /// bytes read. A short count means end of stream, never an interrupted
    /// read.
    fn read_upto(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of *complete* frames the stream holds (stream length divided
    /// by the frame record size; a trailing partial record does not count).
    fn total_frames(&self) -> u64;
}

fn frame_offset(frame: u64, framesize: u64) -> io::Result<u64> {
    if frame == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame numbers start at 1"));
    }
    Ok((frame - 1) * framesize)
}

/// Local-file implementation over `runNNN.dat`.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    framesize: u64,
    len: u64,
}

impl FileSource {
    /// Open a data file for a run with the given frame record size.
    pub fn open<P: AsRef<Path>>(path: P, framesize: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, framesize: framesize as u64, len })
    }
}

impl ByteSource for FileSource {
    fn seek_to_frame(&mut self, frame: u64) -> io::Result<()> {
        let offset = frame_offset(frame, self.framesize)?;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_upto(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fully(&mut self.file, buf)
    }

    fn total_frames(&self) -> u64 {
        self.len / self.framesize
    }
}

/// In-memory implementation over an already-fetched byte buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    framesize: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, framesize: usize) -> Self {
        Self { data, pos: 0, framesize }
    }
}

impl ByteSource for MemorySource {
    fn seek_to_frame(&mut self, frame: u64) -> io::Result<()> {
        let offset = frame_offset(frame, self.framesize as u64)?;
        // Seeking past the end is allowed, as for files; the next read
        // simply comes up short.
        self.pos = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        Ok(())
    }

    fn read_upto(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.data.len() - self.pos;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn total_frames(&self) -> u64 {
        (self.data.len() / self.framesize) as u64
    }
}

/// Read until `buf` is full or the stream ends, retrying on interruption.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_counts_complete_frames_only() {
        let source = MemorySource::new(vec![0u8; 25], 10);
        assert_eq!(source.total_frames(), 2);
    }

    #[test]
    fn memory_source_seeks_by_one_based_frame() {
        let data: Vec<u8> = (0u8..30).collect();
        let mut source = MemorySource::new(data, 10);
        source.seek_to_frame(2).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(source.read_upto(&mut buf).unwrap(), 4);
        assert_eq!(buf, [10, 11, 12, 13]);

        assert!(source.seek_to_frame(0).is_err());
    }

    #[test]
    fn short_read_reports_partial_count() {
        let mut source = MemorySource::new(vec![7u8; 6], 6);
        source.seek_to_frame(1).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(source.read_upto(&mut buf).unwrap(), 6);
        assert_eq!(source.read_upto(&mut buf).unwrap(), 0);
    }

    #[test]
    fn file_source_round_trips_frames() {
        let path = std::env::temp_dir().join(format!("ucamraw-src-{}.dat", std::process::id()));
        std::fs::write(&path, (0u8..40).collect::<Vec<_>>()).unwrap();

        let mut source = FileSource::open(&path, 16).unwrap();
        assert_eq!(source.total_frames(), 2);
        source.seek_to_frame(2).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(source.read_upto(&mut buf).unwrap(), 16);
        assert_eq!(buf[0], 16);

        std::fs::remove_file(&path).ok();
    }
}
