//! Readout-window geometry and pixel data.

use serde::{Deserialize, Serialize};

/// Declared geometry of one readout window.
///
/// `llx`/`lly` locate the lower-left pixel of the window on the unbinned
/// detector grid (1-based, as the instrument counts); `nx`/`ny` are the
/// *binned* dimensions actually read out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    /// X position of the left-most pixels in the window (unbinned, 1-based)
    pub llx: u32,
    /// Y position of the lowest pixels in the window (unbinned, 1-based)
    pub lly: u32,
    /// X dimension in binned pixels
    pub nx: u32,
    /// Y dimension in binned pixels
    pub ny: u32,
}

impl WindowDescriptor {
    pub fn new(llx: u32, lly: u32, nx: u32, ny: u32) -> Self {
        Self { llx, lly, nx, ny }
    }

    /// Number of binned pixels in the window.
    pub fn npix(&self) -> usize {
        self.nx as usize * self.ny as usize
    }
}

/// One decoded window: geometry, binning and the samples read for it.
///
/// Pixel data is row-major from the lower-left corner, one `u16` sample per
/// binned pixel, exactly as digitised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    descriptor: WindowDescriptor,
    xbin: u32,
    ybin: u32,
    data: Vec<u16>,
}

impl Window {
    /// Create a window from its descriptor, binning factors and pixel data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` disagrees with the descriptor dimensions; the
    /// decoder always sizes the buffer from the descriptor, so a mismatch is
    /// a programming error rather than a data error.
    pub fn new(descriptor: WindowDescriptor, xbin: u32, ybin: u32, data: Vec<u16>) -> Self {
        assert_eq!(
            data.len(),
            descriptor.npix(),
            "window data length must match descriptor dimensions"
        );
        Self { descriptor, xbin, ybin, data }
    }

    pub fn descriptor(&self) -> &WindowDescriptor {
        &self.descriptor
    }

    /// X position of the left-most pixels (unbinned, 1-based).
    pub fn llx(&self) -> u32 {
        self.descriptor.llx
    }

    /// Y position of the lowest pixels (unbinned, 1-based).
    pub fn lly(&self) -> u32 {
        self.descriptor.lly
    }

    /// X dimension in binned pixels.
    pub fn nx(&self) -> u32 {
        self.descriptor.nx
    }

    /// Y dimension in binned pixels.
    pub fn ny(&self) -> u32 {
        self.descriptor.ny
    }

    pub fn xbin(&self) -> u32 {
        self.xbin
    }

    pub fn ybin(&self) -> u32 {
        self.ybin
    }

    /// Total number of binned pixels.
    pub fn npix(&self) -> usize {
        self.data.len()
    }

    /// Sample at binned coordinates (`x`, `y`), 0-based within the window.
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        assert!(x < self.nx() && y < self.ny(), "pixel index out of window bounds");
        self.data[(y * self.nx() + x) as usize]
    }

    /// One row of binned pixels, lowest row first.
    pub fn row(&self, y: u32) -> &[u16] {
        let nx = self.nx() as usize;
        let start = y as usize * nx;
        &self.data[start..start + nx]
    }

    /// The full row-major sample buffer.
    pub fn data(&self) -> &[u16] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_indexing_is_row_major_from_lower_left() {
        let desc = WindowDescriptor::new(100, 201, 3, 2);
        let win = Window::new(desc, 1, 1, vec![10, 11, 12, 20, 21, 22]);
        assert_eq!(win.pixel(0, 0), 10);
        assert_eq!(win.pixel(2, 0), 12);
        assert_eq!(win.pixel(0, 1), 20);
        assert_eq!(win.row(1), &[20, 21, 22]);
        assert_eq!(win.npix(), 6);
    }

    #[test]
    #[should_panic(expected = "window data length")]
    fn mismatched_buffer_is_rejected() {
        let desc = WindowDescriptor::new(1, 1, 4, 4);
        let _ = Window::new(desc, 1, 1, vec![0; 15]);
    }

    #[test]
    fn descriptor_pixel_count() {
        assert_eq!(WindowDescriptor::new(1, 1, 512, 1024).npix(), 512 * 1024);
    }
}
