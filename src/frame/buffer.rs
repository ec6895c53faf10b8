//! Lockable pixel buffers
//!
//! A [`Frame`] is the unit the frame store swaps between front and back.
//! Its lock is the only authority over who may read or write the pixels.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FrameError;
use crate::sync::{LockControl, LockHandle};

/// Sample layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit alpha
    Alpha,
    /// 8-bit luminance (Bayer and infrared video)
    Luminance,
    /// 16-bit depth
    Depth,
    /// 32-bit float displacement
    Displacement,
    /// 24-bit colour
    #[default]
    Rgb,
    /// 32-bit colour with alpha
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Alpha | PixelFormat::Luminance => 1,
            PixelFormat::Depth => 2,
            PixelFormat::Rgb => 3,
            PixelFormat::Displacement | PixelFormat::Rgba => 4,
        }
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel storage of a frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameBuffer {
    resolution: Resolution,
    format: PixelFormat,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// Empty buffer with no allocation
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate storage for the given resolution and format.
    /// Contents are zeroed.
    pub fn create(&mut self, resolution: Resolution, format: PixelFormat) -> Result<(), FrameError> {
        if resolution.is_empty() {
            return Err(FrameError::InvalidResolution {
                width: resolution.width,
                height: resolution.height,
            });
        }

        let size = resolution.pixel_count() * format.bytes_per_pixel();
        self.data.clear();
        self.data.resize(size, 0);
        self.resolution = resolution;
        self.format = format;
        Ok(())
    }

    /// Zero fill the pixels, keeping the allocation
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_line(&self) -> usize {
        self.resolution.width as usize * self.format.bytes_per_pixel()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy raw bytes into the start of the buffer.
    /// Returns the number of bytes copied, bounded by both lengths.
    pub fn write_bytes(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.data.len());
        self.data[..count].copy_from_slice(&src[..count]);
        count
    }

    /// Make this buffer an exact copy of `other`, reallocating if needed
    pub fn copy_from(&mut self, other: &FrameBuffer) {
        self.resolution = other.resolution;
        self.format = other.format;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }

    /// Number of 16-bit samples held
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    /// Read one native-endian 16-bit sample
    pub fn sample(&self, index: usize) -> Option<u16> {
        let start = index.checked_mul(2)?;
        let bytes = self.data.get(start..start + 2)?;
        Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
    }

    /// Rewrite every 16-bit sample in place
    pub fn map_samples(&mut self, mut f: impl FnMut(u16) -> u16) {
        for chunk in self.data.chunks_exact_mut(2) {
            let value = f(u16::from_ne_bytes([chunk[0], chunk[1]]));
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Write 16-bit samples into the start of the buffer.
    /// Returns the number of samples written.
    pub fn write_samples(&mut self, src: &[u16]) -> usize {
        let mut written = 0;
        for (chunk, value) in self.data.chunks_exact_mut(2).zip(src) {
            chunk.copy_from_slice(&value.to_ne_bytes());
            written += 1;
        }
        written
    }
}

/// A pixel buffer guarded by its own lock
#[derive(Debug, Default)]
pub struct Frame {
    buffer: LockHandle<FrameBuffer>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame pre-allocated for a resolution and format
    pub fn with_format(resolution: Resolution, format: PixelFormat) -> Result<Self, FrameError> {
        let mut buffer = FrameBuffer::new();
        buffer.create(resolution, format)?;
        Ok(Self {
            buffer: LockHandle::new(buffer),
        })
    }

    /// Scope-bound controller over the pixels. Starts unlocked.
    pub fn control(&self) -> LockControl<'_, FrameBuffer> {
        self.buffer.control()
    }

    pub fn is_locked(&self) -> bool {
        self.buffer.is_locked()
    }
}
