//! Sensor driver capability
//!
//! The USB transport, device enumeration and raw callback delivery belong to
//! the driver. The capture loop only needs the narrow surface below: open and
//! close, per-stream setup and start/stop, LED control, and an `update` pump
//! that delivers pending frames synchronously to a [`StreamHandler`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{DEPTH_FRAME_SIZE, FRAME_HEIGHT, FRAME_WIDTH, IR_FRAME_HEIGHT};
use crate::error::DeviceError;
use crate::frame::{PixelFormat, Resolution};

/// Video stream encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    /// Decoded 24-bit RGB
    #[default]
    Rgb,
    /// Raw Bayer mosaic, 8-bit
    Bayer,
    /// Infrared, 8-bit
    Ir,
}

impl VideoMode {
    pub fn resolution(&self) -> Resolution {
        match self {
            VideoMode::Rgb | VideoMode::Bayer => Resolution::new(FRAME_WIDTH, FRAME_HEIGHT),
            VideoMode::Ir => Resolution::new(FRAME_WIDTH, IR_FRAME_HEIGHT),
        }
    }

    pub fn format(&self) -> PixelFormat {
        match self {
            VideoMode::Rgb => PixelFormat::Rgb,
            VideoMode::Bayer | VideoMode::Ir => PixelFormat::Luminance,
        }
    }

    /// Bytes per frame the driver delivers in this mode
    pub fn frame_size(&self) -> usize {
        self.resolution().pixel_count() * self.format().bytes_per_pixel()
    }

    pub fn name(&self) -> &'static str {
        match self {
            VideoMode::Rgb => "rgb",
            VideoMode::Bayer => "bayer",
            VideoMode::Ir => "ir",
        }
    }
}

impl FromStr for VideoMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(VideoMode::Rgb),
            "bayer" => Ok(VideoMode::Bayer),
            "ir" => Ok(VideoMode::Ir),
            other => Err(DeviceError::UnknownVideoMode(other.to_string())),
        }
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Depth stream layout: 11-bit samples in 16-bit words
pub fn depth_resolution() -> Resolution {
    Resolution::new(FRAME_WIDTH, FRAME_HEIGHT)
}

/// Bytes per depth frame
pub fn depth_frame_size() -> usize {
    DEPTH_FRAME_SIZE
}

/// Status LED states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedMode {
    #[default]
    Off,
    Green,
    Red,
    Yellow,
    BlinkGreen,
    BlinkRedYellow,
}

/// Receiver of frames pumped out of [`DepthSensor::update`].
///
/// Both methods run on the device thread inside the driver's call stack and
/// must never block.
pub trait StreamHandler {
    fn on_video(&mut self, data: &[u8], timestamp: u32);
    fn on_depth(&mut self, samples: &[u16], timestamp: u32);
}

/// Driver for a combined video and depth sensor
pub trait DepthSensor: Send {
    /// Open the first present device. `Ok(false)` means none is attached yet.
    fn open(&mut self) -> Result<bool, DeviceError>;

    /// Stop all streams and release the device. The capture loop switches
    /// the LED off first.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Select the video encoding. Streams must be stopped.
    fn setup_video(&mut self, mode: VideoMode) -> Result<(), DeviceError>;

    fn setup_depth(&mut self) -> Result<(), DeviceError>;

    fn start_video(&mut self) -> Result<(), DeviceError>;

    fn start_depth(&mut self) -> Result<(), DeviceError>;

    fn stop_video(&mut self) -> Result<(), DeviceError>;

    fn stop_depth(&mut self) -> Result<(), DeviceError>;

    fn set_led(&mut self, mode: LedMode) -> Result<(), DeviceError>;

    /// Process pending driver events, delivering any completed frames to
    /// `handler`. Returns `Ok(false)` once the device has gone away.
    fn update(&mut self, handler: &mut dyn StreamHandler) -> Result<bool, DeviceError>;

    /// Human readable device name
    fn name(&self) -> String {
        "depth sensor".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_mode_sizes() {
        assert_eq!(VideoMode::Rgb.frame_size(), 640 * 480 * 3);
        assert_eq!(VideoMode::Bayer.frame_size(), 640 * 480);
        assert_eq!(VideoMode::Ir.frame_size(), 640 * 488);
        assert_eq!(depth_frame_size(), depth_resolution().pixel_count() * 2);
    }

    #[test]
    fn test_video_mode_parse() {
        assert_eq!("IR".parse::<VideoMode>().unwrap(), VideoMode::Ir);
        assert_eq!(
            "yuv".parse::<VideoMode>().unwrap_err(),
            DeviceError::UnknownVideoMode("yuv".to_string())
        );
    }
}
