//! Error types for the capture core

use thiserror::Error;

use crate::frame::PixelFormat;
use crate::recorder::RecordFormat;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Depth error: {0}")]
    Depth(#[from] DepthError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame and frame store contract violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Selection index out of range: {0}")]
    InvalidSelector(u8),

    #[error("Channel index out of range: {0}")]
    InvalidChannel(u8),

    #[error("Invalid resolution: {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    #[error("Incorrect frame size: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Depth calibration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepthError {
    #[error("Unknown clipping mode enumeration: {0}")]
    UnknownClipMode(u8),

    #[error("Unknown clipping mode name: {0}")]
    UnknownClipModeName(String),
}

/// Sensor driver failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Stream setup failed: {0}")]
    SetupFailed(String),

    #[error("Event processing failed: {0}")]
    EventsFailed(String),

    #[error("LED control failed: {0}")]
    LedFailed(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Unknown video mode: {0}")]
    UnknownVideoMode(String),

    #[error("Thread spawn failed: {0}")]
    Spawn(String),
}

/// Disk writer errors
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to create a unique subdirectory under {0}")]
    DirectoryExists(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write frame {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode frame {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("{format} output cannot hold {pixel_format:?} frames")]
    Unsupported {
        format: RecordFormat,
        pixel_format: PixelFormat,
    },

    #[error("Unknown record format: {0}")]
    UnknownFormat(String),

    #[error("Thread spawn failed: {0}")]
    Spawn(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
