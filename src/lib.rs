//! # Depth Relay
//!
//! Capture core for structured-light depth sensors: a device thread pulls
//! video and depth frames from the driver, converts depth through a
//! calibration lookup table and publishes both streams through a
//! double-buffered frame store that renderers and recorders read from.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        DEVICE THREAD (capture::session)                   │
//! │  ┌──────────────┐  update()  ┌──────────────────────────────────────────┐ │
//! │  │ DepthSensor  │───────────▶│        FrameProducer (capture::producer) │ │
//! │  │ (driver)     │            │  video: copy ─▶ back ─▶ swap              │ │
//! │  └──────────────┘            │  depth: copy ─▶ back ─▶ swap + LUT        │ │
//! │         ▲                    └───────────────┬──────────────────────────┘ │
//! │         │ commands                           │         ▲ try-lock only     │
//! │         │                                    │  ┌──────┴───────────────┐  │
//! │         │                                    │  │ DepthCalibration     │  │
//! │         │                                    │  │ 2048-entry table     │  │
//! │         │                                    │  └──────▲───────────────┘  │
//! └─────────┼────────────────────────────────────┼─────────┼──────────────────┘
//!           │                                    ▼         │ setters (block)
//! ┌─────────┼──────────────────────────────────────────────┼──────────────────┐
//! │         │             FrameStore (frame::store)         │                  │
//! │         │   ┌─────────────────────┐  ┌─────────────────────┐              │
//! │         │   │ Video  front │ back │  │ Depth  front │ back │              │
//! │         │   └──────────┬──────────┘  └──────────┬──────────┘              │
//! └─────────┼──────────────┼────────────────────────┼───────────────────────┘
//!           │              ▼ updated(last_seen)     ▼
//! ┌─────────┴──────────────────────────────────────────────────────────────┐
//! │   CONSUMERS: render loop, FrameRecorder (recorder) ─▶ numbered files     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod depth;
pub mod error;
pub mod frame;
pub mod recorder;
pub mod sync;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sensor frame width for every stream
    pub const FRAME_WIDTH: u32 = 640;

    /// Frame height of the video, Bayer and depth streams
    pub const FRAME_HEIGHT: u32 = 480;

    /// Frame height of the infrared stream
    pub const IR_FRAME_HEIGHT: u32 = 488;

    /// Bytes per depth frame (16-bit samples)
    pub const DEPTH_FRAME_SIZE: usize = FRAME_WIDTH as usize * FRAME_HEIGHT as usize * 2;

    /// Device detection poll period
    pub const DEFAULT_DETECT_INTERVAL_MS: u64 = 500;

    /// Device thread pause after an update without new frames
    pub const DEFAULT_IDLE_SLEEP_MS: u64 = 1;

    /// Bounded wait for the device thread on stop
    pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2000;

    /// Event queue depth per subscriber
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Recording session directory prefix
    pub const DEFAULT_RECORD_PREFIX: &str = "Capture";

    /// Recorder wait for its frame lock before dropping the frame
    pub const DEFAULT_RECORD_LOCK_TIMEOUT_MS: u64 = 10;
}
