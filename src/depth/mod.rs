//! Depth calibration: range state, clipping policy and the lookup table

pub mod calibration;
pub mod range;
pub mod table;

pub use calibration::{CalibrationHandle, CalibrationState, DepthCalibration, DepthProcessor};
pub use range::{ClipMode, DepthRange};
pub use table::{DepthTable, DEPTH_TABLE_SIZE, RAW_DEPTH_MASK};
