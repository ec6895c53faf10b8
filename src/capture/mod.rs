//! Sensor capture
//!
//! [`DepthSensor`] abstracts the driver, [`FrameProducer`] moves delivered
//! frames into the frame store, and [`CaptureSession`] runs the device thread.

pub mod device;
pub mod producer;
pub mod session;
pub mod synthetic;

pub use device::{DepthSensor, LedMode, StreamHandler, VideoMode};
pub use producer::{FrameProducer, ProducerStats};
pub use session::{CaptureCommand, CaptureEvent, CaptureSession, SessionStats};
pub use synthetic::{SyntheticControl, SyntheticSensor};
