//! Synchronization primitives shared by the frame store and calibration

pub mod lock;

pub use lock::{LockControl, LockHandle};
