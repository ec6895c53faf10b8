//! Frames and the double-buffered frame store

pub mod buffer;
pub mod store;

pub use buffer::{Frame, FrameBuffer, PixelFormat, Resolution};
pub use store::{ChannelKind, ChannelStats, FrameStore, Select};
