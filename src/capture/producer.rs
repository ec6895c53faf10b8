//! Device-side frame delivery
//!
//! Runs inside the driver's update pump. Each delivered frame is copied into
//! the back buffer of its channel and published with a swap. Nothing here ever
//! waits for a lock: a busy back buffer or a failed swap drops the frame.

use std::sync::Arc;

use crate::capture::device::{depth_frame_size, depth_resolution, StreamHandler, VideoMode};
use crate::depth::DepthProcessor;
use crate::error::FrameError;
use crate::frame::{ChannelKind, FrameStore, PixelFormat};

/// Frames delivered and dropped per channel since the producer was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub video_frames: u64,
    pub video_dropped: u64,
    pub depth_frames: u64,
    pub depth_dropped: u64,
}

/// Copies driver frames into the store and publishes them
pub struct FrameProducer {
    store: Arc<FrameStore>,
    depth: DepthProcessor,
    video_time: u32,
    depth_time: u32,
    stats: ProducerStats,
}

impl FrameProducer {
    pub fn new(store: Arc<FrameStore>, depth: DepthProcessor) -> Self {
        Self {
            store,
            depth,
            video_time: 0,
            depth_time: 0,
            stats: ProducerStats::default(),
        }
    }

    /// Allocate the video channel for a mode
    pub fn setup_video(&self, mode: VideoMode) -> Result<(), FrameError> {
        self.store.setup_channel(
            ChannelKind::Video,
            mode.resolution(),
            mode.format(),
            Some(mode.frame_size()),
        )
    }

    /// Allocate the depth channel
    pub fn setup_depth(&self) -> Result<(), FrameError> {
        self.store.setup_channel(
            ChannelKind::Depth,
            depth_resolution(),
            PixelFormat::Depth,
            Some(depth_frame_size()),
        )
    }

    /// Driver timestamp of the last published video frame
    pub fn video_time(&self) -> u32 {
        self.video_time
    }

    /// Driver timestamp of the last published depth frame
    pub fn depth_time(&self) -> u32 {
        self.depth_time
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }
}

impl StreamHandler for FrameProducer {
    fn on_video(&mut self, data: &[u8], timestamp: u32) {
        {
            let mut back = self.store.back(ChannelKind::Video).control();
            if !back.try_lock() {
                self.stats.video_dropped += 1;
                tracing::trace!("Video back buffer busy, dropping frame");
                return;
            }
            if let Some(buffer) = back.get_mut() {
                buffer.write_bytes(data);
            }
        }

        if !self.store.swap(ChannelKind::Video) {
            self.stats.video_dropped += 1;
            return;
        }

        self.video_time = timestamp;
        self.stats.video_frames += 1;
    }

    fn on_depth(&mut self, samples: &[u16], timestamp: u32) {
        {
            let mut back = self.store.back(ChannelKind::Depth).control();
            if !back.try_lock() {
                self.stats.depth_dropped += 1;
                tracing::trace!("Depth back buffer busy, dropping frame");
                return;
            }
            if let Some(buffer) = back.get_mut() {
                buffer.write_samples(samples);
            }
        }

        let depth = &mut self.depth;
        let published = self
            .store
            .swap_with(ChannelKind::Depth, |buffer| depth.apply(buffer));
        if !published {
            self.stats.depth_dropped += 1;
            return;
        }

        self.depth_time = timestamp;
        self.stats.depth_frames += 1;
    }
}
