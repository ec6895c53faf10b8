//! Dual-channel double-buffered frame store
//!
//! Each channel owns exactly two frames. A swap exchanges which one is the
//! front (consumer facing) and which is the back (producer facing); pixels are
//! never copied. Swaps never block: the store lock, the back frame and the
//! front frame are try-locked in that order and any failure drops the swap.
//!
//! ```text
//!   producer ──write──▶ back ──swap()──▶ front ──read──▶ consumers
//!                         ▲                │
//!                         └── identities ──┘
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::FrameError;
use crate::frame::buffer::{Frame, FrameBuffer, PixelFormat, Resolution};
use crate::sync::LockHandle;

/// Independently double-buffered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Video = 0,
    Depth = 1,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Video, ChannelKind::Depth];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Video => "video",
            ChannelKind::Depth => "depth",
        }
    }
}

impl TryFrom<u8> for ChannelKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelKind::Video),
            1 => Ok(ChannelKind::Depth),
            other => Err(FrameError::InvalidChannel(other)),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Front or back frame of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Select {
    #[default]
    Front = 0,
    Back = 1,
}

impl TryFrom<u8> for Select {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Select::Front),
            1 => Ok(Select::Back),
            other => Err(FrameError::InvalidSelector(other)),
        }
    }
}

/// Observational per-channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Update counter, equal to the number of successful swaps
    pub counter: u64,
    /// Swaps dropped because a lock was held elsewhere
    pub dropped: u64,
}

impl ChannelStats {
    pub fn drop_rate(&self) -> f32 {
        let total = self.counter + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f32 / total as f32
        }
    }
}

struct Channel {
    frames: [Frame; 2],
    /// Index of the front frame. Only changed while the store lock is held.
    front: AtomicUsize,
    /// Resolution and format of both frames, readable without their locks
    layout: Mutex<(Resolution, PixelFormat)>,
    counter: AtomicU64,
    dropped: AtomicU64,
}

impl Channel {
    fn new() -> Self {
        Self {
            frames: [Frame::new(), Frame::new()],
            front: AtomicUsize::new(0),
            layout: Mutex::new((Resolution::default(), PixelFormat::default())),
            counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn frame(&self, select: Select) -> &Frame {
        let front = self.front.load(Ordering::Acquire);
        match select {
            Select::Front => &self.frames[front],
            Select::Back => &self.frames[front ^ 1],
        }
    }

    fn drop_swap(&self) -> bool {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }
}

/// Video and depth channels behind one swap lock
pub struct FrameStore {
    lock: LockHandle<()>,
    channels: [Channel; 2],
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            lock: LockHandle::new(()),
            channels: [Channel::new(), Channel::new()],
        }
    }

    fn channel(&self, kind: ChannelKind) -> &Channel {
        &self.channels[kind.index()]
    }

    /// Exchange front and back of a channel.
    ///
    /// Returns `false` with no state change if the store, the back frame or
    /// the front frame is locked elsewhere. The caller simply tries again with
    /// its next frame.
    pub fn swap(&self, kind: ChannelKind) -> bool {
        self.swap_with(kind, |_| {})
    }

    /// Swap, then run `finish` on the new front frame before the update
    /// counter moves. All three locks are held while `finish` runs, so no
    /// consumer can see the new front until it returns.
    pub fn swap_with<F>(&self, kind: ChannelKind, finish: F) -> bool
    where
        F: FnOnce(&mut FrameBuffer),
    {
        let channel = self.channel(kind);

        let mut store = self.lock.control();
        if !store.try_lock() {
            return channel.drop_swap();
        }

        let mut back = channel.frame(Select::Back).control();
        if !back.try_lock() {
            return channel.drop_swap();
        }

        let mut front = channel.frame(Select::Front).control();
        if !front.try_lock() {
            return channel.drop_swap();
        }

        let previous = channel.front.load(Ordering::Relaxed);
        channel.front.store(previous ^ 1, Ordering::Release);

        // The old back frame is the new front
        if let Some(buffer) = back.get_mut() {
            finish(buffer);
        }

        channel.counter.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Check a channel for a swap newer than `last_seen`.
    ///
    /// On `true`, `last_seen` is advanced to the current counter. If the store
    /// lock is busy the check fails and `last_seen` is left alone.
    pub fn updated(&self, kind: ChannelKind, last_seen: &mut u64) -> bool {
        let mut store = self.lock.control();
        if !store.try_lock() {
            return false;
        }

        let counter = self.channel(kind).counter.load(Ordering::Acquire);
        if counter == *last_seen {
            return false;
        }

        *last_seen = counter;
        true
    }

    pub fn counter(&self, kind: ChannelKind) -> u64 {
        self.channel(kind).counter.load(Ordering::Acquire)
    }

    pub fn stats(&self, kind: ChannelKind) -> ChannelStats {
        let channel = self.channel(kind);
        ChannelStats {
            counter: channel.counter.load(Ordering::Acquire),
            dropped: channel.dropped.load(Ordering::Relaxed),
        }
    }

    /// Current frame for a selector. Lock it before touching pixels.
    pub fn frame(&self, kind: ChannelKind, select: Select) -> &Frame {
        self.channel(kind).frame(select)
    }

    /// Frame for a raw selector index, rejecting anything but 0 and 1
    pub fn frame_at(&self, kind: ChannelKind, index: u8) -> Result<&Frame, FrameError> {
        let select = Select::try_from(index)?;
        Ok(self.frame(kind, select))
    }

    pub fn front(&self, kind: ChannelKind) -> &Frame {
        self.frame(kind, Select::Front)
    }

    pub fn back(&self, kind: ChannelKind) -> &Frame {
        self.frame(kind, Select::Back)
    }

    /// Never waits on a frame lock, so it is safe while holding one
    pub fn resolution(&self, kind: ChannelKind) -> Resolution {
        self.channel(kind).layout.lock().0
    }

    pub fn format(&self, kind: ChannelKind) -> PixelFormat {
        self.channel(kind).layout.lock().1
    }

    /// Reallocate both frames of a channel for a new stream format.
    ///
    /// Blocks until both frames are free. `expected_size`, when given, is the
    /// byte size the driver will deliver; a mismatch is a contract violation.
    pub fn setup_channel(
        &self,
        kind: ChannelKind,
        resolution: Resolution,
        format: PixelFormat,
        expected_size: Option<usize>,
    ) -> Result<(), FrameError> {
        let channel = self.channel(kind);
        let mut first = channel.frames[0].control();
        let mut second = channel.frames[1].control();
        first.lock();
        second.lock();

        for buffer in [first.get_mut(), second.get_mut()].into_iter().flatten() {
            buffer.create(resolution, format)?;
            buffer.clear();
        }
        *channel.layout.lock() = (resolution, format);

        let actual = resolution.pixel_count() * format.bytes_per_pixel();
        match expected_size {
            Some(expected) if expected != actual => Err(FrameError::SizeMismatch { expected, actual }),
            _ => Ok(()),
        }
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
