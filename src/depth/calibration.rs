//! Depth calibration state and its lookup table
//!
//! [`DepthCalibration`] pairs the calibration parameters with the table built
//! from them; every setter rebuilds the table in full. Tables are immutable
//! once built and shared through `Arc`, so a reader holds either the old or
//! the new table and never a mix of both.
//!
//! [`CalibrationHandle`] is the lock-protected, cloneable control surface.
//! The device thread applies tables through a [`DepthProcessor`], which only
//! ever try-locks the handle and falls back to its cached table, so a control
//! change in progress can never stall capture.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::depth::range::{ClipMode, DepthRange};
use crate::depth::table::DepthTable;
use crate::error::DepthError;
use crate::frame::{Frame, FrameBuffer};
use crate::sync::LockHandle;

/// Parameters a lookup table is built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationState {
    /// Convert raw samples to metres before normalizing
    pub linear: bool,
    pub clip_mode: ClipMode,
    /// Range used when `linear` is set
    pub metric: DepthRange,
    /// Range used otherwise
    pub raw: DepthRange,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            linear: true,
            clip_mode: ClipMode::EraseBack,
            metric: DepthRange::metric(),
            raw: DepthRange::raw(),
        }
    }
}

impl CalibrationState {
    /// Range selected by the linear flag
    pub fn active(&self) -> &DepthRange {
        if self.linear {
            &self.metric
        } else {
            &self.raw
        }
    }

    fn active_mut(&mut self) -> &mut DepthRange {
        if self.linear {
            &mut self.metric
        } else {
            &mut self.raw
        }
    }

    pub fn build_table(&self) -> DepthTable {
        DepthTable::build(self.active(), self.clip_mode, self.linear)
    }
}

/// Calibration parameters plus the table that reflects them
#[derive(Debug, Clone)]
pub struct DepthCalibration {
    state: CalibrationState,
    table: Arc<DepthTable>,
}

impl DepthCalibration {
    pub fn new(state: CalibrationState) -> Self {
        let table = Arc::new(state.build_table());
        Self { state, table }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn table(&self) -> &Arc<DepthTable> {
        &self.table
    }

    fn rebuild(&mut self) {
        self.table = Arc::new(self.state.build_table());

        let range = self.state.active();
        tracing::debug!(
            linear = self.state.linear,
            clip_mode = %self.state.clip_mode,
            near = range.near,
            far = range.far,
            max = range.max,
            clip = range.clip,
            "Depth table rebuilt"
        );
    }

    /// Upper range limit of the active range, absolute
    pub fn set_max(&mut self, value: f32) {
        self.state.active_mut().set_max(value);
        self.rebuild();
    }

    /// Near plane of the active range, as a fraction of its max
    pub fn set_near(&mut self, fraction: f32) {
        self.state.active_mut().set_near(fraction);
        self.rebuild();
    }

    /// Far plane of the active range, as a fraction of its max
    pub fn set_far(&mut self, fraction: f32) {
        self.state.active_mut().set_far(fraction);
        self.rebuild();
    }

    pub fn set_clip(&mut self, value: f32) {
        self.state.active_mut().set_clip(value);
        self.rebuild();
    }

    pub fn set_clip_mode(&mut self, mode: ClipMode) {
        self.state.clip_mode = mode;
        self.rebuild();
    }

    /// Set the clip mode from its numeric code, rejecting unknown codes
    pub fn set_clip_mode_code(&mut self, code: u8) -> Result<(), DepthError> {
        let mode = ClipMode::try_from(code)?;
        self.set_clip_mode(mode);
        Ok(())
    }

    pub fn set_linear(&mut self, linear: bool) {
        self.state.linear = linear;
        self.rebuild();
    }

    /// Replace every parameter at once
    pub fn set_state(&mut self, state: CalibrationState) {
        self.state = state;
        self.rebuild();
    }

    pub fn near(&self) -> f32 {
        self.state.active().near
    }

    pub fn far(&self) -> f32 {
        self.state.active().far
    }

    pub fn max(&self) -> f32 {
        self.state.active().max
    }

    pub fn clip(&self) -> f32 {
        self.state.active().clip
    }

    /// Convert a depth frame in place.
    ///
    /// Returns `false` without touching the frame if its lock is held
    /// elsewhere; a newer frame will arrive shortly.
    pub fn post_process(&self, frame: &Frame) -> bool {
        let mut control = frame.control();
        if !control.try_lock() {
            return false;
        }
        if let Some(buffer) = control.get_mut() {
            self.table.apply(buffer);
        }
        true
    }
}

impl Default for DepthCalibration {
    fn default() -> Self {
        Self::new(CalibrationState::default())
    }
}

/// Shared, lock-protected calibration
#[derive(Clone, Default)]
pub struct CalibrationHandle {
    inner: Arc<LockHandle<DepthCalibration>>,
}

impl CalibrationHandle {
    pub fn new(state: CalibrationState) -> Self {
        Self {
            inner: Arc::new(LockHandle::new(DepthCalibration::new(state))),
        }
    }

    /// Run `f` with the calibration locked, blocking until it is free
    pub fn with<R>(&self, f: impl FnOnce(&mut DepthCalibration) -> R) -> R {
        self.inner.with(f)
    }

    pub fn set_max(&self, value: f32) {
        self.with(|c| c.set_max(value));
    }

    pub fn set_near(&self, fraction: f32) {
        self.with(|c| c.set_near(fraction));
    }

    pub fn set_far(&self, fraction: f32) {
        self.with(|c| c.set_far(fraction));
    }

    pub fn set_clip(&self, value: f32) {
        self.with(|c| c.set_clip(value));
    }

    pub fn set_clip_mode(&self, mode: ClipMode) {
        self.with(|c| c.set_clip_mode(mode));
    }

    pub fn set_clip_mode_code(&self, code: u8) -> Result<(), DepthError> {
        self.with(|c| c.set_clip_mode_code(code))
    }

    pub fn set_linear(&self, linear: bool) {
        self.with(|c| c.set_linear(linear));
    }

    pub fn set_state(&self, state: CalibrationState) {
        self.with(|c| c.set_state(state));
    }

    pub fn near(&self) -> f32 {
        self.with(|c| c.near())
    }

    pub fn far(&self) -> f32 {
        self.with(|c| c.far())
    }

    pub fn max(&self) -> f32 {
        self.with(|c| c.max())
    }

    pub fn state(&self) -> CalibrationState {
        self.with(|c| c.state().clone())
    }

    /// Current table snapshot
    pub fn table(&self) -> Arc<DepthTable> {
        self.with(|c| c.table().clone())
    }

    /// Non-blocking table snapshot; `None` while a setter holds the lock
    pub fn try_table(&self) -> Option<Arc<DepthTable>> {
        let mut control = self.inner.control();
        if !control.try_lock() {
            return None;
        }
        control.get().map(|c| c.table().clone())
    }

    /// Processor for the device thread, seeded with the current table
    pub fn processor(&self) -> DepthProcessor {
        DepthProcessor {
            handle: self.clone(),
            cached: self.table(),
            skipped: 0,
        }
    }
}

/// Device-side applier of the current depth table
pub struct DepthProcessor {
    handle: CalibrationHandle,
    cached: Arc<DepthTable>,
    skipped: u64,
}

impl DepthProcessor {
    /// Pick up a newer table if the calibration is not being changed right
    /// now. Returns `true` if the cached table was replaced.
    pub fn refresh(&mut self) -> bool {
        match self.handle.try_table() {
            Some(table) if !Arc::ptr_eq(&table, &self.cached) => {
                self.cached = table;
                true
            }
            _ => false,
        }
    }

    pub fn table(&self) -> &DepthTable {
        &self.cached
    }

    /// Convert an already locked depth buffer
    pub fn apply(&mut self, buffer: &mut FrameBuffer) {
        self.refresh();
        self.cached.apply(buffer);
    }

    /// Try-lock a frame and convert it; skipped if the frame is busy
    pub fn post_process(&mut self, frame: &Frame) -> bool {
        let mut control = frame.control();
        if !control.try_lock() {
            self.skipped += 1;
            tracing::trace!("Depth frame locked elsewhere, skipping post-process");
            return false;
        }
        if let Some(buffer) = control.get_mut() {
            self.apply(buffer);
        }
        true
    }

    /// Frames left unconverted because they were locked
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
