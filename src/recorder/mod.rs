//! Background frame recorder
//!
//! Owns one [`Frame`] and a writer thread. Producers copy into the frame and
//! call [`FrameRecorder::update`]; the writer wakes, takes the frame lock with
//! a bounded wait and writes the pixels as the next numbered file in its
//! session directory. A frame the writer cannot lock in time is dropped.

pub mod writer;

use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::RecorderConfig;
use crate::error::RecordError;
use crate::frame::{Frame, FrameBuffer};

pub use writer::{create_session_directory, write_frame, RecordFormat};

/// Write errors kept for `check_errors`
const ERROR_CAPACITY: usize = 16;

/// Frames written and dropped so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub written: u64,
    pub dropped: u64,
}

struct Shared {
    frame: Frame,
    pending: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
    written: AtomicU64,
    dropped: AtomicU64,
}

/// Writes submitted frames to disk on its own thread
pub struct FrameRecorder {
    shared: Arc<Shared>,
    directory: PathBuf,
    format: RecordFormat,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<RecordError>,
}

impl FrameRecorder {
    /// Create a session directory under `root` and start the writer
    pub fn start(
        root: &Path,
        prefix: &str,
        format: RecordFormat,
        compress: bool,
        lock_timeout: Duration,
    ) -> Result<Self, RecordError> {
        let directory = create_session_directory(root, prefix, &Local::now())?;
        tracing::info!("Recording {} frames to {}", format, directory.display());

        let shared = Arc::new(Shared {
            frame: Frame::new(),
            pending: Mutex::new(false),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let (error_tx, error_rx) = bounded::<RecordError>(ERROR_CAPACITY);

        let writer = Writer {
            shared: shared.clone(),
            directory: directory.clone(),
            format,
            compress,
            lock_timeout,
            error_tx,
        };
        let handle = thread::Builder::new()
            .name("frame-recorder".to_string())
            .spawn(move || writer.run())
            .map_err(|e| RecordError::Spawn(e.to_string()))?;

        Ok(Self {
            shared,
            directory,
            format,
            thread_handle: Some(handle),
            error_rx,
        })
    }

    pub fn from_config(config: &RecorderConfig) -> Result<Self, RecordError> {
        Self::start(
            &config.directory,
            &config.prefix,
            config.format,
            config.compress,
            config.lock_timeout(),
        )
    }

    /// The recorder's own frame. Lock it, fill it, then call [`update`](Self::update).
    pub fn frame(&self) -> &Frame {
        &self.shared.frame
    }

    /// Copy `source` into the recorder frame and wake the writer.
    ///
    /// Returns `false` and drops the frame if the writer is still busy with
    /// the previous one.
    pub fn submit(&self, source: &FrameBuffer) -> bool {
        {
            let mut control = self.shared.frame.control();
            if !control.try_lock() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if let Some(buffer) = control.get_mut() {
                buffer.copy_from(source);
            }
        }
        self.update();
        true
    }

    /// Wake the writer to record the current frame contents
    pub fn update(&self) {
        *self.shared.pending.lock() = true;
        self.shared.wake.notify_one();
    }

    /// Stop the writer and wait for it to finish the file in progress
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut pending = self.shared.pending.lock();
            *pending = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Recorder thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            written: self.shared.written.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Next write error reported by the writer, if any
    pub fn check_errors(&self) -> Option<RecordError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for FrameRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Writer {
    shared: Arc<Shared>,
    directory: PathBuf,
    format: RecordFormat,
    compress: bool,
    lock_timeout: Duration,
    error_tx: Sender<RecordError>,
}

impl Writer {
    fn run(self) {
        let mut index = 0u64;

        loop {
            {
                let mut pending = self.shared.pending.lock();
                while !*pending && self.shared.running.load(Ordering::SeqCst) {
                    self.shared.wake.wait(&mut pending);
                }
                if !self.shared.running.load(Ordering::SeqCst) {
                    break;
                }
                *pending = false;
            }

            let mut control = self.shared.frame.control();
            if !control.try_lock_for(self.lock_timeout) {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Recorder frame busy, dropping");
                continue;
            }

            let Some(buffer) = control.get().filter(|b| !b.is_empty()) else {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let path = self.directory.join(writer::frame_file_name(index, self.format));
            if let Err(e) = write_frame(&path, buffer, self.format, self.compress) {
                tracing::error!("Recording stopped: {}", e);
                report_error(&self.error_tx, e);
                self.shared.running.store(false, Ordering::SeqCst);
                break;
            }

            index += 1;
            self.shared.written.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            written = self.shared.written.load(Ordering::Relaxed),
            dropped = self.shared.dropped.load(Ordering::Relaxed),
            "Recorder thread stopped"
        );
    }
}

/// Queue an error for `check_errors`. Returns `false` if it had to be discarded.
fn report_error(errors: &Sender<RecordError>, error: RecordError) -> bool {
    match errors.try_send(error) {
        Ok(()) => true,
        Err(TrySendError::Full(error)) => {
            tracing::warn!("Recorder error queue full, discarding: {}", error);
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
