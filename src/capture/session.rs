//! Capture coordination loop
//!
//! One dedicated thread owns the sensor for its whole lifetime:
//!
//! ```text
//!  ┌────────────┐ open()==true ┌──────────┐  update() ok   ┌───────────┐
//!  │ Detecting  │─────────────▶│  Setup   │───────────────▶│ Streaming │──┐
//!  │ every Nms  │◀─────────────│ streams  │                │  pump +   │  │ new frame
//!  └────────────┘ device lost  └──────────┘                │  notify   │◀─┘
//!        ▲                                                 └───────────┘
//!        └──────────────────────── stop / error ──────────────────┘
//! ```
//!
//! Subscribers receive [`CaptureEvent`]s on bounded channels. A subscriber
//! that falls behind loses events; the device thread never waits on one.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::device::{depth_resolution, DepthSensor, LedMode, VideoMode};
use crate::capture::producer::FrameProducer;
use crate::config::CaptureConfig;
use crate::depth::CalibrationHandle;
use crate::error::{DeviceError, Error, Result};
use crate::frame::{ChannelKind, FrameStore};

const COMMAND_CAPACITY: usize = 16;
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Notifications published by the device thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A device was set up and is streaming (`true`), or was lost (`false`)
    Connected(bool),
    /// At least one channel has a frame newer than the last notification
    NewFrame { video: bool, depth: bool },
    /// The loop hit a fatal error and stopped
    Error(String),
}

/// Requests executed on the device thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Stop video, reallocate it for the new mode and restart it
    ChangeVideo(VideoMode),
    SetLed(LedMode),
}

enum Message {
    Command(CaptureCommand),
    Wake,
}

/// Snapshot of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connected: bool,
    pub video_time: u32,
    pub depth_time: u32,
    pub notifications: u64,
    pub connections: u64,
}

#[derive(Default)]
struct SharedStats {
    /// Incremented per `start`; a thread whose number is stale stays silent
    generation: AtomicU64,
    connected: AtomicBool,
    video_time: AtomicU32,
    depth_time: AtomicU32,
    notifications: AtomicU64,
    connections: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            connected: self.connected.load(Ordering::Relaxed),
            video_time: self.video_time.load(Ordering::Relaxed),
            depth_time: self.depth_time.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out of events to every live subscriber
#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<Sender<CaptureEvent>>>,
}

impl EventBus {
    fn subscribe(&self, capacity: usize) -> Receiver<CaptureEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: CaptureEvent) {
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Subscriber queue full, dropping {:?}", event);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Everything the device thread needs, moved into it at start
struct DeviceLoop<S> {
    sensor: S,
    producer: FrameProducer,
    store: Arc<FrameStore>,
    config: CaptureConfig,
    video_mode: VideoMode,
    running: Arc<AtomicBool>,
    generation: u64,
    messages: Receiver<Message>,
    events: Arc<EventBus>,
    stats: Arc<SharedStats>,
}

impl<S: DepthSensor> DeviceLoop<S> {
    fn run(mut self) {
        tracing::info!("Capture thread started for {}", self.sensor.name());

        while self.running.load(Ordering::SeqCst) {
            if !self.detect() {
                break;
            }

            let result = self.stream();
            self.release();
            self.set_connected(false);

            if let Err(e) = result {
                tracing::error!("Capture stopped: {}", e);
                self.emit(CaptureEvent::Error(e.to_string()));
                self.running.store(false, Ordering::SeqCst);
            }
        }

        tracing::info!("Capture thread stopped");
    }

    fn is_current(&self) -> bool {
        self.stats.generation.load(Ordering::SeqCst) == self.generation
    }

    fn emit(&self, event: CaptureEvent) {
        if self.is_current() {
            self.events.emit(event);
        }
    }

    /// Switch the LED off and close the device
    fn release(&mut self) {
        match self.sensor.set_led(LedMode::Off) {
            Ok(()) | Err(DeviceError::NotOpen) => {}
            Err(e) => tracing::warn!("Failed to switch LED off: {}", e),
        }
        self.sensor.close();
    }

    /// Poll for a device until one opens. Returns `false` on stop or error.
    fn detect(&mut self) -> bool {
        tracing::debug!("Waiting for device");

        while self.running.load(Ordering::SeqCst) {
            match self.sensor.open() {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Device detection failed: {}", e);
                    self.emit(CaptureEvent::Error(e.to_string()));
                    self.running.store(false, Ordering::SeqCst);
                    return false;
                }
            }

            match self.messages.recv_timeout(self.config.detect_interval()) {
                Ok(Message::Command(CaptureCommand::ChangeVideo(mode))) => self.video_mode = mode,
                Ok(Message::Command(CaptureCommand::SetLed(_))) | Ok(Message::Wake) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }

        false
    }

    fn setup(&mut self) -> Result<()> {
        self.producer.setup_video(self.video_mode)?;
        self.sensor.setup_video(self.video_mode)?;
        self.producer.setup_depth()?;
        self.sensor.setup_depth()?;
        self.sensor.start_video()?;
        self.sensor.start_depth()?;
        self.sensor.set_led(LedMode::Green)?;
        Ok(())
    }

    fn change_video(&mut self, mode: VideoMode) -> Result<()> {
        tracing::info!("Changing video mode to {}", mode);
        self.sensor.stop_video()?;
        self.producer.setup_video(mode)?;
        self.sensor.setup_video(mode)?;
        self.sensor.start_video()?;
        self.video_mode = mode;
        Ok(())
    }

    fn handle_messages(&mut self) -> Result<()> {
        while let Ok(message) = self.messages.try_recv() {
            match message {
                Message::Command(CaptureCommand::ChangeVideo(mode)) => self.change_video(mode)?,
                Message::Command(CaptureCommand::SetLed(mode)) => self.sensor.set_led(mode)?,
                Message::Wake => {}
            }
        }
        Ok(())
    }

    /// Set up the streams and pump frames until stop or device loss
    fn stream(&mut self) -> Result<()> {
        self.setup()?;
        tracing::info!(
            "Device connected: video {} {}, depth {}",
            self.video_mode,
            self.video_mode.resolution(),
            depth_resolution()
        );
        self.set_connected(true);

        let mut video_seen = self.store.counter(ChannelKind::Video);
        let mut depth_seen = self.store.counter(ChannelKind::Depth);

        while self.running.load(Ordering::SeqCst) {
            self.handle_messages()?;

            if !self.sensor.update(&mut self.producer)? {
                tracing::warn!("Device lost");
                return Ok(());
            }

            let video = self.store.updated(ChannelKind::Video, &mut video_seen);
            let depth = self.store.updated(ChannelKind::Depth, &mut depth_seen);

            if (video || depth) && self.is_current() {
                self.stats.video_time.store(self.producer.video_time(), Ordering::Relaxed);
                self.stats.depth_time.store(self.producer.depth_time(), Ordering::Relaxed);
                self.stats.notifications.fetch_add(1, Ordering::Relaxed);
                self.emit(CaptureEvent::NewFrame { video, depth });
            } else if !self.config.idle_sleep().is_zero() {
                thread::sleep(self.config.idle_sleep());
            }
        }

        let stats = self.producer.stats();
        tracing::debug!(
            video_frames = stats.video_frames,
            video_dropped = stats.video_dropped,
            depth_frames = stats.depth_frames,
            depth_dropped = stats.depth_dropped,
            "Streaming ended"
        );
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        if !self.is_current() {
            return;
        }
        let was = self.stats.connected.swap(connected, Ordering::Relaxed);
        if was == connected {
            return;
        }
        if connected {
            self.stats.connections.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(CaptureEvent::Connected(connected));
    }
}

/// Owner of the device thread
pub struct CaptureSession {
    store: Arc<FrameStore>,
    calibration: CalibrationHandle,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    messages: Option<Sender<Message>>,
    events: Arc<EventBus>,
    stats: Arc<SharedStats>,
}

impl CaptureSession {
    pub fn new(store: Arc<FrameStore>, calibration: CalibrationHandle, config: CaptureConfig) -> Self {
        Self {
            store,
            calibration,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            messages: None,
            events: Arc::new(EventBus::default()),
            stats: Arc::new(SharedStats::default()),
        }
    }

    /// New event queue. Subscribe before `start` to see the first connect.
    pub fn subscribe(&self) -> Receiver<CaptureEvent> {
        self.events.subscribe(self.config.event_capacity)
    }

    /// Hand the sensor to a new device thread
    pub fn start<S>(&mut self, sensor: S) -> Result<()>
    where
        S: DepthSensor + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        if self.thread_handle.is_some() {
            // Previous thread ended on its own
            self.stop();
        }

        let (tx, rx) = bounded(COMMAND_CAPACITY);
        // A thread detached by a timed-out stop keeps the old flag, which stays cleared
        self.running = Arc::new(AtomicBool::new(true));
        let generation = self.stats.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.connected.store(false, Ordering::Relaxed);

        let device_loop = DeviceLoop {
            sensor,
            producer: FrameProducer::new(self.store.clone(), self.calibration.processor()),
            store: self.store.clone(),
            config: self.config.clone(),
            video_mode: self.config.video_mode,
            running: self.running.clone(),
            generation,
            messages: rx,
            events: self.events.clone(),
            stats: self.stats.clone(),
        };

        let handle = thread::Builder::new()
            .name("capture-device".to_string())
            .spawn(move || device_loop.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Device(DeviceError::Spawn(e.to_string()))
            })?;

        self.thread_handle = Some(handle);
        self.messages = Some(tx);
        Ok(())
    }

    /// Ask the device thread to finish and wait a bounded time for it.
    ///
    /// Returns `false` if the thread did not finish within the join timeout;
    /// it is then detached and will exit on its own at its next check. A
    /// later `start` never revives it.
    pub fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.messages.take() {
            let _ = tx.try_send(Message::Wake);
        }

        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        let deadline = Instant::now() + self.config.join_timeout();
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if !handle.is_finished() {
            tracing::warn!(
                "Capture thread did not stop within {:?}, detaching",
                self.config.join_timeout()
            );
            return false;
        }

        if handle.join().is_err() {
            tracing::error!("Capture thread panicked");
        }
        true
    }

    /// Queue a command for the device thread. Returns `false` if not running
    /// or the command queue is full.
    pub fn send(&self, command: CaptureCommand) -> bool {
        match &self.messages {
            Some(tx) if self.is_running() => tx.try_send(Message::Command(command)).is_ok(),
            _ => false,
        }
    }

    pub fn change_video(&self, mode: VideoMode) -> bool {
        self.send(CaptureCommand::ChangeVideo(mode))
    }

    pub fn set_led(&self, mode: LedMode) -> bool {
        self.send(CaptureCommand::SetLed(mode))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn calibration(&self) -> &CalibrationHandle {
        &self.calibration
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticSensor;
    use crate::frame::{PixelFormat, Resolution};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            detect_interval_ms: 10,
            idle_sleep_ms: 1,
            join_timeout_ms: 2000,
            video_mode: VideoMode::Bayer,
            event_capacity: 256,
        }
    }

    fn session() -> CaptureSession {
        CaptureSession::new(
            Arc::new(FrameStore::new()),
            CalibrationHandle::default(),
            test_config(),
        )
    }

    fn wait_for(rx: &Receiver<CaptureEvent>, wanted: impl Fn(&CaptureEvent) -> bool) -> CaptureEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = rx.recv_timeout(remaining).expect("event not received in time");
            if wanted(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_streams_after_connect() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));

        session.start(sensor).unwrap();
        assert_eq!(wait_for(&events, |e| matches!(e, CaptureEvent::Connected(_))), CaptureEvent::Connected(true));
        wait_for(&events, |e| matches!(e, CaptureEvent::NewFrame { depth: true, .. }));

        let store = session.store().clone();
        assert!(store.counter(ChannelKind::Depth) > 0);
        assert_eq!(store.format(ChannelKind::Video), PixelFormat::Luminance);
        assert!(session.stats().notifications > 0);
        assert!(session.is_connected());

        assert!(session.stop());
        assert!(!session.is_running());
        assert_eq!(wait_for(&events, |e| matches!(e, CaptureEvent::Connected(_))), CaptureEvent::Connected(false));
    }

    #[test]
    fn test_waits_for_device() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();
        control.set_present(false);

        session.start(sensor).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!session.is_connected());
        assert!(events.try_recv().is_err());

        control.set_present(true);
        assert_eq!(wait_for(&events, |e| matches!(e, CaptureEvent::Connected(_))), CaptureEvent::Connected(true));
        assert!(session.stop());
    }

    #[test]
    fn test_stop_while_detecting_is_prompt() {
        let mut config = test_config();
        config.detect_interval_ms = 60_000;
        let mut session = CaptureSession::new(Arc::new(FrameStore::new()), CalibrationHandle::default(), config);
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        sensor.control().set_present(false);

        session.start(sensor).unwrap();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(session.stop());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_device_loss_returns_to_detection() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();

        session.start(sensor).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));

        control.set_present(false);
        wait_for(&events, |e| *e == CaptureEvent::Connected(false));
        assert!(session.is_running());

        control.set_present(true);
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        assert_eq!(session.stats().connections, 2);
        assert!(session.stop());
    }

    #[test]
    fn test_driver_error_stops_loop() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();

        session.start(sensor).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        control.fail_next_update();

        let event = wait_for(&events, |e| matches!(e, CaptureEvent::Error(_)));
        assert!(matches!(event, CaptureEvent::Error(message) if message.contains("Event processing failed")));

        let deadline = Instant::now() + WAIT;
        while session.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!session.is_running());
        assert!(session.stop());
    }

    #[test]
    fn test_change_video_mode() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();

        session.start(sensor).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        assert!(session.change_video(VideoMode::Ir));
        assert!(session.set_led(LedMode::BlinkGreen));

        let deadline = Instant::now() + WAIT;
        while session.store().resolution(ChannelKind::Video) != Resolution::new(640, 488) {
            assert!(Instant::now() < deadline, "video mode not changed in time");
            thread::sleep(Duration::from_millis(5));
        }
        let deadline = Instant::now() + WAIT;
        while control.led() != LedMode::BlinkGreen {
            assert!(Instant::now() < deadline, "LED not changed in time");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(control.video_mode(), Some(VideoMode::Ir));
        assert!(session.stop());
    }

    #[test]
    fn test_commands_rejected_when_stopped() {
        let session = session();
        assert!(!session.change_video(VideoMode::Rgb));
        assert!(!session.set_led(LedMode::Red));
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let mut config = test_config();
        config.event_capacity = 1;
        let mut session = CaptureSession::new(Arc::new(FrameStore::new()), CalibrationHandle::default(), config);
        let stalled = session.subscribe();

        session.start(SyntheticSensor::new(Duration::from_millis(1))).unwrap();
        let deadline = Instant::now() + WAIT;
        while session.stats().notifications < 5 {
            assert!(Instant::now() < deadline, "device thread stalled");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stalled.len(), 1);
        assert!(session.stop());
    }

    fn wait_until(condition: impl Fn() -> bool, what: &str) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "{} not reached in time", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_restart_does_not_revive_detached_thread() {
        let mut config = test_config();
        config.join_timeout_ms = 50;
        let mut session = CaptureSession::new(Arc::new(FrameStore::new()), CalibrationHandle::default(), config);
        let events = session.subscribe();

        // Second update blocks for the whole frame period
        let slow = SyntheticSensor::new(Duration::from_millis(1500));
        let old = slow.control();
        session.start(slow).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        wait_for(&events, |e| matches!(e, CaptureEvent::NewFrame { depth: true, .. }));
        assert!(!session.stop());

        let fresh = SyntheticSensor::new(Duration::from_millis(2));
        let new = fresh.control();
        session.start(fresh).unwrap();
        assert_eq!(wait_for(&events, |e| matches!(e, CaptureEvent::Connected(_))), CaptureEvent::Connected(true));

        wait_until(|| !old.is_open(), "detached sensor close");
        assert_eq!(old.led(), LedMode::Off);
        assert!(new.is_open());
        assert!(session.is_running());
        assert!(session.is_connected());
        assert!(events.try_iter().all(|e| e != CaptureEvent::Connected(false)));

        assert!(session.stop());
        assert!(!new.is_open());
    }

    #[test]
    fn test_led_off_after_disconnect() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();

        session.start(sensor).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        assert_eq!(control.led(), LedMode::Green);

        control.set_present(false);
        wait_for(&events, |e| *e == CaptureEvent::Connected(false));
        assert_eq!(control.led(), LedMode::Off);

        control.set_present(true);
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        assert!(session.set_led(LedMode::Yellow));
        wait_until(|| control.led() == LedMode::Yellow, "LED change");

        assert!(session.stop());
        assert_eq!(control.led(), LedMode::Off);
        assert!(!control.is_open());
    }

    #[test]
    fn test_open_failure_stops_loop() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        sensor.control().fail_next_open();

        session.start(sensor).unwrap();
        let event = wait_for(&events, |e| matches!(e, CaptureEvent::Error(_)));
        assert!(matches!(event, CaptureEvent::Error(message) if message.contains("Failed to open device")));
        wait_until(|| !session.is_running(), "loop stop");
        assert!(!session.is_connected());
        assert!(session.stop());
    }

    #[test]
    fn test_led_failure_stops_loop() {
        let mut session = session();
        let events = session.subscribe();
        let sensor = SyntheticSensor::new(Duration::from_millis(2));
        let control = sensor.control();

        session.start(sensor).unwrap();
        wait_for(&events, |e| *e == CaptureEvent::Connected(true));
        control.set_led_fault(true);
        assert!(session.set_led(LedMode::Red));

        let event = wait_for(&events, |e| matches!(e, CaptureEvent::Error(_)));
        assert!(matches!(event, CaptureEvent::Error(message) if message.contains("LED control failed")));
        wait_until(|| !session.is_running(), "loop stop");
        assert!(!control.is_open());
        assert!(session.stop());
    }
}
