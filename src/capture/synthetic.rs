//! Test-pattern sensor
//!
//! Produces a moving gradient on the video stream and a moving raw-depth ramp
//! at a fixed frame period. Presence and driver failures can be toggled from
//! another thread through [`SyntheticControl`], which is how the capture loop
//! is exercised without hardware.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::device::{depth_resolution, DepthSensor, LedMode, StreamHandler, VideoMode};
use crate::depth::RAW_DEPTH_MASK;
use crate::error::DeviceError;

struct Shared {
    present: AtomicBool,
    open: AtomicBool,
    fail_update: AtomicBool,
    fail_open: AtomicBool,
    led_fault: AtomicBool,
    led: Mutex<LedMode>,
    video_mode: Mutex<Option<VideoMode>>,
}

/// Remote control for a [`SyntheticSensor`] that has been moved into a session
#[derive(Clone)]
pub struct SyntheticControl {
    shared: Arc<Shared>,
}

impl SyntheticControl {
    /// Attach or detach the simulated device
    pub fn set_present(&self, present: bool) {
        self.shared.present.store(present, Ordering::SeqCst);
    }

    /// Make the next `update` call fail
    pub fn fail_next_update(&self) {
        self.shared.fail_update.store(true, Ordering::SeqCst);
    }

    /// Make the next `open` call fail
    pub fn fail_next_open(&self) {
        self.shared.fail_open.store(true, Ordering::SeqCst);
    }

    /// Reject LED changes until cleared
    pub fn set_led_fault(&self, fault: bool) {
        self.shared.led_fault.store(fault, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn led(&self) -> LedMode {
        *self.shared.led.lock()
    }

    /// Mode the video stream was last set up with
    pub fn video_mode(&self) -> Option<VideoMode> {
        *self.shared.video_mode.lock()
    }
}

/// Software sensor producing test patterns
pub struct SyntheticSensor {
    shared: Arc<Shared>,
    frame_period: Duration,
    video_mode: Option<VideoMode>,
    video: Vec<u8>,
    depth: Vec<u16>,
    video_running: bool,
    depth_running: bool,
    frame_index: u32,
    epoch: Instant,
    next_frame: Instant,
}

impl SyntheticSensor {
    pub fn new(frame_period: Duration) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(Shared {
                present: AtomicBool::new(true),
                open: AtomicBool::new(false),
                fail_update: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                led_fault: AtomicBool::new(false),
                led: Mutex::new(LedMode::Off),
                video_mode: Mutex::new(None),
            }),
            frame_period,
            video_mode: None,
            video: Vec::new(),
            depth: Vec::new(),
            video_running: false,
            depth_running: false,
            frame_index: 0,
            epoch: now,
            next_frame: now,
        }
    }

    /// Sensor paced at a frame rate
    pub fn with_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs(1) / fps.max(1))
    }

    pub fn control(&self) -> SyntheticControl {
        SyntheticControl {
            shared: self.shared.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.shared.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    /// Driver clock, in microseconds since the sensor was created
    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    fn render_video(&mut self) {
        let Some(mode) = self.video_mode else {
            return;
        };
        let width = mode.resolution().width as usize;
        let shift = self.frame_index as usize;
        let bytes_per_pixel = mode.format().bytes_per_pixel();

        for (row, line) in self.video.chunks_exact_mut(width * bytes_per_pixel).enumerate() {
            for (column, pixel) in line.chunks_exact_mut(bytes_per_pixel).enumerate() {
                let value = (column + row + shift) as u8;
                if bytes_per_pixel == 3 {
                    pixel.copy_from_slice(&[value, row as u8, shift as u8]);
                } else {
                    pixel[0] = value;
                }
            }
        }
    }

    fn render_depth(&mut self) {
        let width = depth_resolution().width as usize;
        let shift = self.frame_index as usize * 4;

        for (row, line) in self.depth.chunks_exact_mut(width).enumerate() {
            for (column, sample) in line.iter_mut().enumerate() {
                *sample = ((column + row + shift) as u16) & RAW_DEPTH_MASK;
            }
        }
    }
}

impl DepthSensor for SyntheticSensor {
    fn open(&mut self) -> Result<bool, DeviceError> {
        if self.shared.fail_open.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed("injected failure".to_string()));
        }
        if !self.shared.present.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.shared.open.store(true, Ordering::SeqCst);
        self.next_frame = Instant::now();
        Ok(true)
    }

    fn close(&mut self) {
        self.video_running = false;
        self.depth_running = false;
        self.shared.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn setup_video(&mut self, mode: VideoMode) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.video_running {
            return Err(DeviceError::SetupFailed("video stream is running".to_string()));
        }
        self.video = vec![0; mode.frame_size()];
        self.video_mode = Some(mode);
        *self.shared.video_mode.lock() = Some(mode);
        Ok(())
    }

    fn setup_depth(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.depth_running {
            return Err(DeviceError::SetupFailed("depth stream is running".to_string()));
        }
        self.depth = vec![0; depth_resolution().pixel_count()];
        Ok(())
    }

    fn start_video(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.video_mode.is_none() {
            return Err(DeviceError::SetupFailed("video mode not set".to_string()));
        }
        self.video_running = true;
        Ok(())
    }

    fn start_depth(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.depth.is_empty() {
            return Err(DeviceError::SetupFailed("depth mode not set".to_string()));
        }
        self.depth_running = true;
        Ok(())
    }

    fn stop_video(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.video_running = false;
        Ok(())
    }

    fn stop_depth(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.depth_running = false;
        Ok(())
    }

    fn set_led(&mut self, mode: LedMode) -> Result<(), DeviceError> {
        self.ensure_open()?;
        if self.shared.led_fault.load(Ordering::SeqCst) {
            return Err(DeviceError::LedFailed(format!("cannot switch to {:?}", mode)));
        }
        *self.shared.led.lock() = mode;
        Ok(())
    }

    fn update(&mut self, handler: &mut dyn StreamHandler) -> Result<bool, DeviceError> {
        self.ensure_open()?;
        if self.shared.fail_update.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::EventsFailed("injected failure".to_string()));
        }
        if !self.shared.present.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let now = Instant::now();
        if now < self.next_frame {
            thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.frame_period;
        // Do not try to catch up after a stall
        if self.next_frame < Instant::now() {
            self.next_frame = Instant::now() + self.frame_period;
        }

        if self.video_running {
            self.render_video();
            let timestamp = self.timestamp();
            handler.on_video(&self.video, timestamp);
        }
        if self.depth_running {
            self.render_depth();
            let timestamp = self.timestamp();
            handler.on_depth(&self.depth, timestamp);
        }

        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(true)
    }

    fn name(&self) -> String {
        "synthetic sensor".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        video: Vec<(usize, u32)>,
        depth: Vec<(Vec<u16>, u32)>,
    }

    impl StreamHandler for Collector {
        fn on_video(&mut self, data: &[u8], timestamp: u32) {
            self.video.push((data.len(), timestamp));
        }

        fn on_depth(&mut self, samples: &[u16], timestamp: u32) {
            self.depth.push((samples.to_vec(), timestamp));
        }
    }

    fn streaming_sensor() -> SyntheticSensor {
        let mut sensor = SyntheticSensor::new(Duration::from_millis(1));
        assert!(sensor.open().unwrap());
        sensor.setup_video(VideoMode::Rgb).unwrap();
        sensor.setup_depth().unwrap();
        sensor.start_video().unwrap();
        sensor.start_depth().unwrap();
        sensor
    }

    #[test]
    fn test_delivers_both_streams() {
        let mut sensor = streaming_sensor();
        let mut collector = Collector::default();

        assert!(sensor.update(&mut collector).unwrap());
        assert!(sensor.update(&mut collector).unwrap());

        assert_eq!(collector.video.len(), 2);
        assert_eq!(collector.video[0].0, VideoMode::Rgb.frame_size());
        assert_eq!(collector.depth[0].0.len(), depth_resolution().pixel_count());
        assert!(collector.depth.iter().flat_map(|(d, _)| d).all(|&s| s <= RAW_DEPTH_MASK));
        assert_ne!(collector.depth[0].0, collector.depth[1].0);
        assert!(collector.depth[1].1 >= collector.depth[0].1);
    }

    #[test]
    fn test_absent_device_does_not_open() {
        let mut sensor = SyntheticSensor::new(Duration::from_millis(1));
        sensor.control().set_present(false);
        assert!(!sensor.open().unwrap());
        assert_eq!(sensor.setup_depth().unwrap_err(), DeviceError::NotOpen);
    }

    #[test]
    fn test_setup_requires_stopped_stream() {
        let mut sensor = streaming_sensor();
        assert!(matches!(sensor.setup_video(VideoMode::Ir), Err(DeviceError::SetupFailed(_))));
        sensor.stop_video().unwrap();
        sensor.setup_video(VideoMode::Ir).unwrap();
        assert_eq!(sensor.control().video_mode(), Some(VideoMode::Ir));
    }

    #[test]
    fn test_unplug_and_failure() {
        let mut sensor = streaming_sensor();
        let control = sensor.control();
        let mut collector = Collector::default();

        control.fail_next_update();
        assert!(matches!(sensor.update(&mut collector), Err(DeviceError::EventsFailed(_))));
        assert!(sensor.update(&mut collector).unwrap());

        control.set_present(false);
        assert!(!sensor.update(&mut collector).unwrap());

        sensor.close();
        assert!(!control.is_open());
    }

    #[test]
    fn test_injected_open_and_led_failures() {
        let mut sensor = SyntheticSensor::new(Duration::from_millis(1));
        let control = sensor.control();

        control.fail_next_open();
        assert!(matches!(sensor.open(), Err(DeviceError::OpenFailed(_))));
        assert!(sensor.open().unwrap());

        control.set_led_fault(true);
        assert!(matches!(sensor.set_led(LedMode::Red), Err(DeviceError::LedFailed(_))));
        assert_eq!(control.led(), LedMode::Off);

        control.set_led_fault(false);
        sensor.set_led(LedMode::Red).unwrap();
        assert_eq!(control.led(), LedMode::Red);
    }
}
