//! Depth Relay command line front end
//!
//! Runs the capture core against the synthetic sensor, dumps calibration
//! tables and prints the effective configuration.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depth_relay::{
    capture::{CaptureEvent, CaptureSession, SyntheticSensor, VideoMode},
    config::AppConfig,
    depth::{CalibrationHandle, ClipMode, DEPTH_TABLE_SIZE},
    frame::{ChannelKind, FrameBuffer, FrameStore},
    recorder::{FrameRecorder, RecordFormat},
};

#[derive(Parser)]
#[command(name = "depth-relay")]
#[command(about = "Depth and video capture core for structured-light sensors")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    calibration: CalibrationArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture from the synthetic sensor and report frame rates
    Run {
        /// Sensor frame rate
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Render poll rate
        #[arg(long, default_value = "60")]
        render_hz: u32,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Video stream encoding
        #[arg(long)]
        video_mode: Option<VideoMode>,

        /// Record calibrated depth frames
        #[arg(short, long)]
        record: bool,

        /// Recording root directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Recording file format (raw, png or tga)
        #[arg(long)]
        format: Option<RecordFormat>,

        /// Compress recorded PNG or TGA files
        #[arg(long)]
        compress: bool,

        /// Wait for the front frame lock instead of skipping a busy frame
        #[arg(long)]
        sync: bool,
    },

    /// Print the depth lookup table for the current calibration
    Table {
        /// Print every Nth entry
        #[arg(long, default_value = "64")]
        step: usize,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Calibration overrides applied on top of the config file
#[derive(Args)]
struct CalibrationArgs {
    /// Normalize raw samples instead of converting to metres
    #[arg(long, global = true)]
    raw: bool,

    #[arg(long, global = true)]
    clip_mode: Option<ClipMode>,

    /// Range upper limit (metres, or 1.0 for raw)
    #[arg(long, global = true)]
    max: Option<f32>,

    /// Near plane as a fraction of max
    #[arg(long, global = true)]
    near: Option<f32>,

    /// Far plane as a fraction of max
    #[arg(long, global = true)]
    far: Option<f32>,

    /// Clip threshold in normalized depth
    #[arg(long, global = true)]
    clip: Option<f32>,
}

impl CalibrationArgs {
    fn apply(&self, calibration: &CalibrationHandle) {
        if self.raw {
            calibration.set_linear(false);
        }
        if let Some(mode) = self.clip_mode {
            calibration.set_clip_mode(mode);
        }
        if let Some(max) = self.max {
            calibration.set_max(max);
        }
        if let Some(far) = self.far {
            calibration.set_far(far);
        }
        if let Some(near) = self.near {
            calibration.set_near(near);
        }
        if let Some(clip) = self.clip {
            calibration.set_clip(clip);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    let calibration = CalibrationHandle::new(config.depth.clone());
    cli.calibration.apply(&calibration);
    config.depth = calibration.state();

    match cli.command {
        Command::Run {
            fps,
            render_hz,
            seconds,
            video_mode,
            record,
            output,
            format,
            compress,
            sync,
        } => {
            if let Some(mode) = video_mode {
                config.capture.video_mode = mode;
            }
            if record {
                config.recorder.enabled = true;
            }
            if let Some(output) = output {
                config.recorder.directory = output;
            }
            if let Some(format) = format {
                config.recorder.format = format;
            }
            if compress {
                config.recorder.compress = true;
            }
            config.validate()?;

            let options = RunOptions {
                fps,
                render_interval: Duration::from_secs(1) / render_hz.max(1),
                seconds,
                sync,
            };
            run(config, calibration, options).await
        }
        Command::Table { step } => {
            print_table(&calibration, step);
            Ok(())
        }
        Command::Config { save } => {
            print!("{}", config.to_toml()?);
            if save {
                let path = cli
                    .config
                    .or_else(AppConfig::default_path)
                    .context("No config directory available on this platform")?;
                config.save(&path)?;
                tracing::info!("Saved config to {}", path.display());
            }
            Ok(())
        }
    }
}

struct RunOptions {
    fps: u32,
    render_interval: Duration,
    seconds: Option<u64>,
    sync: bool,
}

/// Per-second counters of the render side
#[derive(Default)]
struct RenderStats {
    video_frames: u64,
    depth_frames: u64,
    busy: u64,
    mean_depth: f32,
}

async fn run(config: AppConfig, calibration: CalibrationHandle, options: RunOptions) -> Result<()> {
    tracing::info!("Starting Depth Relay");

    let store = Arc::new(FrameStore::new());
    let mut session = CaptureSession::new(store.clone(), calibration, config.capture.clone());
    let events = session.subscribe();

    let mut recorder = if config.recorder.enabled {
        Some(FrameRecorder::from_config(&config.recorder)?)
    } else {
        None
    };

    session.start(SyntheticSensor::with_fps(options.fps))?;

    let mut render = tokio::time::interval(options.render_interval);
    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let deadline = options.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut video_seen = 0u64;
    let mut depth_seen = 0u64;
    let mut stats = RenderStats::default();
    let mut failed = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            _ = render.tick() => {
                if store.updated(ChannelKind::Video, &mut video_seen) {
                    stats.video_frames += 1;
                }
                if store.updated(ChannelKind::Depth, &mut depth_seen) {
                    render_depth(&store, options.sync, recorder.as_ref(), &mut stats);
                }

                while let Ok(event) = events.try_recv() {
                    match event {
                        CaptureEvent::Connected(true) => tracing::info!("Sensor connected"),
                        CaptureEvent::Connected(false) => tracing::info!("Sensor disconnected"),
                        CaptureEvent::Error(message) => {
                            tracing::error!("Capture failed: {}", message);
                            failed = true;
                        }
                        CaptureEvent::NewFrame { .. } => {}
                    }
                }
            }
            _ = report.tick() => {
                print_stats(&store, &session, recorder.as_ref(), &stats);
                stats = RenderStats::default();
            }
        }

        if failed || deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    if !session.stop() {
        tracing::warn!("Capture thread left running");
    }

    if let Some(recorder) = recorder.as_mut() {
        recorder.stop();
        if let Some(e) = recorder.check_errors() {
            tracing::error!("Recorder error: {}", e);
        }
        println!(
            "Recorded {} frames to {}",
            recorder.stats().written,
            recorder.directory().display()
        );
    }

    if failed {
        anyhow::bail!("capture stopped with an error");
    }
    Ok(())
}

/// Read the newest depth frame the way a renderer would. Without `sync` a
/// busy front frame is skipped rather than stalling the render tick.
fn render_depth(store: &FrameStore, sync: bool, recorder: Option<&FrameRecorder>, stats: &mut RenderStats) {
    let mut front = store.front(ChannelKind::Depth).control();
    if sync {
        front.lock();
    } else if !front.try_lock() {
        stats.busy += 1;
        return;
    }
    let Some(buffer) = front.get() else {
        return;
    };

    stats.depth_frames += 1;
    stats.mean_depth = mean_sample(buffer);
    if let Some(recorder) = recorder {
        recorder.submit(buffer);
    }
}

fn mean_sample(buffer: &FrameBuffer) -> f32 {
    let count = buffer.sample_count();
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = (0..count).filter_map(|i| buffer.sample(i)).map(u64::from).sum();
    sum as f32 / count as f32 / 65535.0
}

fn print_stats(
    store: &FrameStore,
    session: &CaptureSession,
    recorder: Option<&FrameRecorder>,
    stats: &RenderStats,
) {
    let video = store.stats(ChannelKind::Video);
    let depth = store.stats(ChannelKind::Depth);
    let session_stats = session.stats();

    print!(
        "video {:>3} fps (drop {:>4.1}%)  depth {:>3} fps (drop {:>4.1}%, busy {})  mean depth {:.3}  ts {}/{}",
        stats.video_frames,
        video.drop_rate() * 100.0,
        stats.depth_frames,
        depth.drop_rate() * 100.0,
        stats.busy,
        stats.mean_depth,
        session_stats.video_time,
        session_stats.depth_time,
    );
    if let Some(recorder) = recorder {
        let recorded = recorder.stats();
        print!("  recorded {} (dropped {})", recorded.written, recorded.dropped);
    }
    println!();
}

fn print_table(calibration: &CalibrationHandle, step: usize) {
    let state = calibration.state();
    let range = state.active();
    println!(
        "# linear={} clip_mode={} near={} far={} max={} clip={}",
        state.linear, state.clip_mode, range.near, range.far, range.max, range.clip
    );

    let table = calibration.table();
    for index in (0..DEPTH_TABLE_SIZE).step_by(step.max(1)) {
        println!("{:>4} {:>5}", index, table.as_slice()[index]);
    }
    if (DEPTH_TABLE_SIZE - 1) % step.max(1) != 0 {
        println!("{:>4} {:>5}", DEPTH_TABLE_SIZE - 1, table.as_slice()[DEPTH_TABLE_SIZE - 1]);
    }
}
