//! framerelay - shared-memory frame/cursor relay
//!
//! Entry point for the demo binary: `host` publishes synthetic frames into
//! a region file, `view` attaches to one and logs what arrives. The two
//! subcommands run in separate processes against the same file, exercising
//! the full cross-process path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use framerelay::cursor::{CursorEvent, CursorShapeUpdate, CursorSink};
use framerelay::frame::publisher::CopyWorker;
use framerelay::frame::RenderSink;
use framerelay::{
    CursorKind, CursorShape, DamageRect, Feature, FrameDescriptor, FrameMetadata, PixelFormat,
    RelayClient, RelayConfig, RelayError, RelayHost, Rotation,
};

/// Command-line arguments for framerelay
#[derive(Parser, Debug)]
#[command(name = "framerelay")]
#[command(version, about = "Shared-memory frame/cursor relay", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish synthetic frames into a region file
    Host {
        /// Region file to create
        region: PathBuf,

        /// Frame width in pixels
        #[arg(long, default_value_t = 1280)]
        width: u32,

        /// Frame height in pixels
        #[arg(long, default_value_t = 720)]
        height: u32,

        /// Publication rate
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Stop after this many frames (0 = run until killed)
        #[arg(long, default_value_t = 0)]
        frames: u64,
    },
    /// Attach to a region file and log received frames
    View {
        /// Region file to open
        region: PathBuf,

        /// Stop after this many frames (0 = run until killed)
        #[arg(long, default_value_t = 0)]
        frames: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("framerelay v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RelayConfig::load(path).context("loading configuration")?,
        None => RelayConfig::default(),
    };

    match args.command {
        Command::Host {
            region,
            width,
            height,
            fps,
            frames,
        } => run_host(&config, &region, width, height, fps, frames),
        Command::View { region, frames } => run_view(&config, &region, frames),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("framerelay={level},warn")));

    match args.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        "compact" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
    Ok(())
}

// =============================================================================
// Host mode
// =============================================================================

fn run_host(
    config: &RelayConfig,
    region: &PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    frames: u64,
) -> Result<()> {
    let mut host = RelayHost::create_file(
        region,
        config,
        Feature::PartialDamage | Feature::CursorRelay,
    )
    .context("creating relay region")?;
    info!(path = %region.display(), width, height, fps, "hosting");

    host.cursor().set_shape(crosshair_shape())?;

    let worker = CopyWorker::spawn();
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let pitch = width * 4;
    let mut serial = 0u64;

    loop {
        let started = Instant::now();
        host.service()?;

        // A vertical band sweeps across an otherwise static gradient.
        let band_w = 64.min(width);
        let band_x = ((serial * 8) % (width - band_w).max(1) as u64) as u32;
        let meta = FrameMetadata {
            format: PixelFormat::Bgra,
            screen_width: width,
            screen_height: height,
            width,
            height,
            stride: width,
            pitch,
            rotation: Rotation::Rot0,
            damage: vec![DamageRect::new(band_x, 0, band_w + 8, height)],
        };

        match host.frame().begin(&meta) {
            Ok(pending) => {
                worker.submit(pending, synth_frame(width, height, pitch, band_x, band_w))?;
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "skipping frame");
            }
            Err(e) => return Err(e.into()),
        }

        // The cursor orbits the center.
        let angle = serial as f64 / 30.0;
        let cx = (width / 2) as i32 + (angle.cos() * 200.0) as i32;
        let cy = (height / 2) as i32 + (angle.sin() * 200.0) as i32;
        if let Err(e) = host.cursor().move_to(cx, cy, true) {
            if !matches!(e, RelayError::QueueFull(_)) {
                return Err(e.into());
            }
        }

        serial += 1;
        if frames != 0 && serial >= frames {
            break;
        }
        if serial % 300 == 0 {
            let stats = host.frame().stats();
            info!(
                published = stats.published(),
                dropped = stats.dropped(),
                reposted = stats.reposted(),
                "host stats"
            );
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }

    info!(published = host.frame().stats().published(), "host done");
    Ok(())
}

fn synth_frame(width: u32, height: u32, pitch: u32, band_x: u32, band_w: u32) -> Vec<u8> {
    let mut data = vec![0u8; height as usize * pitch as usize];
    for y in 0..height {
        let row = y as usize * pitch as usize;
        for x in 0..width {
            let px = row + x as usize * 4;
            let in_band = x >= band_x && x < band_x + band_w;
            data[px] = (x & 0xff) as u8;
            data[px + 1] = (y & 0xff) as u8;
            data[px + 2] = if in_band { 0xff } else { 0x20 };
            data[px + 3] = 0xff;
        }
    }
    data
}

fn crosshair_shape() -> CursorShape {
    let (w, h, pitch) = (16u32, 16u32, 64u32);
    let mut data = vec![0u8; (h * pitch) as usize];
    for i in 0..w {
        for (x, y) in [(i, h / 2), (w / 2, i)] {
            let px = (y * pitch + x * 4) as usize;
            data[px..px + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        }
    }
    CursorShape {
        kind: CursorKind::Color,
        width: w,
        height: h,
        pitch,
        hot_x: (w / 2) as i32,
        hot_y: (h / 2) as i32,
        data,
    }
}

// =============================================================================
// View mode
// =============================================================================

struct LogRenderSink {
    limit: u64,
    seen: u64,
}

impl RenderSink for LogRenderSink {
    fn on_format_change(&mut self, desc: &FrameDescriptor) {
        info!(
            format = ?desc.format,
            width = desc.width,
            height = desc.height,
            version = desc.format_version,
            "format changed"
        );
    }

    fn on_frame(&mut self, desc: &FrameDescriptor, payload: &[u8]) -> bool {
        self.seen += 1;
        if self.seen % 60 == 1 {
            info!(
                serial = desc.serial,
                bytes = payload.len(),
                damage = desc.damage.len(),
                "frame"
            );
        }
        self.limit == 0 || self.seen < self.limit
    }

    fn on_pause_change(&mut self, paused: bool) {
        info!(paused, "producer pause state");
    }
}

struct LogCursorSink;

impl CursorSink for LogCursorSink {
    fn on_cursor_shape(&mut self, update: &CursorShapeUpdate, _payload: &[u8]) -> bool {
        info!(
            kind = ?update.kind,
            width = update.width,
            height = update.height,
            version = update.version,
            "cursor shape"
        );
        true
    }

    fn on_cursor_event(&mut self, _event: &CursorEvent) -> bool {
        true
    }
}

fn run_view(config: &RelayConfig, region: &PathBuf, frames: u64) -> Result<()> {
    let client =
        RelayClient::open_file(region, &config.timing).context("attaching to relay region")?;
    info!(features = ?client.features(), "attached");

    let running = Arc::new(AtomicBool::new(true));

    let cursor_running = running.clone();
    let mut cursor = client.cursor_consumer()?;
    let cursor_thread = std::thread::Builder::new()
        .name("cursor-view".into())
        .spawn(move || cursor.run(&mut LogCursorSink, &cursor_running))?;

    let mut consumer = client.frame_consumer()?;
    let mut sink = LogRenderSink {
        limit: frames,
        seen: 0,
    };
    let result = consumer.run(&mut sink, &running);

    running.store(false, Ordering::Relaxed);
    match cursor_thread.join() {
        Ok(r) => r?,
        Err(_) => warn!("cursor thread panicked"),
    }

    let stats = consumer.stats();
    info!(
        received = stats.received,
        malformed = stats.malformed,
        "view done"
    );
    result.map_err(Into::into)
}
