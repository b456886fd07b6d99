//! camstream: record an industrial camera to video with live preview

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camstream::capture::fake::{FakeDriver, FakeFeed};
use camstream::capture::{CameraDriver, V4l2Driver};
use camstream::sink::{FfmpegLauncher, SinkLauncher};
use camstream::{Config, Frame, StreamManager};
use clap::{Parser, Subcommand};
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camstream")]
#[command(about = "Capture an industrial camera to a video file with live preview")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List capture devices and their identifiers
    List,
    /// Record a camera until Ctrl-C or the duration elapses
    Record {
        /// Camera serial number
        #[arg(short, long)]
        serial: Option<String>,

        /// Output video file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Recording duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Use a simulated camera instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Save the last preview frame as an image on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).wrap_err("Failed to load configuration")?;

    match cli.command {
        Command::List => list_devices(&config),
        Command::Record {
            serial,
            output,
            duration,
            simulate,
            snapshot,
        } => {
            if let Some(serial) = serial {
                config.capture.serial = serial;
            }
            if let Some(output) = output {
                config.encoder.output = output;
            }
            let duration = duration.map(Duration::from_secs);
            let launcher = FfmpegLauncher::new(config.encoder.clone());

            if simulate {
                let interval = Duration::from_secs(1) / config.encoder.frame_rate.max(1);
                let feed = FakeFeed::cadence(interval, None, config.capture.width, config.capture.height);
                let driver = FakeDriver::new().with_device(config.capture.serial.clone(), feed);
                record(driver, launcher, config, duration, snapshot).await
            } else {
                let driver = v4l2_driver(&config);
                record(driver, launcher, config, duration, snapshot).await
            }
        }
    }
}

fn v4l2_driver(config: &Config) -> V4l2Driver {
    V4l2Driver {
        width: config.capture.width,
        height: config.capture.height,
        format: config.capture.source_format,
        buffer_count: config.capture.buffer_count,
    }
}

fn list_devices(config: &Config) -> Result<()> {
    let devices = v4l2_driver(config).enumerate()?;

    if devices.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    for device in devices {
        println!("  {}  {} ({})", device.identifier, device.model, device.location);
    }
    Ok(())
}

async fn record<D, L>(
    driver: D,
    launcher: L,
    config: Config,
    duration: Option<Duration>,
    snapshot: Option<PathBuf>,
) -> Result<()>
where
    D: CameraDriver,
    L: SinkLauncher,
{
    let serial = config.capture.serial.clone();
    let viewer = config.viewer.clone();
    let manager = Arc::new(StreamManager::new(driver, launcher, config));

    info!("camstream launching, camera {}", serial);

    // Opening retries with sleeps, keep it off the async workers
    {
        let manager = Arc::clone(&manager);
        let serial = serial.clone();
        tokio::task::spawn_blocking(move || manager.start(&serial))
            .await?
            .wrap_err_with(|| format!("Failed to start stream for camera {serial}"))?;
    }

    let refresh = Duration::from_secs(1) / viewer.refresh_fps.max(1);
    let mut ticker = tokio::time::interval(refresh);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut last_preview: Option<Frame> = None;
    let mut previews = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping stream");
                break;
            }
            _ = &mut deadline => {
                info!("Recording duration reached");
                break;
            }
            _ = ticker.tick() => {
                if !viewer.live_display {
                    manager.clear_preview(&serial);
                    continue;
                }
                if let Some(frame) = manager.get_frame(&serial) {
                    if last_preview.as_ref().map(|f| f.sequence()) != Some(frame.sequence()) {
                        previews += 1;
                    }
                    last_preview = Some(frame);
                }
                if !manager.failed_sessions().is_empty() {
                    warn!("Stream ended unexpectedly");
                    break;
                }
            }
        }
    }

    let report = {
        let manager = Arc::clone(&manager);
        let serial = serial.clone();
        tokio::task::spawn_blocking(move || manager.stop(&serial)).await?
    }
    .wrap_err("Stream failed")?
    .ok_or_else(|| eyre!("Stream for camera {} was not running", serial))?;

    info!(
        "Recorded {} frames ({} bytes) to {} in {:.1}s; {} timeouts, {} grab failures, {} skipped, {} previews",
        report.stats.frames_forwarded,
        report.stats.bytes_forwarded,
        report.output.display(),
        report.elapsed.as_secs_f64(),
        report.stats.grab_timeouts,
        report.stats.grab_failures,
        report.stats.frames_skipped,
        previews
    );

    if let Some(path) = snapshot {
        let frame = last_preview.ok_or_else(|| eyre!("No preview frame was received"))?;
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| eyre!("Preview frame is not RGB"))?;
        image
            .save(&path)
            .wrap_err_with(|| format!("Failed to save snapshot to {}", path.display()))?;
        info!("Saved preview snapshot to {}", path.display());
    }

    Ok(())
}
