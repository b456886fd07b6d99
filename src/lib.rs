pub mod capture;
pub mod error;
pub mod pipeline;
pub mod sink;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{PixelFormat, RetryPolicy};
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{CaptureError, SinkError, SourceError};
pub use pipeline::{SessionReport, SessionState, StreamManager};

/// Prefix for environment overrides, e.g. `CAMSTREAM__CAPTURE__SERIAL`.
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera serial number (V4L2 bus info for the V4L2 driver)
    pub serial: String,
    pub width: u32,
    pub height: u32,
    /// Format requested from the camera
    pub source_format: PixelFormat,
    /// Packed layout frames are converted to for preview and encoding
    pub output_format: PixelFormat,
    /// Capture loop pacing; 0 disables pacing
    pub pace_fps: u32,
    pub grab_timeout_ms: u64,
    pub open_attempts: u32,
    pub open_backoff_ms: u64,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    pub output: PathBuf,
    /// Frame rate declared to the encoder for the raw input
    pub frame_rate: u32,
    pub codec: String,
    pub preset: String,
    pub crf: u8,
    /// Overwrite the output file if it exists
    pub overwrite: bool,
    /// Extra arguments inserted before the output path
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub refresh_fps: u32,
    pub live_display: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            serial: "24750353".into(),
            width: 1280,
            height: 720,
            source_format: PixelFormat::Mjpeg,
            output_format: PixelFormat::Bgr24,
            pace_fps: 50,
            grab_timeout_ms: 5000,
            open_attempts: 5,
            open_backoff_ms: 2000,
            buffer_count: 4,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            output: PathBuf::from("output.mp4"),
            frame_rate: 50,
            codec: "libx264".into(),
            preset: "superfast".into(),
            crf: 28,
            overwrite: true,
            extra_args: Vec::new(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            refresh_fps: 30,
            live_display: true,
        }
    }
}

impl CaptureConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.open_attempts,
            backoff: Duration::from_millis(self.open_backoff_ms),
        }
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    /// Target period of one capture cycle, `None` when pacing is off.
    pub fn pace_interval(&self) -> Option<Duration> {
        (self.pace_fps > 0).then(|| Duration::from_secs(1) / self.pace_fps)
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMSTREAM__*` environment
    /// variables, later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }
}
