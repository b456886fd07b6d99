//! ffmpeg subprocess sink
//!
//! Raw frames go to the encoder's stdin; closing stdin signals end of stream
//! and the sink waits for ffmpeg to finish writing the container.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, info, warn};

use super::{ByteSink, SinkFormat, SinkLauncher};
use crate::error::SinkError;
use crate::EncoderConfig;

/// Launches one ffmpeg process per session.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    settings: EncoderConfig,
}

impl FfmpegLauncher {
    pub fn new(settings: EncoderConfig) -> Self {
        Self { settings }
    }

    /// Command line for a raw-video-on-stdin encode into `output`.
    pub fn build_args(&self, format: &SinkFormat, output: &Path) -> Result<Vec<String>, SinkError> {
        let pixel_format = format
            .pixel_format
            .ffmpeg_name()
            .ok_or(SinkError::UnsupportedFormat(format.pixel_format))?;

        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];
        if self.settings.overwrite {
            args.push("-y".into());
        }
        let video_size = format!("{}x{}", format.width, format.height);
        let frame_rate = format.frame_rate.to_string();
        let crf = self.settings.crf.to_string();
        let input: [&str; 16] = [
            "-f",
            "rawvideo",
            "-pixel_format",
            pixel_format,
            "-video_size",
            &video_size,
            "-framerate",
            &frame_rate,
            "-i",
            "-",
            "-c:v",
            &self.settings.codec,
            "-preset",
            &self.settings.preset,
            "-crf",
            &crf,
        ];
        args.extend(input.map(String::from));
        args.extend(self.settings.extra_args.iter().cloned());
        args.push(output.to_string_lossy().into_owned());
        Ok(args)
    }
}

impl SinkLauncher for FfmpegLauncher {
    type Sink = FfmpegSink;

    fn launch(&self, format: &SinkFormat, output: &Path) -> Result<FfmpegSink, SinkError> {
        let args = self.build_args(format, output)?;
        debug!("Encoder command: {} {}", self.settings.program, args.join(" "));

        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SinkError::Spawn {
                program: self.settings.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        info!(
            "Encoder running: {}x{} {:?} @{}fps -> {}",
            format.width,
            format.height,
            format.pixel_format,
            format.frame_rate,
            output.display()
        );

        Ok(FfmpegSink {
            child,
            stdin,
            output: output.to_path_buf(),
            finished: false,
        })
    }
}

/// A running ffmpeg encode.
#[derive(Debug)]
pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    finished: bool,
}

impl ByteSink for FfmpegSink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            SinkError::Write(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })?;
        stdin.write_all(bytes).map_err(SinkError::Write)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // Dropping stdin sends EOF
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                warn!("Failed to flush encoder input: {}", e);
            }
        }

        let status = self.child.wait().map_err(SinkError::Wait)?;
        if !status.success() {
            return Err(SinkError::EncoderFailed {
                output: self.output.clone(),
                status: status.to_string(),
            });
        }

        info!("Encoder finished writing {}", self.output.display());
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Encoder did not finish cleanly: {}", e);
        }
    }
}
