use std::path::PathBuf;

use thiserror::Error;

use crate::capture::PixelFormat;

/// Errors raised by a camera driver or an open frame source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Camera with serial number {identifier} not found")]
    DeviceNotFound { identifier: String },

    #[error("Failed to connect to camera {identifier}: {reason}")]
    ConnectionFailed { identifier: String, reason: String },

    #[error("Grab timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Grab failed ({code:#x}): {description}")]
    GrabFailed { code: u32, description: String },

    #[error("Cannot convert {from:?} to {to:?}")]
    UnsupportedConversion { from: PixelFormat, to: PixelFormat },

    #[error("Failed to decode frame: {reason}")]
    DecodeFailed { reason: String },

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a byte sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to launch encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported sink pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("Failed to write frame to sink: {0}")]
    Write(#[source] std::io::Error),

    #[error("Encoder for {output} exited with {status}")]
    EncoderFailed { output: PathBuf, status: String },

    #[error("Failed waiting for encoder: {0}")]
    Wait(#[source] std::io::Error),
}

/// Session-level errors surfaced to whoever owns the stream lifecycle.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Capture thread for {identifier} panicked")]
    WorkerPanicked { identifier: String },

    #[error("Failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}
