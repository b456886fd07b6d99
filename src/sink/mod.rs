//! Byte sinks: consumers of the fixed-format raw frame stream
//!
//! The capture loop only sees [`ByteSink`]; whether bytes end up in an
//! encoder subprocess, a socket or memory is up to the [`SinkLauncher`].

pub mod ffmpeg;
pub mod memory;

use std::path::Path;

use crate::capture::{FrameMetadata, PixelFormat};
use crate::error::SinkError;

pub use ffmpeg::{FfmpegLauncher, FfmpegSink};
pub use memory::{MemoryLauncher, MemorySink, Recording};

/// Stream parameters fixed for the lifetime of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: u32,
}

impl SinkFormat {
    /// Whether a frame can be appended without desynchronising the consumer.
    pub fn accepts(&self, meta: &FrameMetadata) -> bool {
        meta.width == self.width && meta.height == self.height && meta.format == self.pixel_format
    }
}

/// Ordered raw frame consumer.
pub trait ByteSink: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Close the input and wait until the consumer has flushed everything.
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Creates sinks for new stream sessions.
pub trait SinkLauncher: Send + Sync + 'static {
    type Sink: ByteSink + 'static;

    fn launch(&self, format: &SinkFormat, output: &Path) -> Result<Self::Sink, SinkError>;
}
