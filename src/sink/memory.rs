//! In-memory sink that records everything written to it

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{ByteSink, SinkFormat, SinkLauncher};
use crate::error::SinkError;

/// Shared view of what every sink from one launcher received.
#[derive(Debug, Default)]
pub struct Recording {
    bytes: Mutex<Vec<u8>>,
    sessions: Mutex<Vec<(SinkFormat, PathBuf)>>,
    frames: AtomicUsize,
    finished: AtomicUsize,
}

impl Recording {
    /// Concatenation of all frames written so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Sinks launched so far, with their format and output target.
    pub fn sessions(&self) -> Vec<(SinkFormat, PathBuf)> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sinks that were closed and awaited.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Launches [`MemorySink`]s sharing one [`Recording`].
#[derive(Debug, Clone, Default)]
pub struct MemoryLauncher {
    recording: Arc<Recording>,
    fail_after: Option<usize>,
}

impl MemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes with a broken pipe once `frames` frames were accepted.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn recording(&self) -> Arc<Recording> {
        Arc::clone(&self.recording)
    }
}

impl SinkLauncher for MemoryLauncher {
    type Sink = MemorySink;

    fn launch(&self, format: &SinkFormat, output: &Path) -> Result<MemorySink, SinkError> {
        self.recording
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*format, output.to_path_buf()));

        Ok(MemorySink {
            recording: Arc::clone(&self.recording),
            remaining: self.fail_after,
            closed: false,
        })
    }
}

pub struct MemorySink {
    recording: Arc<Recording>,
    remaining: Option<usize>,
    closed: bool,
}

impl ByteSink for MemorySink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.closed || self.remaining == Some(0) {
            return Err(SinkError::Write(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        self.recording
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        self.recording.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if !self.closed {
            self.closed = true;
            self.recording.finished.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn format() -> SinkFormat {
        SinkFormat {
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Bgr24,
            frame_rate: 50,
        }
    }

    #[test]
    fn test_records_in_order() {
        let launcher = MemoryLauncher::new();
        let mut sink = launcher.launch(&format(), Path::new("mem")).unwrap();
        sink.write_frame(&[1, 2, 3]).unwrap();
        sink.write_frame(&[4, 5, 6]).unwrap();
        sink.finish().unwrap();

        let recording = launcher.recording();
        assert_eq!(recording.bytes(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(recording.frames(), 2);
        assert_eq!(recording.finished(), 1);
        assert_eq!(recording.sessions()[0].0, format());
    }

    #[test]
    fn test_broken_pipe_after_limit() {
        let launcher = MemoryLauncher::new().failing_after(1);
        let mut sink = launcher.launch(&format(), Path::new("mem")).unwrap();
        sink.write_frame(&[1, 2, 3]).unwrap();

        let err = sink.write_frame(&[4, 5, 6]).unwrap_err();
        assert!(matches!(err, SinkError::Write(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(launcher.recording().frames(), 1);
    }
}
