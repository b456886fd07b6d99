//! Background capture loop for one camera
//!
//! One thread per session runs grab → publish → forward → pace until asked
//! to stop or the sink dies. The thread owns the camera and the sink; the
//! only state it shares is the latest-frame cache and the counters.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, instrument, warn};

use super::cache::LatestFrameCache;
use super::stats::{CaptureStats, StatsSnapshot};
use crate::capture::{self, CameraDriver, Frame, FrameSource, GrabStrategy, RetryPolicy};
use crate::error::{CaptureError, SourceError};
use crate::sink::{ByteSink, SinkFormat, SinkLauncher};
use crate::Config;

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Opening the camera or launching the sink failed
    FailedStart,
    /// The capture thread ended on a fatal sink error and awaits `stop`
    Failed,
}

/// Everything a session needs to start.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub identifier: String,
    pub output: PathBuf,
    pub retry: RetryPolicy,
    pub grab_timeout: Duration,
    /// Target cycle period; `None` runs as fast as the camera delivers
    pub pace_interval: Option<Duration>,
    /// Fixed stream format handed to the sink
    pub format: SinkFormat,
}

impl StreamSettings {
    /// Settings for `identifier`. A `{serial}` placeholder in the configured
    /// output path is replaced by the identifier.
    pub fn from_config(config: &Config, identifier: &str) -> Self {
        let output = config.encoder.output.to_string_lossy().replace("{serial}", identifier);

        Self {
            identifier: identifier.to_string(),
            output: PathBuf::from(output),
            retry: config.capture.retry_policy(),
            grab_timeout: config.capture.grab_timeout(),
            pace_interval: config.capture.pace_interval(),
            format: SinkFormat {
                width: config.capture.width,
                height: config.capture.height,
                pixel_format: config.capture.output_format,
                frame_rate: config.encoder.frame_rate,
            },
        }
    }
}

/// Summary returned by a clean stop.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub identifier: String,
    pub output: PathBuf,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

fn transition(state: &AtomicCell<SessionState>, camera: &str, to: SessionState) {
    let from = state.swap(to);
    if from != to {
        debug!(camera = %camera, ?from, ?to, "Session state changed");
    }
}

/// A started capture session.
pub struct StreamSession {
    identifier: String,
    output: PathBuf,
    state: Arc<AtomicCell<SessionState>>,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<Result<(), CaptureError>>>,
    cache: Arc<LatestFrameCache>,
    stats: Arc<CaptureStats>,
    started_at: Instant,
}

impl StreamSession {
    /// Open the camera, start acquisition, launch the sink and spawn the
    /// capture thread. Nothing stays open when this fails.
    #[instrument(skip_all, fields(camera = %settings.identifier))]
    pub fn start<D, L>(driver: &D, launcher: &L, settings: StreamSettings) -> Result<Self, CaptureError>
    where
        D: CameraDriver,
        L: SinkLauncher,
    {
        let id = settings.identifier.clone();
        let state = Arc::new(AtomicCell::new(SessionState::Idle));
        transition(&state, &id, SessionState::Starting);

        let failed_start = |e: CaptureError| {
            error!(camera = %id, error = %e, "Failed to start stream");
            transition(&state, &id, SessionState::FailedStart);
            transition(&state, &id, SessionState::Idle);
            e
        };

        let mut camera = capture::open(driver, &id, &settings.retry)
            .map_err(|e| failed_start(e.into()))?;

        if let Err(e) = camera.begin_grabbing(GrabStrategy::LatestImageOnly) {
            camera.close();
            return Err(failed_start(e.into()));
        }

        let sink = match launcher.launch(&settings.format, &settings.output) {
            Ok(sink) => sink,
            Err(e) => {
                camera.end_grabbing();
                camera.close();
                return Err(failed_start(e.into()));
            }
        };

        let cache = Arc::new(LatestFrameCache::new());
        let stats = Arc::new(CaptureStats::new());
        let (stop_tx, stop_rx) = flume::bounded(1);

        let worker = CaptureWorker {
            identifier: id.clone(),
            camera,
            sink,
            cache: Arc::clone(&cache),
            stats: Arc::clone(&stats),
            stop_rx,
            state: Arc::clone(&state),
            format: settings.format,
            grab_timeout: settings.grab_timeout,
            pace_interval: settings.pace_interval,
            released: false,
        };

        transition(&state, &id, SessionState::Running);
        let handle = thread::Builder::new()
            .name(format!("capture-{id}"))
            .spawn(move || worker.run())
            .map_err(|e| failed_start(CaptureError::Spawn(e)))?;

        info!(
            camera = %id,
            output = %settings.output.display(),
            "Stream started: {}x{} {:?} @{}fps",
            settings.format.width,
            settings.format.height,
            settings.format.pixel_format,
            settings.format.frame_rate,
        );

        Ok(Self {
            identifier: id,
            output: settings.output,
            state,
            stop_tx,
            worker: Some(handle),
            cache,
            stats,
            started_at: Instant::now(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Copy of the latest frame for preview, `None` unless running.
    pub fn get_frame(&self) -> Option<Frame> {
        if self.state() != SessionState::Running {
            return None;
        }
        self.cache.peek()
    }

    /// Drop the preview frame, e.g. when the viewer disables live display.
    pub fn clear_preview(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The capture thread has exited on its own or after a stop request.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Signal the capture thread, wait for it to release the camera and for
    /// the sink to finish, and report how the session ended.
    #[instrument(skip_all, fields(camera = %self.identifier))]
    pub fn stop(mut self) -> Result<SessionReport, CaptureError> {
        let result = self.join();
        self.cache.clear();
        transition(&self.state, &self.identifier, SessionState::Idle);

        let report = SessionReport {
            identifier: self.identifier.clone(),
            output: self.output.clone(),
            stats: self.stats.snapshot(),
            elapsed: self.started_at.elapsed(),
        };

        match result {
            Ok(()) => {
                info!(
                    camera = %report.identifier,
                    frames = report.stats.frames_forwarded,
                    "Stream stopped after {:.1}s",
                    report.elapsed.as_secs_f64()
                );
                Ok(report)
            }
            Err(e) => {
                error!(camera = %report.identifier, error = %e, "Stream ended with error");
                Err(e)
            }
        }
    }

    fn join(&mut self) -> Result<(), CaptureError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        if self.state.compare_exchange(SessionState::Running, SessionState::Stopping).is_ok() {
            debug!(camera = %self.identifier, "Stop requested");
        }
        // Full means a stop is already pending; disconnected means the worker is gone
        let _ = self.stop_tx.try_send(());

        worker.join().unwrap_or_else(|_| {
            Err(CaptureError::WorkerPanicked {
                identifier: self.identifier.clone(),
            })
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            warn!(camera = %self.identifier, "Session dropped while running, stopping");
            if let Err(e) = self.join() {
                error!(camera = %self.identifier, error = %e, "Stream ended with error");
            }
        }
    }
}

/// State owned by the capture thread.
struct CaptureWorker<S: FrameSource, K: ByteSink> {
    identifier: String,
    camera: S,
    sink: K,
    cache: Arc<LatestFrameCache>,
    stats: Arc<CaptureStats>,
    stop_rx: Receiver<()>,
    state: Arc<AtomicCell<SessionState>>,
    format: SinkFormat,
    grab_timeout: Duration,
    pace_interval: Option<Duration>,
    released: bool,
}

impl<S: FrameSource, K: ByteSink> CaptureWorker<S, K> {
    fn run(mut self) -> Result<(), CaptureError> {
        debug!(camera = %self.identifier, "Capture thread started");

        let result = self.capture_cycle();
        transition(&self.state, &self.identifier, SessionState::Stopping);
        let finished = self.release();

        let result = match (result, finished) {
            (Ok(()), finished) => finished.map_err(CaptureError::from),
            (Err(e), Err(finish_err)) => {
                warn!(camera = %self.identifier, error = %finish_err, "Sink did not finish cleanly");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };

        let end = if result.is_ok() {
            SessionState::Idle
        } else {
            // The last published frame may never have reached the sink
            self.cache.clear();
            SessionState::Failed
        };
        transition(&self.state, &self.identifier, end);
        debug!(camera = %self.identifier, "Capture thread exiting");
        result
    }

    /// Loop until stopped. Returns an error only for fatal sink failures.
    fn capture_cycle(&mut self) -> Result<(), CaptureError> {
        loop {
            if self.stop_requested() {
                return Ok(());
            }
            let cycle_start = Instant::now();

            match capture::grab_next(&mut self.camera, self.grab_timeout, self.format.pixel_format) {
                Ok(frame) => {
                    self.stats.record_grab();
                    self.cache.publish(frame.clone());
                    self.forward(&frame)?;
                }
                Err(SourceError::Timeout { ms }) => {
                    warn!(camera = %self.identifier, "No frame within {}ms", ms);
                    self.stats.record_timeout();
                }
                Err(e) => {
                    warn!(camera = %self.identifier, error = %e, "Grab failed");
                    self.stats.record_failure();
                }
            }

            if let Some(period) = self.pace_interval {
                if self.wait_for_stop(period.saturating_sub(cycle_start.elapsed())) {
                    return Ok(());
                }
            }
        }
    }

    fn forward(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if !self.format.accepts(&frame.meta) {
            warn!(
                camera = %self.identifier,
                sequence = frame.sequence(),
                "Frame {}x{} {:?} does not match sink format, not forwarded",
                frame.width(),
                frame.height(),
                frame.meta.format
            );
            self.stats.record_skip();
            return Ok(());
        }

        if let Err(e) = self.sink.write_frame(frame.as_bytes()) {
            error!(camera = %self.identifier, error = %e, "Sink write failed, ending session");
            return Err(e.into());
        }
        self.stats.record_forward(frame.data.len());
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Pacing sleep that wakes early on a stop request.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        !matches!(self.stop_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Stop acquisition, close the camera, then close and await the sink.
    fn release(&mut self) -> Result<(), crate::error::SinkError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.camera.end_grabbing();
        self.camera.close();
        self.sink.finish()
    }
}

impl<S: FrameSource, K: ByteSink> Drop for CaptureWorker<S, K> {
    fn drop(&mut self) {
        // Reached without `run` finishing only on panic or spawn failure
        if let Err(e) = self.release() {
            warn!(camera = %self.identifier, error = %e, "Sink did not finish cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::{FakeDriver, FakeEvent, FakeFeed};
    use crate::capture::PixelFormat;
    use crate::sink::MemoryLauncher;

    fn settings(id: &str) -> StreamSettings {
        StreamSettings {
            identifier: id.into(),
            output: PathBuf::from("mem.raw"),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
            grab_timeout: Duration::from_millis(20),
            pace_interval: None,
            format: SinkFormat {
                width: 1,
                height: 1,
                pixel_format: PixelFormat::Bgr24,
                frame_rate: 50,
            },
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_output_placeholder_uses_serial() {
        let mut config = Config::default();
        config.encoder.output = PathBuf::from("cam-{serial}.mp4");
        let settings = StreamSettings::from_config(&config, "24750353");

        assert_eq!(settings.output, PathBuf::from("cam-24750353.mp4"));
        assert_eq!(settings.format.width, 1280);
        assert_eq!(settings.format.frame_rate, 50);
    }

    #[test]
    fn test_mismatched_frames_are_published_not_forwarded() {
        let feed = FakeFeed::script(vec![FakeEvent::frame(vec![9u8; 12])])
            .with_geometry(2, 2, PixelFormat::Rgb24);
        let driver = FakeDriver::new().with_device("1111", feed);
        let launcher = MemoryLauncher::new();

        let session = StreamSession::start(&driver, &launcher, settings("1111")).unwrap();
        wait_until(|| session.stats().frames_grabbed == 1);

        assert_eq!(session.get_frame().unwrap().width(), 2);
        let report = session.stop().unwrap();
        assert_eq!(report.stats.frames_skipped, 1);
        assert_eq!(launcher.recording().frames(), 0);
    }

    #[test]
    fn test_sink_failure_ends_session() {
        let events = (0..5u8).map(|i| FakeEvent::frame(vec![i; 3])).collect();
        let driver = FakeDriver::new().with_device("1111", FakeFeed::script(events));
        let launcher = MemoryLauncher::new().failing_after(2);

        let session = StreamSession::start(&driver, &launcher, settings("1111")).unwrap();
        wait_until(|| session.is_finished());

        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(driver.open_handles(), 0);
        assert_eq!(launcher.recording().finished(), 1);
        assert!(session.get_frame().is_none());

        let err = session.stop().unwrap_err();
        assert!(matches!(err, CaptureError::Sink(crate::SinkError::Write(_))));
        assert_eq!(launcher.recording().frames(), 2);
    }

    #[test]
    fn test_sink_launch_failure_closes_camera() {
        struct Refusing;
        impl SinkLauncher for Refusing {
            type Sink = crate::sink::MemorySink;
            fn launch(
                &self,
                format: &SinkFormat,
                _output: &std::path::Path,
            ) -> Result<Self::Sink, crate::SinkError> {
                Err(crate::SinkError::UnsupportedFormat(format.pixel_format))
            }
        }

        let driver = FakeDriver::new().with_device("1111", FakeFeed::script(vec![]));
        let err = StreamSession::start(&driver, &Refusing, settings("1111")).err().unwrap();

        assert!(matches!(err, CaptureError::Sink(_)));
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_stop_interrupts_pacing_wait() {
        let driver = FakeDriver::new()
            .with_device("1111", FakeFeed::script(vec![FakeEvent::frame(vec![1u8; 3])]));
        let launcher = MemoryLauncher::new();
        let mut settings = settings("1111");
        settings.pace_interval = Some(Duration::from_secs(10));

        let session = StreamSession::start(&driver, &launcher, settings).unwrap();
        wait_until(|| launcher.recording().frames() == 1);

        let begun = Instant::now();
        session.stop().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
    }
}
