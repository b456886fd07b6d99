//! Simulated camera driver
//!
//! Used by `camstream record --simulate` and by the test suite. Feeds are
//! either a fixed script of grab outcomes or a free-running camera that
//! produces synthetic frames at a fixed cadence.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::frame::PixelFormat;
use super::source::{
    BufferId, CameraDriver, DeviceInfo, FrameSource, GrabOutcome, GrabResult, GrabStrategy,
    RawImage,
};
use crate::error::SourceError;

/// Driver buffers available before grabs start failing.
const POOL_SIZE: usize = 4;

/// One scripted grab outcome.
#[derive(Debug, Clone)]
pub enum FakeEvent {
    Frame(Bytes),
    Fail { code: u32, description: String },
    Timeout,
}

impl FakeEvent {
    pub fn frame(data: impl Into<Bytes>) -> Self {
        FakeEvent::Frame(data.into())
    }
}

enum Delivery {
    Frame(Bytes),
    Fail { code: u32, description: String },
}

#[derive(Debug, Clone)]
enum FeedKind {
    Script(Arc<Vec<FakeEvent>>),
    Cadence { interval: Duration, limit: Option<u64> },
}

/// What a simulated device produces once grabbing starts.
#[derive(Debug, Clone)]
pub struct FakeFeed {
    kind: FeedKind,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl FakeFeed {
    /// Replay `events` in order, then time out forever. Frames are 1x1 BGR
    /// unless [`FakeFeed::with_geometry`] says otherwise.
    pub fn script(events: Vec<FakeEvent>) -> Self {
        Self {
            kind: FeedKind::Script(Arc::new(events)),
            width: 1,
            height: 1,
            format: PixelFormat::Bgr24,
        }
    }

    /// Free-running camera producing a frame every `interval`, up to `limit`
    /// frames in total.
    pub fn cadence(interval: Duration, limit: Option<u64>, width: u32, height: u32) -> Self {
        Self {
            kind: FeedKind::Cadence { interval, limit },
            width,
            height,
            format: PixelFormat::Bgr24,
        }
    }

    pub fn with_geometry(mut self, width: u32, height: u32, format: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.format = format;
        self
    }
}

/// Pixels of synthetic frame `n`: the frame number little-endian in the first
/// bytes, then a fill pattern derived from `n`.
pub fn synthetic_frame(width: u32, height: u32, format: PixelFormat, n: u64) -> Vec<u8> {
    let len = width as usize * height as usize * format.bytes_per_pixel().unwrap_or(3) as usize;
    let mut data = vec![(n % 251) as u8; len];
    let header = n.to_le_bytes();
    let head = header.len().min(len);
    data[..head].copy_from_slice(&header[..head]);
    data
}

#[derive(Debug, Default)]
struct DriverState {
    in_use: Mutex<HashSet<String>>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
}

/// In-process stand-in for a camera SDK.
#[derive(Debug, Default)]
pub struct FakeDriver {
    devices: Vec<(String, FakeFeed)>,
    state: Arc<DriverState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, identifier: impl Into<String>, feed: FakeFeed) -> Self {
        self.devices.push((identifier.into(), feed));
        self
    }

    /// Fail the next `count` connection attempts as a flaky link would.
    pub fn failing_connects(self, count: u32) -> Self {
        self.state.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Devices currently connected and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CameraDriver for FakeDriver {
    type Camera = FakeCamera;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        Ok(self
            .devices
            .iter()
            .map(|(identifier, _)| DeviceInfo {
                identifier: identifier.clone(),
                model: "Simulated camera".into(),
                location: format!("sim://{identifier}"),
            })
            .collect())
    }

    fn connect(&self, device: &DeviceInfo) -> Result<FakeCamera, SourceError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let flaky = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(SourceError::ConnectionFailed {
                identifier: device.identifier.clone(),
                reason: "transport layer did not respond".into(),
            });
        }

        let feed = self
            .devices
            .iter()
            .find(|(id, _)| *id == device.identifier)
            .map(|(_, feed)| feed.clone())
            .ok_or_else(|| SourceError::DeviceNotFound {
                identifier: device.identifier.clone(),
            })?;

        let mut in_use = self.state.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_use.insert(device.identifier.clone()) {
            return Err(SourceError::ConnectionFailed {
                identifier: device.identifier.clone(),
                reason: "device busy".into(),
            });
        }

        Ok(FakeCamera {
            identifier: device.identifier.clone(),
            feed,
            driver: Arc::clone(&self.state),
            strategy: None,
            started: Instant::now(),
            cursor: 0,
            current: Bytes::new(),
            outstanding: 0,
            next_buffer: 0,
            closed: false,
        })
    }
}

/// An open simulated device.
#[derive(Debug)]
pub struct FakeCamera {
    identifier: String,
    feed: FakeFeed,
    driver: Arc<DriverState>,
    strategy: Option<GrabStrategy>,
    started: Instant,
    /// Next script index, or next undelivered cadence frame
    cursor: u64,
    current: Bytes,
    outstanding: usize,
    next_buffer: u64,
    closed: bool,
}

impl FakeCamera {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Buffers retrieved but not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding
    }

    fn timed_out(timeout: Duration) -> SourceError {
        SourceError::Timeout {
            ms: timeout.as_millis() as u64,
        }
    }

    /// Pick the next script event or cadence frame, waiting up to `timeout`.
    fn next_event(&mut self, timeout: Duration) -> Result<(u64, Delivery), SourceError> {
        match &self.feed.kind {
            FeedKind::Script(events) => {
                let Some(event) = events.get(self.cursor as usize).cloned() else {
                    thread::sleep(timeout);
                    return Err(Self::timed_out(timeout));
                };
                let n = self.cursor;
                self.cursor += 1;
                match event {
                    FakeEvent::Frame(data) => Ok((n, Delivery::Frame(data))),
                    FakeEvent::Fail { code, description } => {
                        Ok((n, Delivery::Fail { code, description }))
                    }
                    FakeEvent::Timeout => Err(Self::timed_out(timeout)),
                }
            }
            FeedKind::Cadence { interval, limit } => {
                let (interval, limit) = (*interval, *limit);
                let last = limit.map(|l| l.saturating_sub(1));
                if limit == Some(0) || last.is_some_and(|last| self.cursor > last) {
                    thread::sleep(timeout);
                    return Err(Self::timed_out(timeout));
                }

                let elapsed = self.started.elapsed();
                let latest_due = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u64;
                let latest_due = last.map_or(latest_due, |last| latest_due.min(last));

                let n = if latest_due >= self.cursor {
                    match self.strategy {
                        Some(GrabStrategy::LatestImageOnly) => latest_due,
                        _ => self.cursor,
                    }
                } else {
                    let due_at = interval * self.cursor as u32;
                    let wait = due_at.saturating_sub(elapsed);
                    if wait > timeout {
                        thread::sleep(timeout);
                        return Err(Self::timed_out(timeout));
                    }
                    thread::sleep(wait);
                    self.cursor
                };

                if n > self.cursor {
                    debug!(camera = %self.identifier, dropped = n - self.cursor, "Latest-only acquisition dropped frames");
                }
                self.cursor = n + 1;
                let data = synthetic_frame(self.feed.width, self.feed.height, self.feed.format, n);
                Ok((n, Delivery::Frame(Bytes::from(data))))
            }
        }
    }
}

impl FrameSource for FakeCamera {
    fn begin_grabbing(&mut self, strategy: GrabStrategy) -> Result<(), SourceError> {
        self.strategy = Some(strategy);
        self.started = Instant::now();
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError> {
        if self.strategy.is_none() || self.closed {
            return Err(SourceError::GrabFailed {
                code: 0,
                description: "camera is not grabbing".into(),
            });
        }
        if self.outstanding >= POOL_SIZE {
            return Err(SourceError::GrabFailed {
                code: 0,
                description: "buffer pool exhausted".into(),
            });
        }

        let (n, event) = self.next_event(timeout)?;
        let buffer = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.outstanding += 1;

        let outcome = match event {
            Delivery::Frame(data) => {
                self.current = data;
                GrabOutcome::Succeeded(RawImage {
                    data: &self.current,
                    width: self.feed.width,
                    height: self.feed.height,
                    format: self.feed.format,
                    frame_number: n,
                    device_timestamp: Some(self.started.elapsed()),
                })
            }
            Delivery::Fail { code, description } => GrabOutcome::Failed { code, description },
        };

        Ok(GrabResult { buffer, outcome })
    }

    fn release(&mut self, _buffer: BufferId) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn end_grabbing(&mut self) {
        self.strategy = None;
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.driver
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identifier);
        debug!(camera = %self.identifier, "Simulated camera closed");
    }
}
