//! Frame source abstraction over an industrial camera SDK
//!
//! A [`CameraDriver`] enumerates and connects devices; the resulting
//! [`FrameSource`] hands out hardware buffers that must be released
//! explicitly once their pixels have been copied out.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::decoder::convert_frame;
use super::frame::{Frame, PixelFormat};
use crate::error::SourceError;

/// A device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identifier (serial number)
    pub identifier: String,
    pub model: String,
    /// Driver-specific address, e.g. `/dev/video0`
    pub location: String,
}

/// Acquisition buffering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStrategy {
    /// Keep only the newest frame; older unconsumed frames are dropped
    LatestImageOnly,
    /// Deliver every frame in order
    OneByOne,
}

/// Opaque handle to a driver buffer that must go back via [`FrameSource::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub u64);

/// Unconverted pixels still living in a driver buffer.
#[derive(Debug)]
pub struct RawImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Device frame counter
    pub frame_number: u64,
    pub device_timestamp: Option<Duration>,
}

#[derive(Debug)]
pub enum GrabOutcome<'a> {
    Succeeded(RawImage<'a>),
    Failed { code: u32, description: String },
}

/// A retrieved buffer: either image data or the device's failure report.
#[derive(Debug)]
pub struct GrabResult<'a> {
    pub buffer: BufferId,
    pub outcome: GrabOutcome<'a>,
}

/// Camera SDK entry point: device discovery and connection.
pub trait CameraDriver: Send + Sync + 'static {
    type Camera: FrameSource;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError>;

    fn connect(&self, device: &DeviceInfo) -> Result<Self::Camera, SourceError>;
}

/// An open camera connection.
pub trait FrameSource: Send + 'static {
    fn begin_grabbing(&mut self, strategy: GrabStrategy) -> Result<(), SourceError>;

    /// Block up to `timeout` for the next buffer. Fails with
    /// [`SourceError::Timeout`] when nothing arrived in time.
    fn retrieve(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError>;

    /// Hand a buffer back to the driver pool.
    fn release(&mut self, buffer: BufferId);

    fn end_grabbing(&mut self);

    /// Release the device so other openers can connect.
    fn close(&mut self);
}

/// Bounded retry for opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Find `identifier` among the driver's devices and connect to it, retrying
/// per `policy`. Returns the last error once every attempt has failed.
#[instrument(skip(driver, policy), fields(attempts = policy.max_attempts))]
pub fn open<D: CameraDriver>(
    driver: &D,
    identifier: &str,
    policy: &RetryPolicy,
) -> Result<D::Camera, SourceError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match connect_once(driver, identifier) {
            Ok(camera) => {
                info!(camera = %identifier, attempt, "Connected to camera");
                return Ok(camera);
            }
            Err(e) if attempt < attempts => {
                warn!(camera = %identifier, attempt, error = %e, "Failed to connect to camera. Retrying...");
                thread::sleep(policy.backoff);
                attempt += 1;
            }
            Err(e) => {
                warn!(camera = %identifier, attempt, error = %e, "Failed to connect to camera, giving up");
                return Err(e);
            }
        }
    }
}

fn connect_once<D: CameraDriver>(driver: &D, identifier: &str) -> Result<D::Camera, SourceError> {
    let device = driver
        .enumerate()?
        .into_iter()
        .find(|d| d.identifier == identifier)
        .ok_or_else(|| SourceError::DeviceNotFound {
            identifier: identifier.to_string(),
        })?;

    debug!(camera = %identifier, model = %device.model, location = %device.location, "Found device");
    driver.connect(&device)
}

/// Grab one frame and convert it to `output`.
///
/// The driver buffer is released before returning on every path that
/// obtained one, whether the grab succeeded or not.
pub fn grab_next<S: FrameSource + ?Sized>(
    source: &mut S,
    timeout: Duration,
    output: PixelFormat,
) -> Result<Frame, SourceError> {
    let started = Instant::now();
    let result = source.retrieve(timeout)?;
    let buffer = result.buffer;

    let converted = match result.outcome {
        GrabOutcome::Succeeded(raw) => {
            convert_frame(raw.data, raw.width, raw.height, raw.format, output).and_then(|pixels| {
                Frame::new(
                    Bytes::from(pixels),
                    raw.width,
                    raw.height,
                    output,
                    raw.frame_number,
                    raw.device_timestamp,
                )
                .ok_or_else(|| SourceError::DecodeFailed {
                    reason: "converted buffer does not match frame geometry".into(),
                })
            })
        }
        GrabOutcome::Failed { code, description } => {
            Err(SourceError::GrabFailed { code, description })
        }
    };

    source.release(buffer);
    metrics::histogram!("camstream_grab_time_us").record(started.elapsed().as_micros() as f64);
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::{FakeDriver, FakeEvent, FakeFeed};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_open_finds_device_by_identifier() {
        let driver = FakeDriver::new()
            .with_device("1111", FakeFeed::script(vec![]))
            .with_device("2222", FakeFeed::script(vec![]));

        let camera = open(&driver, "2222", &instant_policy(1)).unwrap();
        assert_eq!(camera.identifier(), "2222");
    }

    #[test]
    fn test_open_unknown_device_is_not_found() {
        let driver = FakeDriver::new().with_device("1111", FakeFeed::script(vec![]));

        let err = open(&driver, "9999", &instant_policy(3)).unwrap_err();
        assert!(matches!(err, SourceError::DeviceNotFound { .. }));
        assert_eq!(driver.connect_attempts(), 0);
    }

    #[test]
    fn test_open_recovers_within_retry_bound() {
        let driver = FakeDriver::new()
            .with_device("1111", FakeFeed::script(vec![]))
            .failing_connects(3);

        assert!(open(&driver, "1111", &instant_policy(5)).is_ok());
        assert_eq!(driver.connect_attempts(), 4);
    }

    #[test]
    fn test_open_gives_up_after_max_attempts() {
        let driver = FakeDriver::new()
            .with_device("1111", FakeFeed::script(vec![]))
            .failing_connects(6);

        let err = open(&driver, "1111", &instant_policy(5)).unwrap_err();
        assert!(matches!(err, SourceError::ConnectionFailed { .. }));
        assert_eq!(driver.connect_attempts(), 5);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_grab_releases_buffer_on_failure() {
        let driver = FakeDriver::new().with_device(
            "1111",
            FakeFeed::script(vec![
                FakeEvent::Fail {
                    code: 0xE100_0014,
                    description: "incomplete buffer".into(),
                },
                FakeEvent::frame(vec![1u8, 2, 3]),
            ]),
        );
        let mut camera = open(&driver, "1111", &instant_policy(1)).unwrap();
        camera.begin_grabbing(GrabStrategy::OneByOne).unwrap();

        let err = grab_next(&mut camera, Duration::from_millis(10), PixelFormat::Bgr24).unwrap_err();
        assert!(matches!(err, SourceError::GrabFailed { .. }));
        assert_eq!(camera.outstanding_buffers(), 0);

        let frame = grab_next(&mut camera, Duration::from_millis(10), PixelFormat::Bgr24).unwrap();
        assert_eq!(frame.as_bytes(), &[1, 2, 3]);
        assert_eq!(camera.outstanding_buffers(), 0);
    }

    #[test]
    fn test_grab_times_out_when_feed_is_exhausted() {
        let driver = FakeDriver::new().with_device("1111", FakeFeed::script(vec![]));
        let mut camera = open(&driver, "1111", &instant_policy(1)).unwrap();
        camera.begin_grabbing(GrabStrategy::OneByOne).unwrap();

        let err = grab_next(&mut camera, Duration::from_millis(5), PixelFormat::Bgr24).unwrap_err();
        assert!(matches!(err, SourceError::Timeout { ms: 5 }));
    }
}
