//! V4L2 camera driver with memory-mapped buffers
//!
//! Devices are identified by their V4L2 bus info, which stays stable across
//! reboots for a given port, unlike `/dev/videoN` numbering.

use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument};
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::PixelFormat;
use super::source::{
    BufferId, CameraDriver, DeviceInfo, FrameSource, GrabOutcome, GrabResult, GrabStrategy,
    RawImage,
};
use crate::error::SourceError;

const MAX_VIDEO_NODES: usize = 64;

/// Requested capture geometry for every device this driver connects.
#[derive(Debug, Clone)]
pub struct V4l2Driver {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
    }
}

impl CameraDriver for V4l2Driver {
    type Camera = V4l2Camera;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError> {
        let mut found = Vec::new();

        for i in 0..MAX_VIDEO_NODES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            // Metadata nodes share the bus info of the real capture node
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }

            debug!("Found capture device: {} - {} ({})", path, caps.card, caps.bus);
            found.push(DeviceInfo {
                identifier: caps.bus,
                model: caps.card,
                location: path,
            });
        }

        Ok(found)
    }

    #[instrument(skip(self))]
    fn connect(&self, device: &DeviceInfo) -> Result<V4l2Camera, SourceError> {
        let connect_failed = |e: io::Error| SourceError::ConnectionFailed {
            identifier: device.identifier.clone(),
            reason: e.to_string(),
        };

        let rejected = |reason: String| SourceError::ConnectionFailed {
            identifier: device.identifier.clone(),
            reason,
        };

        if let Some(reason) = unsupported_request(self.format, self.width) {
            return Err(rejected(reason));
        }

        let dev = Device::with_path(&device.location).map_err(connect_failed)?;

        let mut fmt = dev.format().map_err(connect_failed)?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = fourcc(self.format);
        let fmt = dev.set_format(&fmt).map_err(connect_failed)?;

        if fmt.fourcc != fourcc(self.format) {
            return Err(rejected(format!("device does not support {:?}", self.format)));
        }
        if let Some(reason) = geometry_mismatch((self.width, self.height), (fmt.width, fmt.height)) {
            return Err(rejected(reason));
        }

        info!("Opened {} ({}) at {}x{}", device.location, device.model, fmt.width, fmt.height);

        Ok(V4l2Camera {
            identifier: device.identifier.clone(),
            device: Some(dev),
            stream: None,
            width: fmt.width,
            height: fmt.height,
            format: self.format,
            buffer_count: self.buffer_count.max(1),
            next_buffer: 0,
        })
    }
}

/// Requests the converter cannot serve. YUYV packs two pixels per macropixel.
fn unsupported_request(format: PixelFormat, width: u32) -> Option<String> {
    (format == PixelFormat::Yuyv4 && width % 2 != 0)
        .then(|| format!("YUYV capture needs an even width, got {width}"))
}

/// The sink expects exactly the configured geometry, so a driver-adjusted
/// resolution cannot be streamed.
fn geometry_mismatch(requested: (u32, u32), negotiated: (u32, u32)) -> Option<String> {
    (requested != negotiated).then(|| {
        format!(
            "device adjusted resolution from {}x{} to {}x{}",
            requested.0, requested.1, negotiated.0, negotiated.1
        )
    })
}

/// An open V4L2 capture node.
pub struct V4l2Camera {
    identifier: String,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer_count: u32,
    next_buffer: u64,
}

impl FrameSource for V4l2Camera {
    fn begin_grabbing(&mut self, strategy: GrabStrategy) -> Result<(), SourceError> {
        let device = self.device.as_ref().ok_or_else(|| SourceError::ConnectionFailed {
            identifier: self.identifier.clone(),
            reason: "device closed".into(),
        })?;

        // Two buffers keep the backlog at most one frame behind the sensor
        let count = match strategy {
            GrabStrategy::LatestImageOnly => 2,
            GrabStrategy::OneByOne => self.buffer_count,
        };

        let stream = MmapStream::with_buffers(device, Type::VideoCapture, count)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", count);
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError> {
        let (width, height, format) = (self.width, self.height, self.format);
        let buffer = BufferId(self.next_buffer);
        self.next_buffer += 1;

        let stream = self.stream.as_mut().ok_or_else(|| SourceError::GrabFailed {
            code: 0,
            description: "stream not started".into(),
        })?;
        stream.set_timeout(timeout);

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(SourceError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = if meta.flags.contains(BufferFlags::ERROR) {
            GrabOutcome::Failed {
                code: 0,
                description: "driver flagged buffer as corrupted".into(),
            }
        } else {
            let used = (meta.bytesused as usize).min(buf.len());
            GrabOutcome::Succeeded(RawImage {
                data: &buf[..used],
                width,
                height,
                format,
                frame_number: meta.sequence as u64,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            })
        };

        Ok(GrabResult { buffer, outcome })
    }

    fn release(&mut self, _buffer: BufferId) {
        // MmapStream requeues the previous buffer on the next dequeue
    }

    fn end_grabbing(&mut self) {
        if self.stream.take().is_some() {
            debug!("Capture stream stopped");
        }
    }

    fn close(&mut self) {
        self.end_grabbing();
        if self.device.take().is_some() {
            info!("Closed camera {}", self.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_width_yuyv_rejected() {
        assert!(unsupported_request(PixelFormat::Yuyv4, 1279).is_some());
        assert!(unsupported_request(PixelFormat::Yuyv4, 1280).is_none());
        assert!(unsupported_request(PixelFormat::Mjpeg, 1279).is_none());
    }

    #[test]
    fn test_adjusted_resolution_rejected() {
        let reason = geometry_mismatch((1280, 720), (640, 480)).unwrap();
        assert!(reason.contains("640x480"));
        assert!(geometry_mismatch((1280, 720), (1280, 720)).is_none());
    }
}
