use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A converted frame ready for preview and encoding.
///
/// The payload is immutable once produced: cloning a `Frame` hands out a
/// read-only copy that shares storage, so no two owners ever hold a mutable
/// view of the same pixels.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Packed pixel rows, `meta.stride * meta.height` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host timestamp taken when the grab returned
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mono8,
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Mono8 => Some(1),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Name understood by ffmpeg's `-pixel_format` for raw input.
    pub fn ffmpeg_name(self) -> Option<&'static str> {
        match self {
            PixelFormat::Mono8 => Some("gray"),
            PixelFormat::Rgb24 => Some("rgb24"),
            PixelFormat::Bgr24 => Some("bgr24"),
            PixelFormat::Yuyv4 => Some("yuyv422"),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Whether this format can be produced by the converter as output.
    pub fn is_output_format(self) -> bool {
        matches!(self, PixelFormat::Rgb24 | PixelFormat::Bgr24)
    }
}

impl Frame {
    /// Wrap a packed pixel buffer. Returns `None` when the buffer length does
    /// not match `width * height` for the format.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
        device_timestamp: Option<Duration>,
    ) -> Option<Self> {
        let stride = width.checked_mul(format.bytes_per_pixel()?)?;
        if data.len() != stride as usize * height as usize {
            return None;
        }

        Some(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride,
                format,
                device_timestamp,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Header and payload agree on size.
    pub fn is_consistent(&self) -> bool {
        self.meta.stride as usize * self.meta.height as usize == self.data.len()
    }

    /// RGB copy for saving previews; `None` for non-RGB/BGR frames.
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let rgb = match self.meta.format {
            PixelFormat::Rgb24 => self.data.to_vec(),
            PixelFormat::Bgr24 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            _ => return None,
        };
        image::RgbImage::from_raw(self.meta.width, self.meta.height, rgb)
    }
}
