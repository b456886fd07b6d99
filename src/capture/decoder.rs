//! Pixel format conversion from camera payloads to packed RGB/BGR

use jpeg_decoder::Decoder;

use super::frame::PixelFormat;
use crate::error::SourceError;

/// Convert a raw camera payload into packed 3-byte `to` pixels.
///
/// Always returns a fresh buffer, so the caller may release the driver
/// buffer `data` points into as soon as this returns.
pub fn convert_frame(
    data: &[u8],
    width: u32,
    height: u32,
    from: PixelFormat,
    to: PixelFormat,
) -> Result<Vec<u8>, SourceError> {
    if !to.is_output_format() {
        return Err(SourceError::UnsupportedConversion { from, to });
    }

    let pixel_count = width as usize * height as usize;

    if from == PixelFormat::Mjpeg {
        let (rgb, w, h) = decode_mjpeg(data)?;
        if (w, h) != (width, height) {
            return Err(SourceError::DecodeFailed {
                reason: format!("expected {width}x{height} image, got {w}x{h}"),
            });
        }
        return Ok(match to {
            PixelFormat::Bgr24 => swap_red_blue(&rgb),
            _ => rgb,
        });
    }

    let expected = pixel_count * from.bytes_per_pixel().unwrap_or(0) as usize;
    let data = data.get(..expected).ok_or_else(|| SourceError::DecodeFailed {
        reason: format!("short buffer: {} of {expected} bytes", data.len()),
    })?;

    let out = match (from, to) {
        (a, b) if a == b => data.to_vec(),
        (PixelFormat::Rgb24, PixelFormat::Bgr24) | (PixelFormat::Bgr24, PixelFormat::Rgb24) => {
            swap_red_blue(data)
        }
        (PixelFormat::Mono8, _) => data.iter().flat_map(|&l| [l, l, l]).collect(),
        (PixelFormat::Yuyv4, _) => {
            let rgb = yuyv_to_rgb(data, pixel_count);
            match to {
                PixelFormat::Bgr24 => swap_red_blue(&rgb),
                _ => rgb,
            }
        }
        _ => return Err(SourceError::UnsupportedConversion { from, to }),
    };

    Ok(out)
}

fn decode_mjpeg(data: &[u8]) -> Result<(Vec<u8>, u32, u32), SourceError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode().map_err(|e| SourceError::DecodeFailed {
        reason: e.to_string(),
    })?;
    let info = decoder.info().ok_or_else(|| SourceError::DecodeFailed {
        reason: "missing JPEG header".into(),
    })?;

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(SourceError::DecodeFailed {
                reason: format!("unsupported JPEG pixel format {other:?}"),
            })
        }
    };

    Ok((rgb, info.width as u32, info.height as u32))
}

fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]).collect()
}

/// YUYV 4:2:2 to RGB24. Each 4-byte group `Y0 U Y1 V` encodes 2 pixels (BT.601).
fn yuyv_to_rgb(data: &[u8], pixel_count: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    for chunk in data.chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    rgb.truncate(pixel_count * 3);
    rgb
}
