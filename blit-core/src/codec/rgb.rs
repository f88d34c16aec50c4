//! Built-in raw-rgb encoder.
//!
//! The one codec the pipeline can always fall back on: rows are packed
//! tight (stride padding dropped), optionally squeezed from 4 to 3
//! bytes per pixel for rgb24, then zstd-compressed. No external codec
//! library, no instance state, so it also serves as the cheap path for
//! the pixel-wide edge strips that masked video dimensions leave over.
//!
//! The payload keeps the capture's channel order; `client_options`
//! names it (`rgb_format`) along with the zstd level used.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::codec::EncodeOutput;
use crate::encoding::Encoding;
use crate::error::BlitError;
use crate::packet::options;
use crate::pixels::{PixelFormat, WindowImage};

/// Payloads smaller than this go out uncompressed; zstd framing would
/// eat the gain.
const MIN_COMPRESS_SIZE: usize = 512;

/// Map a speed target to a zstd level: 1 (fastest) at speed 100,
/// 9 at speed 0.
fn zstd_level(speed: u8) -> i32 {
    let s = speed.min(100) as i32;
    1 + (100 - s) * 8 / 100
}

/// Rows copied back to back, stride padding dropped.
fn pack_rows(buffer: &[u8], stride: usize, row_len: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row_len * height);
    for y in 0..height {
        let start = y * stride;
        out.extend_from_slice(&buffer[start..start + row_len]);
    }
    out
}

/// 4-byte pixels squeezed to their 3 colour bytes, rows packed tight.
fn drop_padding(buffer: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 * width * height);
    for y in 0..height {
        let row = &buffer[y * stride..y * stride + 4 * width];
        for px in row.chunks_exact(4) {
            out.extend_from_slice(&px[..3]);
        }
    }
    out
}

/// Compress one packed image into an rgb24 or rgb32 draw payload.
///
/// rgb24 sends 3 bytes per pixel (the padding or alpha byte of 4-byte
/// captures is dropped); rgb32 sends the packed 4-byte layout as
/// captured. Anything else is a caller bug.
pub fn encode(
    encoding: Encoding,
    image: &WindowImage,
    speed: u8,
) -> Result<EncodeOutput, BlitError> {
    let (buffer, stride) = image
        .packed_data()
        .ok_or_else(|| BlitError::BufferMismatch("raw rgb needs a packed buffer".into()))?;
    let bpp = image
        .format
        .bytes_per_pixel()
        .ok_or_else(|| BlitError::BufferMismatch(format!("{} is not packed", image.format)))?;
    let width = image.width as usize;
    let height = image.height as usize;
    let stride = stride as usize;
    if width == 0 || height == 0 {
        return Err(BlitError::BufferMismatch("empty image".into()));
    }
    let needed = (height - 1) * stride + width * bpp;
    if buffer.len() < needed {
        return Err(BlitError::BufferMismatch(format!(
            "{}x{} {} needs {needed} bytes, buffer holds {}",
            width,
            height,
            image.format,
            buffer.len(),
        )));
    }

    let (data, out_bpp, rgb_format) = match encoding {
        Encoding::Rgb24 => match image.format {
            PixelFormat::Rgb8 => (pack_rows(buffer, stride, 3 * width, height), 3, "RGB"),
            PixelFormat::Bgrx8 | PixelFormat::Bgra8 => {
                (drop_padding(buffer, stride, width, height), 3, "BGR")
            }
            PixelFormat::Rgbx8 | PixelFormat::Rgba8 => {
                (drop_padding(buffer, stride, width, height), 3, "RGB")
            }
            other => {
                return Err(BlitError::BufferMismatch(format!(
                    "cannot send {other} as rgb24"
                )));
            }
        },
        Encoding::Rgb32 => {
            let name = match image.format {
                PixelFormat::Bgrx8 => "BGRX",
                PixelFormat::Bgra8 => "BGRA",
                PixelFormat::Rgbx8 => "RGBX",
                PixelFormat::Rgba8 => "RGBA",
                PixelFormat::R210 => "r210",
                other => {
                    return Err(BlitError::BufferMismatch(format!(
                        "cannot send {other} as rgb32"
                    )));
                }
            };
            (pack_rows(buffer, stride, 4 * width, height), 4, name)
        }
        other => {
            return Err(BlitError::Encoding(format!(
                "{other} is not a raw rgb encoding"
            )));
        }
    };

    let mut client_options = Map::new();
    client_options.insert(options::RGB_FORMAT.into(), Value::from(rgb_format));
    client_options.insert(options::LOSSLESS.into(), Value::from(true));

    let raw_len = data.len();
    let payload = if raw_len >= MIN_COMPRESS_SIZE {
        let level = zstd_level(speed);
        let compressed = zstd::encode_all(data.as_slice(), level)?;
        if compressed.len() < raw_len {
            client_options.insert(options::ZSTD_LEVEL.into(), Value::from(level));
            compressed
        } else {
            data
        }
    } else {
        data
    };

    Ok(EncodeOutput {
        encoding,
        data: Bytes::from(payload),
        client_options,
        width: image.width,
        height: image.height,
        stride: (out_bpp * width) as u32,
        bits_per_pixel: image.depth(),
    })
}

// ── Tests ────────────────────────────────────────────────────────
