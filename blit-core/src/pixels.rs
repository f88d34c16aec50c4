//! Pixel formats, image buffers and the capture seam.
//!
//! These are **internal** frame representations passed between pipeline
//! stages. They are distinct from [`crate::packet::DrawPacket`], which
//! is the serialisable *wire* type handed to the transport.

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of an image buffer.
///
/// Packed layouts live in a single interleaved buffer; planar layouts
/// carry one buffer per plane and only ever appear between a colour
/// converter and a downstream encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, padding.
    Bgrx8,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, padding.
    Rgbx8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
    /// 4 bytes per pixel, 10 bits per channel (deep colour).
    R210,
    /// 1 byte per pixel, luminance only.
    Gray8,
    /// 1 byte per pixel, indexed palette.
    Palette8,
    /// Planar YUV, chroma subsampled 2x2.
    Yuv420p,
    /// Planar YUV, chroma subsampled 2x1.
    Yuv422p,
    /// Planar YUV, full chroma.
    Yuv444p,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel, for packed layouts.
    pub const fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Bgrx8
            | PixelFormat::Bgra8
            | PixelFormat::Rgbx8
            | PixelFormat::Rgba8
            | PixelFormat::R210 => Some(4),
            PixelFormat::Rgb8 => Some(3),
            PixelFormat::Gray8 | PixelFormat::Palette8 => Some(1),
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => None,
        }
    }

    /// Colour depth in significant bits per pixel.
    pub const fn depth(self) -> u8 {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 32,
            PixelFormat::Bgrx8 | PixelFormat::Rgbx8 | PixelFormat::Rgb8 => 24,
            PixelFormat::R210 => 30,
            PixelFormat::Gray8 | PixelFormat::Palette8 => 8,
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => 24,
        }
    }

    /// True when the layout carries a real alpha channel.
    pub const fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Bgra8 | PixelFormat::Rgba8)
    }

    /// True when the layout is planar (one buffer per plane).
    pub const fn is_planar(self) -> bool {
        self.subsampling().is_some()
    }

    /// Chroma subsampling divisors `(x_div, y_div)` per plane, for
    /// planar layouts. Drives the quality penalty when scoring a
    /// converter stage.
    pub const fn subsampling(self) -> Option<[(u8, u8); 3]> {
        match self {
            PixelFormat::Yuv420p => Some([(1, 1), (2, 2), (2, 2)]),
            PixelFormat::Yuv422p => Some([(1, 1), (2, 1), (2, 1)]),
            PixelFormat::Yuv444p => Some([(1, 1), (1, 1), (1, 1)]),
            _ => None,
        }
    }

    /// True when converting into this layout discards information that
    /// a later lossless refresh must restore.
    pub const fn is_lossy(self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Yuv422p)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Bgrx8 => "BGRX",
            PixelFormat::Bgra8 => "BGRA",
            PixelFormat::Rgbx8 => "RGBX",
            PixelFormat::Rgba8 => "RGBA",
            PixelFormat::Rgb8 => "RGB",
            PixelFormat::R210 => "r210",
            PixelFormat::Gray8 => "L",
            PixelFormat::Palette8 => "P",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Yuv422p => "YUV422P",
            PixelFormat::Yuv444p => "YUV444P",
        };
        f.write_str(name)
    }
}

// ── PixelBuffer ──────────────────────────────────────────────────

/// The pixel payload of a [`WindowImage`].
///
/// Packed images hold one interleaved buffer; planar images hold one
/// buffer and stride per plane. Consumers match on the variant instead
/// of guessing from buffer counts.
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    Packed {
        /// Interleaved pixel rows, `stride` bytes each.
        buffer: Bytes,
        /// Row pitch in **bytes** (may exceed `width * bpp`).
        stride: u32,
    },
    Planar {
        /// One buffer per plane, in plane order.
        planes: [Bytes; 3],
        /// Row pitch per plane, in bytes.
        strides: [u32; 3],
    },
}

impl PixelBuffer {
    /// Total byte size across all buffers.
    pub fn byte_len(&self) -> usize {
        match self {
            PixelBuffer::Packed { buffer, .. } => buffer.len(),
            PixelBuffer::Planar { planes, .. } => planes.iter().map(Bytes::len).sum(),
        }
    }
}

// ── WindowImage ──────────────────────────────────────────────────

/// A rectangle of pixels grabbed from a window's backing store.
///
/// `x`/`y` locate the rectangle inside the window; the capture side may
/// clamp `width`/`height` below what was requested, so consumers always
/// use the dimensions recorded here.
#[derive(Debug, Clone)]
pub struct WindowImage {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer: PixelBuffer,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl WindowImage {
    /// Convenience constructor for packed layouts.
    pub fn packed(
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        format: PixelFormat,
        buffer: Bytes,
        stride: u32,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
            format,
            buffer: PixelBuffer::Packed { buffer, stride },
            timestamp: Instant::now(),
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn depth(&self) -> u8 {
        self.format.depth()
    }

    /// The interleaved buffer and stride, for packed layouts.
    pub fn packed_data(&self) -> Option<(&Bytes, u32)> {
        match &self.buffer {
            PixelBuffer::Packed { buffer, stride } => Some((buffer, *stride)),
            PixelBuffer::Planar { .. } => None,
        }
    }

    /// Crop a packed image to the given window-coordinate rectangle.
    ///
    /// Zero-copy: the crop shares the parent buffer and keeps its
    /// stride. Returns `None` for planar images or when the rectangle
    /// is not fully inside this image.
    pub fn sub_image(&self, x: i32, y: i32, width: u32, height: u32) -> Option<WindowImage> {
        let (buffer, stride) = self.packed_data()?;
        let bpp = self.format.bytes_per_pixel()?;
        let dx = x.checked_sub(self.x)?;
        let dy = y.checked_sub(self.y)?;
        if dx < 0
            || dy < 0
            || width == 0
            || height == 0
            || dx as u32 + width > self.width
            || dy as u32 + height > self.height
        {
            return None;
        }
        let start = dy as usize * stride as usize + dx as usize * bpp;
        let end = start + (height as usize - 1) * stride as usize + width as usize * bpp;
        if end > buffer.len() {
            return None;
        }
        Some(WindowImage {
            x,
            y,
            width,
            height,
            format: self.format,
            buffer: PixelBuffer::Packed {
                buffer: buffer.slice(start..end),
                stride,
            },
            timestamp: self.timestamp,
        })
    }
}

// ── Capture ──────────────────────────────────────────────────────

/// Access to a window's backing store.
///
/// Implemented by the hosting compositor/capture layer. Must only be
/// called from the window's control context; the returned image is an
/// owned snapshot safe to hand to the encode context.
pub trait Capture: Send {
    /// Grab the pixels of the given window rectangle.
    ///
    /// Returns `None` when the window is gone or the area is not
    /// currently readable; the caller drops that damage round.
    fn get_image(&mut self, x: i32, y: i32, width: i32, height: i32) -> Option<WindowImage>;
}
