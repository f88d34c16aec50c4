//! Codec collaborator seams.
//!
//! Concrete pixel encoders and colour converters live outside this
//! crate; the pipeline drives them through the two traits below and
//! never assumes anything beyond the advertised
//! [`CapabilitySpec`](crate::capability::CapabilitySpec). The only
//! codec shipped here is the raw-rgb path in [`rgb`], which needs no
//! external library and doubles as the edge-strip encoder.

pub mod rgb;

use bytes::Bytes;
use serde_json::Map;

use crate::encoding::Encoding;
use crate::error::BlitError;
use crate::pixels::{PixelFormat, WindowImage};

// ── EncodeOutput ─────────────────────────────────────────────────

/// The result of one successful encode call.
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Actual encoding used (an encoder may substitute, e.g. rgb32
    /// when asked for rgb24 on an alpha image).
    pub encoding: Encoding,
    /// Compressed payload.
    pub data: Bytes,
    /// Decode hints for the client (intermediate format, scaled size,
    /// compression level...). Merged into the draw packet options.
    pub client_options: Map<String, serde_json::Value>,
    /// Encoded width (after any scaling).
    pub width: u32,
    /// Encoded height (after any scaling).
    pub height: u32,
    /// Row stride of the *encoded* representation, 0 when meaningless.
    pub stride: u32,
    /// Significant bits per input pixel, for compression accounting.
    pub bits_per_pixel: u8,
}

// ── PixelEncoder ─────────────────────────────────────────────────

/// A compressed-pixel encoder instance.
///
/// Instances are created by a registry factory, initialised once, fed
/// any number of images of the agreed format and dimensions, then
/// cleaned. All calls happen on the window's encode context.
pub trait PixelEncoder: Send {
    /// Bind the instance to a frame geometry and target encoding.
    ///
    /// `dst_formats` lists the intermediate formats the client accepts
    /// for this encoding; the encoder picks one and reports it in the
    /// output's `client_options`.
    #[allow(clippy::too_many_arguments)]
    fn init_context(
        &mut self,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        dst_formats: &[PixelFormat],
        encoding: Encoding,
        quality: u8,
        speed: u8,
    ) -> Result<(), BlitError>;

    /// Compress one image.
    ///
    /// `Ok(None)` means the encoder had nothing to output for this
    /// frame (a soft drop, not an error).
    fn compress_image(
        &mut self,
        image: &WindowImage,
        quality: u8,
        speed: u8,
    ) -> Result<Option<EncodeOutput>, BlitError>;

    /// The encoding this instance was initialised for.
    fn encoding(&self) -> Encoding;

    /// The input format this instance was initialised for.
    fn src_format(&self) -> PixelFormat;

    /// The `(width, height)` this instance was initialised for.
    fn dimensions(&self) -> (u32, u32);

    /// Release codec resources. Idempotent.
    fn clean(&mut self);
}

// ── PixelConverter ───────────────────────────────────────────────

/// A colour-space converter instance (and, when the source and target
/// dimensions differ, a scaler).
pub trait PixelConverter: Send {
    fn init_context(
        &mut self,
        src_width: u32,
        src_height: u32,
        src_format: PixelFormat,
        dst_width: u32,
        dst_height: u32,
        dst_format: PixelFormat,
        speed: u8,
    ) -> Result<(), BlitError>;

    /// Convert one image into the bound destination format.
    fn convert_image(&mut self, image: &WindowImage) -> Result<WindowImage, BlitError>;

    fn src_format(&self) -> PixelFormat;
    fn dst_format(&self) -> PixelFormat;
    fn src_dimensions(&self) -> (u32, u32);
    fn dst_dimensions(&self) -> (u32, u32);

    /// Release converter resources. Idempotent.
    fn clean(&mut self);
}

// ── Factories ────────────────────────────────────────────────────

/// Constructs fresh encoder instances for one registry entry.
pub trait EncoderFactory: Send + Sync {
    fn make_instance(&self) -> Box<dyn PixelEncoder>;
}

/// Constructs fresh converter instances for one registry entry.
pub trait ConverterFactory: Send + Sync {
    fn make_instance(&self) -> Box<dyn PixelConverter>;
}
