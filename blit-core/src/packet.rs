//! The draw packet: one encoded rectangle on its way to the client.
//!
//! ## Wire layout
//!
//! ```text
//! kind:            "draw"  (validated on decode)
//! window_id:       u32
//! x, y:            i32     window-relative position
//! width, height:   u32     decoded size
//! encoding:        Encoding
//! data:            [u8]    compressed payload
//! sequence:        u64     per-window draw counter, never reused
//! rowstride:       u32     0 when the encoding defines its own
//! client_options:  json    decode hints (flush, csc, scaled_size...)
//! ```
//!
//! Packets are bincode-framed; `client_options` rides inside as a JSON
//! string because its values are heterogeneous.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::Encoding;
use crate::error::BlitError;

/// Well-known `client_options` keys.
pub mod options {
    /// Packets still to come for the same batch (u64, omitted when 0).
    pub const FLUSH: &str = "flush";
    /// Intermediate colourspace the decoder must convert from.
    pub const CSC: &str = "csc";
    /// `[width, height]` the client should scale the decode up to.
    pub const SCALED_SIZE: &str = "scaled_size";
    /// Capture timestamp offset in milliseconds.
    pub const TIMESTAMP: &str = "ts";
    /// Video frame index within the current pipeline.
    pub const FRAME: &str = "frame";
    /// Set when the payload decodes bit-exact.
    pub const LOSSLESS: &str = "lossless";
    /// Actual quality the encoder settled on (0-100).
    pub const QUALITY: &str = "quality";
    /// Zstd level the rgb payload was compressed with.
    pub const ZSTD_LEVEL: &str = "zstd.level";
    /// Byte order of a raw rgb payload ("BGR", "BGRX", ...).
    pub const RGB_FORMAT: &str = "rgb_format";
}

// ── DrawPacket ───────────────────────────────────────────────────

/// One encoded rectangle, addressed to a window.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawPacket {
    pub window_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    pub data: Vec<u8>,
    /// Per-window draw counter. Strictly increasing, never reused,
    /// resends included.
    pub sequence: u64,
    pub rowstride: u32,
    pub client_options: Map<String, Value>,
}

/// Bincode-friendly mirror of [`DrawPacket`].
#[derive(Serialize, Deserialize)]
struct WireDraw {
    kind: String,
    window_id: u32,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    encoding: Encoding,
    data: Vec<u8>,
    sequence: u64,
    rowstride: u32,
    options_json: String,
}

impl DrawPacket {
    pub const KIND: &'static str = "draw";

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlitError> {
        let wire = WireDraw {
            kind: Self::KIND.to_string(),
            window_id: self.window_id,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            encoding: self.encoding,
            data: self.data.clone(),
            sequence: self.sequence,
            rowstride: self.rowstride,
            options_json: serde_json::to_string(&self.client_options)
                .map_err(|e| BlitError::Encoding(e.to_string()))?,
        };
        bincode::serialize(&wire).map_err(|e| BlitError::Encoding(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlitError> {
        let wire: WireDraw =
            bincode::deserialize(bytes).map_err(|e| BlitError::Encoding(e.to_string()))?;
        if wire.kind != Self::KIND {
            return Err(BlitError::Encoding(format!(
                "unexpected packet kind: {}",
                wire.kind
            )));
        }
        let client_options = serde_json::from_str(&wire.options_json)
            .map_err(|e| BlitError::Encoding(e.to_string()))?;
        Ok(Self {
            window_id: wire.window_id,
            x: wire.x,
            y: wire.y,
            width: wire.width,
            height: wire.height,
            encoding: wire.encoding,
            data: wire.data,
            sequence: wire.sequence,
            rowstride: wire.rowstride,
            client_options,
        })
    }
}

impl std::fmt::Display for DrawPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "draw #{} wid={} {}x{} at ({},{}) {} ({} bytes)",
            self.sequence,
            self.window_id,
            self.width,
            self.height,
            self.x,
            self.y,
            self.encoding,
            self.data.len(),
        )
    }
}
