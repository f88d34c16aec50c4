//! Encoding identifiers and preference orders.
//!
//! An [`Encoding`] names the compressed form a draw packet carries.
//! The selector picks one per rectangle; the preference orders below
//! rank them when several are available on both sides.

use serde::{Deserialize, Serialize};

// ── Encoding ─────────────────────────────────────────────────────

/// Compressed pixel formats understood by at least one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Raw packed RGB, 3 bytes per pixel, row-compressed.
    Rgb24,
    /// Raw packed RGBA, 4 bytes per pixel, row-compressed.
    Rgb32,
    /// Truecolour PNG.
    Png,
    /// Indexed-palette PNG.
    PngP,
    /// Grayscale PNG.
    PngL,
    /// WebP (lossy or lossless by quality).
    Webp,
    /// Baseline JPEG.
    Jpeg,
    H264,
    H265,
    Vp8,
    Vp9,
    /// Zero-copy shared-memory blit; no compression at all.
    Mmap,
}

impl Encoding {
    /// True when a decode of this encoding is bit-exact.
    ///
    /// Webp counts as lossy here: the refresh scheduler must assume the
    /// worst since quality decides at encode time.
    pub const fn is_lossless(self) -> bool {
        matches!(
            self,
            Encoding::Rgb24 | Encoding::Rgb32 | Encoding::Png | Encoding::PngP | Encoding::PngL | Encoding::Mmap
        )
    }

    /// True when this encoding runs through the scored converter +
    /// encoder pipeline instead of a direct codec call.
    pub const fn uses_pipeline(self) -> bool {
        matches!(self, Encoding::H264 | Encoding::H265 | Encoding::Vp8 | Encoding::Vp9)
    }

    /// True when the encoding can carry an alpha channel.
    pub const fn supports_alpha(self) -> bool {
        matches!(
            self,
            Encoding::Rgb32 | Encoding::Png | Encoding::PngP | Encoding::Webp | Encoding::Vp9
        )
    }

    /// True when partial-rectangle updates are structurally impossible
    /// and the whole window must be encoded instead.
    pub const fn requires_full_frame(self) -> bool {
        self.uses_pipeline()
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Encoding::Rgb24 => "rgb24",
            Encoding::Rgb32 => "rgb32",
            Encoding::Png => "png",
            Encoding::PngP => "png/P",
            Encoding::PngL => "png/L",
            Encoding::Webp => "webp",
            Encoding::Jpeg => "jpeg",
            Encoding::H264 => "h264",
            Encoding::H265 => "h265",
            Encoding::Vp8 => "vp8",
            Encoding::Vp9 => "vp9",
            Encoding::Mmap => "mmap",
        };
        f.write_str(name)
    }
}

// ── Preference orders ────────────────────────────────────────────

/// Ranking used when intersecting client and server encodings.
pub const PREFERRED_ORDER: &[Encoding] = &[
    Encoding::H264,
    Encoding::Vp9,
    Encoding::Vp8,
    Encoding::Png,
    Encoding::PngP,
    Encoding::PngL,
    Encoding::Webp,
    Encoding::Rgb24,
    Encoding::Rgb32,
    Encoding::Jpeg,
    Encoding::H265,
];

/// Ranking when a speed target of 50+ makes setup cost matter more
/// than compression ratio.
pub const FAST_ORDER: &[Encoding] = &[
    Encoding::Rgb32,
    Encoding::Rgb24,
    Encoding::Jpeg,
    Encoding::Png,
    Encoding::Webp,
    Encoding::Vp8,
];

/// Encodings that preserve an alpha channel end to end.
pub const TRANSPARENCY_ORDER: &[Encoding] =
    &[Encoding::Rgb32, Encoding::Webp, Encoding::Png, Encoding::PngP];

/// Encodings eligible for the lossless auto-refresh pass.
pub const REFRESH_ORDER: &[Encoding] =
    &[Encoding::Webp, Encoding::Png, Encoding::Rgb24, Encoding::Rgb32];

/// Intersect `client` with `server`, ranked by `order`.
pub fn common_encodings(
    order: &[Encoding],
    client: &[Encoding],
    server: &[Encoding],
) -> Vec<Encoding> {
    order
        .iter()
        .copied()
        .filter(|e| client.contains(e) && server.contains(e))
        .collect()
}
