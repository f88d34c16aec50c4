//! Encoding selection.
//!
//! Which encoding a rectangle gets is decided by a strategy that only
//! changes when its inputs change (client capabilities, alpha need,
//! strict mode, depth, the zero-copy path); the per-rectangle part is
//! a cheap dispatch on size, quality and speed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoding::{Encoding, TRANSPARENCY_ORDER};

/// Regions smaller than this prefer raw rgb over a compressed format.
pub const MAX_PIXELS_PREFER_RGB: u64 = 4096;

/// Broad classification of what the window shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Unknown,
    Text,
    Picture,
    Video,
}

/// What the caller asked for, before capabilities narrow it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingChoice {
    #[default]
    Auto,
    Grayscale,
    Rgb,
    Fixed(Encoding),
}

impl EncodingChoice {
    /// True when the choice pins an encoding for which quality has no
    /// meaning, so the quality controller can skip its work.
    pub fn ignores_quality(&self) -> bool {
        match self {
            EncodingChoice::Rgb => true,
            EncodingChoice::Fixed(e) => e.is_lossless(),
            _ => false,
        }
    }
}

// ── Strategy ─────────────────────────────────────────────────────

/// The resolved selection strategy.
///
/// Recomputed by [`Selector::rebuild`] whenever an input changes;
/// [`Selector::select`] then dispatches on it per rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStrategy {
    /// A hard per-window override the client supports.
    Hint(Encoding),
    /// Zero-copy shared memory wins whenever mapped.
    Mmap,
    /// Grayscale lossless; never mixed with anything else.
    GrayLossless,
    /// 8-bit displays get the palette encoding.
    Palette,
    /// Strict mode or an alpha-pinned encoding: never changes.
    Fixed(Encoding),
    /// Alpha needed: restrict to alpha-capable encodings.
    Transparent,
    /// Full adaptive choice.
    Auto,
    /// Adaptive, then forced to the grayscale lossless encoding.
    Grayscale,
    /// A specific choice, with raw rgb for small regions.
    CurrentOrRgb(Encoding),
}

/// Per-window encoding selector.
#[derive(Debug)]
pub struct Selector {
    pub strategy: SelectorStrategy,
    pub choice: EncodingChoice,
    pub encoding_hint: Option<Encoding>,
    /// Encodings both ends support, in server preference order.
    pub common: Vec<Encoding>,
    pub want_alpha: bool,
    pub strict: bool,
    pub mmap_active: bool,
    /// Source image depth (bits).
    pub depth: u8,
    pub client_depth: u8,
    /// `ww * wh`; scales the lossless threshold boost.
    pub window_area: u64,
    /// Regions below this many pixels go out as raw rgb.
    pub rgb_auto_threshold: u64,
    pub lossless_threshold_base: i32,
    pub lossless_threshold_pixel_boost: i32,
}

impl Selector {
    pub fn new(choice: EncodingChoice, common: Vec<Encoding>) -> Self {
        let mut selector = Self {
            strategy: SelectorStrategy::Auto,
            choice,
            encoding_hint: None,
            common,
            want_alpha: false,
            strict: false,
            mmap_active: false,
            depth: 24,
            client_depth: 24,
            window_area: 0,
            rgb_auto_threshold: MAX_PIXELS_PREFER_RGB,
            lossless_threshold_base: 85,
            lossless_threshold_pixel_boost: 20,
        };
        selector.rebuild();
        selector
    }

    fn is_common(&self, e: Encoding) -> bool {
        self.common.contains(&e)
    }

    /// Recompute the strategy. Call after any input field changes.
    pub fn rebuild(&mut self) {
        self.strategy = self.compute_strategy();
        debug!(strategy = ?self.strategy, choice = ?self.choice, "selector rebuilt");
    }

    fn compute_strategy(&self) -> SelectorStrategy {
        if let Some(hint) = self.encoding_hint {
            if self.is_common(hint) {
                return SelectorStrategy::Hint(hint);
            }
        }
        let grayscale = self.choice == EncodingChoice::Grayscale;
        if self.mmap_active && !grayscale {
            return SelectorStrategy::Mmap;
        }
        if self.choice == EncodingChoice::Fixed(Encoding::PngL) {
            // would look awful mixed with anything else
            return SelectorStrategy::GrayLossless;
        }
        if self.depth == 8 {
            if grayscale {
                return SelectorStrategy::GrayLossless;
            }
            if self.is_common(Encoding::PngP) {
                return SelectorStrategy::Palette;
            }
            return SelectorStrategy::Auto;
        }
        if self.strict && self.choice != EncodingChoice::Auto {
            match self.choice {
                EncodingChoice::Rgb => {
                    // resolve rgb here, once: alpha support only
                    // changes by going back through this method
                    if self.want_alpha && self.is_common(Encoding::Rgb32) {
                        return SelectorStrategy::Fixed(Encoding::Rgb32);
                    }
                    return SelectorStrategy::Fixed(Encoding::Rgb24);
                }
                EncodingChoice::Fixed(e) => return SelectorStrategy::Fixed(e),
                _ => {}
            }
        }
        if self.want_alpha {
            match self.choice {
                EncodingChoice::Rgb | EncodingChoice::Fixed(Encoding::Rgb32)
                    if self.is_common(Encoding::Rgb32) =>
                {
                    return SelectorStrategy::Fixed(Encoding::Rgb32);
                }
                // these do alpha; stick to them so different encoders
                // cannot blend alpha differently across updates
                EncodingChoice::Fixed(e @ (Encoding::Png | Encoding::PngP)) => {
                    return SelectorStrategy::Fixed(e);
                }
                EncodingChoice::Grayscale => return SelectorStrategy::Grayscale,
                _ => return SelectorStrategy::Transparent,
            }
        }
        if self.choice == EncodingChoice::Rgb {
            if self.is_common(Encoding::Rgb24) {
                return SelectorStrategy::Fixed(Encoding::Rgb24);
            }
            if self.is_common(Encoding::Rgb32) {
                return SelectorStrategy::Fixed(Encoding::Rgb32);
            }
        }
        match self.choice {
            EncodingChoice::Auto => SelectorStrategy::Auto,
            EncodingChoice::Grayscale => SelectorStrategy::Grayscale,
            EncodingChoice::Fixed(e) => SelectorStrategy::CurrentOrRgb(e),
            _ => SelectorStrategy::Auto,
        }
    }

    // ── Thresholds ───────────────────────────────────────────────

    /// Quality at or above this value switches a rect of `w x h` to a
    /// lossless encoding.
    pub fn lossless_quality(&self, w: u32, h: u32) -> i32 {
        if self.window_area == 0 {
            return self.lossless_threshold_base;
        }
        let boost =
            self.lossless_threshold_pixel_boost as u64 * w as u64 * h as u64 / self.window_area;
        self.lossless_threshold_base + boost as i32
    }

    /// Recompute the lossless and rgb thresholds from the current
    /// tuning values.
    #[allow(clippy::too_many_arguments)]
    pub fn update_thresholds(
        &mut self,
        speed: u8,
        quality: u8,
        packet_count: u64,
        congestion_value: f64,
        bandwidth_limit: u64,
        content: ContentType,
        prefer_rgb_boost: bool,
    ) {
        let speed = speed as i32;
        self.lossless_threshold_base =
            (60 + speed / 5 + (congestion_value * 100.0) as i32).min(90);
        if content == ContentType::Text {
            self.lossless_threshold_base -= 20;
        }
        self.lossless_threshold_pixel_boost = (20 - speed / 5).max(5);
        // high speed assumes bandwidth to spare
        let smult = ((speed as f64 - 50.0) / 5.0).max(0.25);
        let qmult = (quality as f64 / 20.0).max(0.0);
        let pcmult = (0.5 + packet_count as f64).min(20.0) / 20.0;
        let mut max_rgb_threshold: u64 = 32 * 1024;
        let mut min_rgb_threshold: u64 = 2048;
        if congestion_value > 0.1 {
            max_rgb_threshold = (32.0 * 1024.0 / (1.0 + congestion_value)) as u64;
            min_rgb_threshold = 1024;
        }
        if bandwidth_limit > 0 {
            max_rgb_threshold = max_rgb_threshold.min((bandwidth_limit / 1000).max(1024));
        }
        let weight = if prefer_rgb_boost { 3.0 } else { 1.0 };
        let v = MAX_PIXELS_PREFER_RGB as f64 * pcmult * smult * qmult * weight;
        self.rgb_auto_threshold = (v as u64).clamp(min_rgb_threshold, max_rgb_threshold);
    }

    // ── Selection ────────────────────────────────────────────────

    /// Pick the encoding for one rectangle.
    pub fn select(
        &self,
        w: u32,
        h: u32,
        quality: u8,
        speed: u8,
        previous: Option<Encoding>,
    ) -> Encoding {
        match self.strategy {
            SelectorStrategy::Hint(e) | SelectorStrategy::Fixed(e) => e,
            SelectorStrategy::Mmap => Encoding::Mmap,
            SelectorStrategy::GrayLossless => Encoding::PngL,
            SelectorStrategy::Palette => Encoding::PngP,
            SelectorStrategy::Grayscale => self.grayscale_encoding(w, h, quality, speed),
            SelectorStrategy::Transparent => self.transparent_encoding(w, h, quality, speed, previous),
            SelectorStrategy::Auto => self.auto_encoding(w, h, quality, speed),
            SelectorStrategy::CurrentOrRgb(e) => {
                if (w as u64 * h as u64) < self.rgb_auto_threshold {
                    Encoding::Rgb24
                } else {
                    e
                }
            }
        }
    }

    fn auto_encoding(&self, w: u32, h: u32, quality: u8, speed: u8) -> Encoding {
        let pixels = w as u64 * h as u64;
        if self.depth > 24 && self.is_common(Encoding::Rgb32) && self.client_depth > 24 {
            // the only encoding that can carry the extra bits
            return Encoding::Rgb32;
        }
        if pixels < self.rgb_auto_threshold {
            return Encoding::Rgb24;
        }
        if self.is_common(Encoding::Png) && quality as i32 >= self.lossless_quality(w, h) {
            return Encoding::Png;
        }
        if self.is_common(Encoding::Webp)
            && matches!(self.depth, 24 | 32)
            && (2..=16383).contains(&w)
            && (2..=16383).contains(&h)
        {
            return Encoding::Webp;
        }
        if self.is_common(Encoding::Png) && ((quality >= 80 && speed < 80) || self.depth <= 16) {
            return Encoding::Png;
        }
        if self.is_common(Encoding::Jpeg) && w >= 2 && h >= 2 {
            return Encoding::Jpeg;
        }
        self.common
            .iter()
            .copied()
            .find(|e| !matches!(e, Encoding::Rgb24 | Encoding::Rgb32))
            .unwrap_or(Encoding::Rgb24)
    }

    fn grayscale_encoding(&self, w: u32, h: u32, quality: u8, speed: u8) -> Encoding {
        match self.auto_encoding(w, h, quality, speed) {
            Encoding::Rgb24 | Encoding::Rgb32 | Encoding::Png | Encoding::PngP | Encoding::PngL => {
                Encoding::PngL
            }
            e => e,
        }
    }

    fn transparent_encoding(
        &self,
        w: u32,
        h: u32,
        quality: u8,
        speed: u8,
        previous: Option<Encoding>,
    ) -> Encoding {
        if let Some(prev) = previous {
            if TRANSPARENCY_ORDER.contains(&prev) && self.is_common(prev) {
                return prev;
            }
        }
        let pixels = w as u64 * h as u64;
        let usable = |e: Encoding| self.is_common(e) && TRANSPARENCY_ORDER.contains(&e);
        // small areas prefer rgb, as do high quality + speed
        if usable(Encoding::Rgb32)
            && (pixels < self.rgb_auto_threshold
                || (quality >= 90 && speed >= 90)
                || (self.depth > 24 && self.client_depth > 24))
        {
            return Encoding::Rgb32;
        }
        if usable(Encoding::Webp)
            && matches!(self.depth, 24 | 32)
            && (2..=16383).contains(&w)
            && (2..=16383).contains(&h)
        {
            return Encoding::Webp;
        }
        for &e in TRANSPARENCY_ORDER {
            if self.is_common(e) {
                return e;
            }
        }
        // nothing does transparency: fall back to the adaptive choice
        self.auto_encoding(w, h, quality, speed)
    }
}

// ── Tests ────────────────────────────────────────────────────────
