//! Codec capability descriptors and the immutable registry.
//!
//! Every external encoder or converter publishes one [`CapabilitySpec`]
//! describing what it can do and what it costs. The specs are collected
//! once at startup into a [`CodecRegistry`] that is shared read-only by
//! every window; only the per-entry live-instance counters ever change.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::codec::{ConverterFactory, EncoderFactory};
use crate::encoding::{self, Encoding};
use crate::flags::ClientFlags;
use crate::pixels::PixelFormat;

// ── CapabilitySpec ───────────────────────────────────────────────

/// Static description of one codec or converter implementation.
///
/// All percentage fields are 0–100. `setup_cost` is the price of
/// creating a fresh instance and feeds the scorer's edge resistance;
/// `size_efficiency` describes output compactness relative to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Nominal output quality.
    pub quality: u8,
    /// Nominal encode speed.
    pub speed: u8,
    /// Output compactness; low values get penalised on large frames.
    pub size_efficiency: u8,
    /// Cost of instantiating (context setup, codec warm-up).
    pub setup_cost: u8,
    /// Flat score adjustment, signed.
    pub score_boost: i8,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Dimensions handed to the codec are rounded down with this mask.
    pub width_mask: u32,
    pub height_mask: u32,
    /// Whether the implementation can scale internally.
    pub can_scale: bool,
    /// Hard cap on concurrent live instances; 0 means unlimited.
    pub max_instances: usize,
}

impl Default for CapabilitySpec {
    fn default() -> Self {
        Self {
            quality: 50,
            speed: 50,
            size_efficiency: 50,
            setup_cost: 50,
            score_boost: 0,
            min_width: 1,
            min_height: 1,
            max_width: 4096,
            max_height: 4096,
            width_mask: 0xFFFF,
            height_mask: 0xFFFF,
            can_scale: false,
            max_instances: 0,
        }
    }
}

impl CapabilitySpec {
    /// True when the implementation accepts `width x height` input.
    pub fn can_handle(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }

    /// Dimensions after mask rounding.
    pub fn masked(&self, width: u32, height: u32) -> (u32, u32) {
        (width & self.width_mask, height & self.height_mask)
    }
}

// ── Instance accounting ──────────────────────────────────────────

/// Keeps an entry's live-instance count accurate: acquired before a
/// codec instance is constructed, dropped at teardown.
#[derive(Debug)]
pub struct InstanceGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn try_acquire(counter: &Arc<AtomicUsize>, max_instances: usize) -> Option<InstanceGuard> {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if max_instances != 0 && current >= max_instances {
            return None;
        }
        match counter.compare_exchange_weak(
            current,
            current + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                return Some(InstanceGuard {
                    counter: counter.clone(),
                });
            }
            Err(actual) => current = actual,
        }
    }
}

// ── Registry entries ─────────────────────────────────────────────

/// One registered encoder implementation.
pub struct EncoderEntry {
    pub name: &'static str,
    pub encoding: Encoding,
    pub input_format: PixelFormat,
    pub spec: CapabilitySpec,
    pub factory: Arc<dyn EncoderFactory>,
    live: Arc<AtomicUsize>,
}

/// One registered colour-converter implementation.
pub struct ConverterEntry {
    pub name: &'static str,
    pub input_format: PixelFormat,
    pub output_format: PixelFormat,
    pub spec: CapabilitySpec,
    pub factory: Arc<dyn ConverterFactory>,
    live: Arc<AtomicUsize>,
}

impl EncoderEntry {
    /// Reserve an instance slot, or `None` at the `max_instances` cap.
    pub fn try_acquire(&self) -> Option<InstanceGuard> {
        try_acquire(&self.live, self.spec.max_instances)
    }

    /// Current live-instance count.
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// True when no instance slot is free.
    pub fn saturated(&self) -> bool {
        self.spec.max_instances != 0 && self.live_instances() >= self.spec.max_instances
    }
}

impl ConverterEntry {
    pub fn try_acquire(&self) -> Option<InstanceGuard> {
        try_acquire(&self.live, self.spec.max_instances)
    }

    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn saturated(&self) -> bool {
        self.spec.max_instances != 0 && self.live_instances() >= self.spec.max_instances
    }
}

impl std::fmt::Debug for EncoderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderEntry")
            .field("name", &self.name)
            .field("encoding", &self.encoding)
            .field("input_format", &self.input_format)
            .field("live", &self.live_instances())
            .finish()
    }
}

impl std::fmt::Debug for ConverterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterEntry")
            .field("name", &self.name)
            .field("input_format", &self.input_format)
            .field("output_format", &self.output_format)
            .field("live", &self.live_instances())
            .finish()
    }
}

// ── CodecRegistry ────────────────────────────────────────────────

/// Immutable collection of every codec available server-side.
///
/// Built once, then shared by `Arc` into each window's pipeline
/// manager. The raw-rgb encodings are always available even with an
/// empty registry since the crate ships that path itself.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    encoders: Vec<EncoderEntry>,
    converters: Vec<ConverterEntry>,
}

impl CodecRegistry {
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default()
    }

    /// All registered encoders, in registration order. Indices into
    /// this slice stay valid for the registry's lifetime.
    pub fn encoders(&self) -> &[EncoderEntry] {
        &self.encoders
    }

    /// All registered converters, in registration order.
    pub fn converters(&self) -> &[ConverterEntry] {
        &self.converters
    }

    /// Encoders producing `encoding` directly from `input`.
    pub fn encoders_for(
        &self,
        encoding: Encoding,
        input: PixelFormat,
    ) -> impl Iterator<Item = &EncoderEntry> {
        self.encoders
            .iter()
            .filter(move |e| e.encoding == encoding && e.input_format == input)
    }

    /// Converters consuming `input`, regardless of output.
    pub fn converters_from(&self, input: PixelFormat) -> impl Iterator<Item = &ConverterEntry> {
        self.converters
            .iter()
            .filter(move |c| c.input_format == input)
    }

    /// True when at least one encoder produces `encoding` (the raw-rgb
    /// encodings always count).
    pub fn supports(&self, encoding: Encoding) -> bool {
        matches!(encoding, Encoding::Rgb24 | Encoding::Rgb32)
            || self.encoders.iter().any(|e| e.encoding == encoding)
    }

    /// Every encoding at least one server-side codec can produce,
    /// including the built-in raw-rgb pair.
    pub fn available_encodings(&self) -> Vec<Encoding> {
        let mut out = vec![Encoding::Rgb24, Encoding::Rgb32];
        for e in &self.encoders {
            if !out.contains(&e.encoding) {
                out.push(e.encoding);
            }
        }
        out
    }
}

/// Accumulates entries, then freezes them into a shared registry.
#[derive(Default)]
pub struct CodecRegistryBuilder {
    encoders: Vec<EncoderEntry>,
    converters: Vec<ConverterEntry>,
}

impl CodecRegistryBuilder {
    pub fn encoder(
        mut self,
        name: &'static str,
        encoding: Encoding,
        input_format: PixelFormat,
        spec: CapabilitySpec,
        factory: Arc<dyn EncoderFactory>,
    ) -> Self {
        self.encoders.push(EncoderEntry {
            name,
            encoding,
            input_format,
            spec,
            factory,
            live: Arc::new(AtomicUsize::new(0)),
        });
        self
    }

    pub fn converter(
        mut self,
        name: &'static str,
        input_format: PixelFormat,
        output_format: PixelFormat,
        spec: CapabilitySpec,
        factory: Arc<dyn ConverterFactory>,
    ) -> Self {
        self.converters.push(ConverterEntry {
            name,
            input_format,
            output_format,
            spec,
            factory,
            live: Arc::new(AtomicUsize::new(0)),
        });
        self
    }

    pub fn build(self) -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry {
            encoders: self.encoders,
            converters: self.converters,
        })
    }
}

// ── ClientCapabilities ───────────────────────────────────────────

/// What one client advertised for one window.
#[derive(Debug, Clone)]
pub struct ClientCapabilities {
    /// Encodings the client can decode, unordered.
    pub encodings: Vec<Encoding>,
    /// Intermediate pixel formats accepted per encoding (video-style
    /// encodings list the colourspaces their decoder handles).
    pub csc_modes: HashMap<Encoding, Vec<PixelFormat>>,
    /// Raw pixel layouts the client accepts for the rgb encodings.
    pub rgb_formats: Vec<PixelFormat>,
    /// Client's preferred auto-refresh encodings; empty means derive
    /// from the common set.
    pub refresh_encodings: Vec<Encoding>,
    pub flags: ClientFlags,
    /// Client display depth in bits.
    pub depth: u8,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            encodings: vec![Encoding::Rgb24, Encoding::Rgb32, Encoding::Png],
            csc_modes: HashMap::new(),
            rgb_formats: vec![PixelFormat::Bgrx8, PixelFormat::Bgra8, PixelFormat::Rgb8],
            refresh_encodings: Vec::new(),
            flags: ClientFlags::default(),
            depth: 24,
        }
    }
}

impl ClientCapabilities {
    /// Intermediate formats the client decodes for `encoding`.
    pub fn dst_formats(&self, encoding: Encoding) -> &[PixelFormat] {
        self.csc_modes.get(&encoding).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Encodings usable when the window needs its alpha preserved.
    pub fn transparency_encodings(&self, server: &[Encoding]) -> Vec<Encoding> {
        encoding::common_encodings(encoding::TRANSPARENCY_ORDER, &self.encodings, server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodeOutput, PixelEncoder};
    use crate::error::BlitError;
    use crate::pixels::WindowImage;

    struct NullEncoder;
    impl PixelEncoder for NullEncoder {
        fn init_context(
            &mut self,
            _: u32,
            _: u32,
            _: PixelFormat,
            _: &[PixelFormat],
            _: Encoding,
            _: u8,
            _: u8,
        ) -> Result<(), BlitError> {
            Ok(())
        }
        fn compress_image(
            &mut self,
            _: &WindowImage,
            _: u8,
            _: u8,
        ) -> Result<Option<EncodeOutput>, BlitError> {
            Ok(None)
        }
        fn encoding(&self) -> Encoding {
            Encoding::Vp9
        }
        fn src_format(&self) -> PixelFormat {
            PixelFormat::Yuv420p
        }
        fn dimensions(&self) -> (u32, u32) {
            (0, 0)
        }
        fn clean(&mut self) {}
    }

    struct NullFactory;
    impl EncoderFactory for NullFactory {
        fn make_instance(&self) -> Box<dyn PixelEncoder> {
            Box::new(NullEncoder)
        }
    }

    fn capped_registry(max_instances: usize) -> Arc<CodecRegistry> {
        CodecRegistry::builder()
            .encoder(
                "null-vp9",
                Encoding::Vp9,
                PixelFormat::Yuv420p,
                CapabilitySpec {
                    max_instances,
                    ..Default::default()
                },
                Arc::new(NullFactory),
            )
            .build()
    }

    #[test]
    fn instance_cap_enforced_and_released() {
        let reg = capped_registry(2);
        let entry = reg
            .encoders_for(Encoding::Vp9, PixelFormat::Yuv420p)
            .next()
            .unwrap();

        let a = entry.try_acquire().unwrap();
        let _b = entry.try_acquire().unwrap();
        assert!(entry.saturated());
        assert!(entry.try_acquire().is_none());

        drop(a);
        assert_eq!(entry.live_instances(), 1);
        assert!(entry.try_acquire().is_some());
    }

    #[test]
    fn zero_max_instances_means_unlimited() {
        let reg = capped_registry(0);
        let entry = reg
            .encoders_for(Encoding::Vp9, PixelFormat::Yuv420p)
            .next()
            .unwrap();
        let guards: Vec<_> = (0..32).map(|_| entry.try_acquire().unwrap()).collect();
        assert_eq!(entry.live_instances(), 32);
        assert!(!entry.saturated());
        drop(guards);
        assert_eq!(entry.live_instances(), 0);
    }

    #[test]
    fn rgb_always_supported() {
        let reg = CodecRegistry::builder().build();
        assert!(reg.supports(Encoding::Rgb24));
        assert!(reg.supports(Encoding::Rgb32));
        assert!(!reg.supports(Encoding::Vp9));
        assert_eq!(reg.available_encodings(), vec![Encoding::Rgb24, Encoding::Rgb32]);
    }

    #[test]
    fn masked_dimensions() {
        let spec = CapabilitySpec {
            width_mask: 0xFFFE,
            height_mask: 0xFFFE,
            ..Default::default()
        };
        assert_eq!(spec.masked(641, 481), (640, 480));
        assert_eq!(spec.masked(640, 480), (640, 480));
    }
}
