//! Pipeline scoring and lifecycle.
//!
//! Stream encodings (h264, vp8...) need a two-stage pipeline: an
//! optional colour converter feeding the encoder. This module scores
//! every viable (converter, encoder) combination against the current
//! quality/speed targets, keeps the winner alive across frames, and
//! tears it down the moment the frame geometry or formats drift.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capability::{ClientCapabilities, CodecRegistry, InstanceGuard};
use crate::codec::{EncodeOutput, PixelConverter, PixelEncoder};
use crate::encoding::Encoding;
use crate::error::BlitError;
use crate::pixels::{PixelFormat, WindowImage};

/// How long a scored candidate list stays valid.
pub const SCORE_CACHE_TTL: Duration = Duration::from_secs(1);
/// Minimum interval between live-pipeline re-scoring passes.
pub const SCORE_RECHECK_INTERVAL: Duration = Duration::from_millis(750);

/// Frames at or above this size get the size-efficiency discount.
const LARGE_FRAME_PIXELS: u64 = 1 << 20;

/// Tuning inputs for one scoring pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreTargets {
    pub target_quality: u8,
    pub min_quality: u8,
    pub target_speed: u8,
    pub min_speed: u8,
}

/// One viable (converter?, encoder) combination, scored.
///
/// Entries are indices into the shared registry tables, valid for the
/// registry's lifetime. Scaling pairs are `(numerator, denominator)`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCandidate {
    pub score: i32,
    pub scaling: (u32, u32),
    pub csc_scaling: (u32, u32),
    pub csc_width: u32,
    pub csc_height: u32,
    pub converter: Option<usize>,
    /// What the encoder consumes, and the client's decoder emits.
    pub intermediate_format: PixelFormat,
    pub encoder_scaling: (u32, u32),
    pub enc_width: u32,
    pub enc_height: u32,
    pub encoder: usize,
}

struct LiveConverter {
    entry: usize,
    instance: Box<dyn PixelConverter>,
    _guard: InstanceGuard,
}

impl Drop for LiveConverter {
    fn drop(&mut self) {
        self.instance.clean();
    }
}

struct LiveEncoder {
    entry: usize,
    instance: Box<dyn PixelEncoder>,
    _guard: InstanceGuard,
}

impl Drop for LiveEncoder {
    fn drop(&mut self) {
        self.instance.clean();
    }
}

/// A live pipeline bound to one frame geometry.
pub struct Pipeline {
    pub encoding: Encoding,
    pub src_format: PixelFormat,
    /// Masked source dimensions the pipeline was set up for.
    pub width: u32,
    pub height: u32,
    csc: Option<LiveConverter>,
    encoder: LiveEncoder,
}

struct CachedScores {
    at: Instant,
    list: Vec<PipelineCandidate>,
}

// ── PipelineManager ──────────────────────────────────────────────

/// Owns one window's live pipeline and its scoring cache.
///
/// Lives on the window's encode context; never shared.
pub struct PipelineManager {
    registry: Arc<CodecRegistry>,
    client: ClientCapabilities,
    cache: HashMap<(Encoding, u32, u32, PixelFormat), CachedScores>,
    pipeline: Option<Pipeline>,
    last_check: Option<Instant>,
    /// Combined dimension masks of the live pipeline; frames are
    /// cropped to these before entering, leftovers go out as rgb edge
    /// strips.
    pub width_mask: u32,
    pub height_mask: u32,
}

impl PipelineManager {
    pub fn new(registry: Arc<CodecRegistry>, client: ClientCapabilities) -> Self {
        Self {
            registry,
            client,
            cache: HashMap::new(),
            pipeline: None,
            last_check: None,
            width_mask: 0xFFFF,
            height_mask: 0xFFFF,
        }
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    /// `(converter name, encoder name)` of the live pipeline.
    pub fn live_names(&self) -> Option<(Option<&'static str>, &'static str)> {
        let p = self.pipeline.as_ref()?;
        let csc = p.csc.as_ref().map(|c| self.registry.converters()[c.entry].name);
        Some((csc, self.registry.encoders()[p.encoder.entry].name))
    }

    /// Tear down the live pipeline, releasing both instance slots.
    pub fn clean(&mut self) {
        if self.pipeline.take().is_some() {
            debug!("pipeline cleaned");
        }
        self.width_mask = 0xFFFF;
        self.height_mask = 0xFFFF;
    }

    // ── Scoring ──────────────────────────────────────────────────

    /// The scored candidate list for one frame geometry, best first.
    /// Unscaled lookups are served from a short-lived cache.
    #[allow(clippy::too_many_arguments)]
    pub fn candidates(
        &mut self,
        now: Instant,
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        scaling: (u32, u32),
        targets: &ScoreTargets,
    ) -> Vec<PipelineCandidate> {
        let key = (encoding, width, height, src_format);
        if scaling == (1, 1) {
            if let Some(cached) = self.cache.get(&key) {
                if now.duration_since(cached.at) < SCORE_CACHE_TTL {
                    return cached.list.clone();
                }
            }
        }
        let list = self.score_all(encoding, width, height, src_format, scaling, targets);
        if scaling == (1, 1) {
            self.cache
                .retain(|_, v| now.duration_since(v.at) < SCORE_CACHE_TTL);
            self.cache.insert(
                key,
                CachedScores {
                    at: now,
                    list: list.clone(),
                },
            );
        }
        list
    }

    fn score_all(
        &self,
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        scaling: (u32, u32),
        targets: &ScoreTargets,
    ) -> Vec<PipelineCandidate> {
        let mut out = Vec::new();
        let dst_formats = self.client.dst_formats(encoding);

        // direct: the encoder consumes the captured format as-is
        if dst_formats.contains(&src_format) {
            for (ei, enc) in self.registry.encoders().iter().enumerate() {
                if enc.encoding != encoding || enc.input_format != src_format {
                    continue;
                }
                if scaling != (1, 1) && !enc.spec.can_scale {
                    continue;
                }
                let (enc_w, enc_h) = enc.spec.masked(width, height);
                if !enc.spec.can_handle(enc_w, enc_h) {
                    continue;
                }
                if enc.saturated() && !self.is_live_encoder(ei) {
                    continue;
                }
                out.push(self.score_candidate(
                    PipelineCandidate {
                        score: 0,
                        scaling,
                        csc_scaling: (1, 1),
                        csc_width: 0,
                        csc_height: 0,
                        converter: None,
                        intermediate_format: src_format,
                        encoder_scaling: scaling,
                        enc_width: enc_w,
                        enc_height: enc_h,
                        encoder: ei,
                    },
                    targets,
                ));
            }
        }

        // converter stage in front
        for (ci, conv) in self.registry.converters().iter().enumerate() {
            if conv.input_format != src_format {
                continue;
            }
            let intermediate = conv.output_format;
            if intermediate == src_format || !dst_formats.contains(&intermediate) {
                continue;
            }
            let csc_w = width & conv.spec.width_mask;
            let csc_h = height & conv.spec.height_mask;
            if !conv.spec.can_handle(csc_w, csc_h) {
                continue;
            }
            if conv.saturated() && !self.is_live_converter(ci) {
                continue;
            }
            for (ei, enc) in self.registry.encoders().iter().enumerate() {
                if enc.encoding != encoding || enc.input_format != intermediate {
                    continue;
                }
                let (csc_scaling, encoder_scaling) = if scaling == (1, 1) {
                    ((1, 1), (1, 1))
                } else if conv.spec.can_scale {
                    (scaling, (1, 1))
                } else if enc.spec.can_scale {
                    ((1, 1), scaling)
                } else {
                    continue;
                };
                let (enc_w, enc_h) = enc
                    .spec
                    .masked(scale_dim(csc_w, csc_scaling), scale_dim(csc_h, csc_scaling));
                if !enc.spec.can_handle(enc_w, enc_h) {
                    continue;
                }
                if enc.saturated() && !self.is_live_encoder(ei) {
                    continue;
                }
                out.push(self.score_candidate(
                    PipelineCandidate {
                        score: 0,
                        scaling,
                        csc_scaling,
                        csc_width: csc_w,
                        csc_height: csc_h,
                        converter: Some(ci),
                        intermediate_format: intermediate,
                        encoder_scaling,
                        enc_width: enc_w,
                        enc_height: enc_h,
                        encoder: ei,
                    },
                    targets,
                ));
            }
        }

        out.sort_by(|a, b| b.score.cmp(&a.score));
        debug!(
            %encoding, width, height, %src_format, count = out.len(),
            best = out.first().map(|c| c.score),
            "scored pipeline candidates"
        );
        out
    }

    fn score_candidate(
        &self,
        mut cand: PipelineCandidate,
        targets: &ScoreTargets,
    ) -> PipelineCandidate {
        let enc = &self.registry.encoders()[cand.encoder];
        let conv = cand.converter.map(|ci| &self.registry.converters()[ci]);

        // quality: start from the encoder's nominal value, pay for
        // chroma subsampling and a lossy converter stage
        let mut quality = enc.spec.quality as f64;
        if let Some(divs) = cand.intermediate_format.subsampling() {
            let mut div = 0.5;
            for (dx, dy) in divs {
                div += (dx + dy) as f64 / 2.0 / 3.0;
            }
            quality /= div;
        }
        if let Some(c) = conv {
            if c.spec.quality < 100 {
                quality *= c.spec.quality as f64 / 100.0;
            }
        }
        let qscore = if quality < targets.min_quality as f64 {
            0.0
        } else {
            (100.0 - (quality - targets.target_quality as f64).abs()).clamp(0.0, 100.0)
        };

        // speed: a converter stage eats into the encoder's throughput
        let mut speed = enc.spec.speed as f64;
        if let Some(c) = conv {
            speed *= c.spec.speed as f64 / 100.0;
        }
        let sscore = if speed < targets.min_speed as f64 {
            0.0
        } else {
            (100.0 - (speed - targets.target_speed as f64).abs()).clamp(0.0, 100.0)
        };

        // edge resistance: replacing a live stage costs its setup
        let live = self.pipeline.as_ref();
        let ecsc_score = match (conv, live.and_then(|p| p.csc.as_ref())) {
            (None, _) => 100.0,
            (Some(_), Some(lc)) if self.converter_matches(lc, &cand) => 100.0,
            (Some(c), _) => 100.0 - c.spec.setup_cost as f64,
        };
        let ee_score = match live {
            Some(p) if self.encoder_matches(&p.encoder, &cand) => 100.0,
            _ => 100.0 - enc.spec.setup_cost as f64,
        };
        let er_score = ((ecsc_score + ee_score) / 2.0).clamp(0.0, 100.0);

        let mut score = (qscore + sscore + er_score) / 3.0;
        // bulky output hurts most exactly when frames are biggest
        let pixels = cand.enc_width as u64 * cand.enc_height as u64;
        if pixels >= LARGE_FRAME_PIXELS && enc.spec.size_efficiency < 50 {
            score *= (50 + enc.spec.size_efficiency) as f64 / 100.0;
        }
        cand.score = score as i32 + enc.spec.score_boost as i32;
        cand
    }

    fn is_live_encoder(&self, entry: usize) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.encoder.entry == entry)
    }

    fn is_live_converter(&self, entry: usize) -> bool {
        self.pipeline
            .as_ref()
            .and_then(|p| p.csc.as_ref())
            .is_some_and(|c| c.entry == entry)
    }

    fn converter_matches(&self, live: &LiveConverter, cand: &PipelineCandidate) -> bool {
        cand.converter == Some(live.entry)
            && live.instance.src_dimensions() == (cand.csc_width, cand.csc_height)
            && live.instance.dst_format() == cand.intermediate_format
    }

    fn encoder_matches(&self, live: &LiveEncoder, cand: &PipelineCandidate) -> bool {
        live.entry == cand.encoder
            && live.instance.src_format() == cand.intermediate_format
            && live.instance.dimensions() == (cand.enc_width, cand.enc_height)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// True when the live pipeline can encode this frame as-is.
    pub fn check_pipeline(
        &self,
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
    ) -> bool {
        let Some(p) = self.pipeline.as_ref() else {
            return false;
        };
        if p.encoding != encoding || p.src_format != src_format {
            return false;
        }
        match &p.csc {
            Some(c) => {
                let conv = &self.registry.converters()[c.entry];
                let (cw, ch) = (width & conv.spec.width_mask, height & conv.spec.height_mask);
                c.instance.src_dimensions() == (cw, ch)
                    && c.instance.src_format() == src_format
                    // stage chaining must still line up
                    && c.instance.dst_format() == p.encoder.instance.src_format()
            }
            None => {
                let enc = &self.registry.encoders()[p.encoder.entry];
                p.encoder.instance.dimensions() == enc.spec.masked(width, height)
                    && p.encoder.instance.src_format() == src_format
            }
        }
    }

    /// Instantiate the best workable candidate, strictly in score
    /// order. A failing stage is cleaned up and the next candidate
    /// tried; running out of candidates is fatal for this frame.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_pipeline(
        &mut self,
        candidates: &[PipelineCandidate],
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        quality: u8,
        speed: u8,
    ) -> Result<(), BlitError> {
        let dst_formats = self.client.dst_formats(encoding).to_vec();
        for cand in candidates {
            let csc = match cand.converter {
                Some(ci) => {
                    let entry = &self.registry.converters()[ci];
                    let Some(guard) = entry.try_acquire() else {
                        continue;
                    };
                    let mut instance = entry.factory.make_instance();
                    // quality requests leave less room for csc cycles
                    let csc_speed = speed.min(100 - quality / 2).max(1);
                    if let Err(e) = instance.init_context(
                        cand.csc_width,
                        cand.csc_height,
                        src_format,
                        cand.enc_width,
                        cand.enc_height,
                        cand.intermediate_format,
                        csc_speed,
                    ) {
                        warn!(converter = entry.name, error = %e, "converter init failed, trying next candidate");
                        instance.clean();
                        continue;
                    }
                    Some(LiveConverter {
                        entry: ci,
                        instance,
                        _guard: guard,
                    })
                }
                None => None,
            };

            let entry = &self.registry.encoders()[cand.encoder];
            let Some(guard) = entry.try_acquire() else {
                continue;
            };
            let mut instance = entry.factory.make_instance();
            if let Err(e) = instance.init_context(
                cand.enc_width,
                cand.enc_height,
                cand.intermediate_format,
                &dst_formats,
                encoding,
                quality,
                speed,
            ) {
                warn!(encoder = entry.name, error = %e, "encoder init failed, trying next candidate");
                instance.clean();
                continue;
            }

            self.width_mask = cand
                .converter
                .map(|ci| self.registry.converters()[ci].spec.width_mask)
                .unwrap_or(0xFFFF)
                & entry.spec.width_mask;
            self.height_mask = cand
                .converter
                .map(|ci| self.registry.converters()[ci].spec.height_mask)
                .unwrap_or(0xFFFF)
                & entry.spec.height_mask;
            info!(
                %encoding, width, height, %src_format,
                converter = cand.converter.map(|ci| self.registry.converters()[ci].name),
                encoder = entry.name,
                score = cand.score,
                "pipeline set up"
            );
            self.pipeline = Some(Pipeline {
                encoding,
                src_format,
                width,
                height,
                csc,
                encoder: LiveEncoder {
                    entry: cand.encoder,
                    instance,
                    _guard: guard,
                },
            });
            return Ok(());
        }
        Err(BlitError::PipelineExhausted {
            encoding,
            width,
            height,
            src_format,
        })
    }

    /// Reuse the live pipeline when it still fits, else rebuild.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure(
        &mut self,
        now: Instant,
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        quality: u8,
        speed: u8,
        targets: &ScoreTargets,
    ) -> Result<(), BlitError> {
        if self.check_pipeline(encoding, width, height, src_format) {
            return Ok(());
        }
        self.clean();
        let candidates = self.candidates(now, encoding, width, height, src_format, (1, 1), targets);
        self.setup_pipeline(&candidates, encoding, width, height, src_format, quality, speed)
    }

    /// Periodically re-score the live pipeline; when a different
    /// combination now wins, tear down so the next frame rebuilds.
    /// Returns true when the pipeline was torn down.
    #[allow(clippy::too_many_arguments)]
    pub fn maybe_recheck(
        &mut self,
        now: Instant,
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        targets: &ScoreTargets,
    ) -> bool {
        let Some(p) = self.pipeline.as_ref() else {
            return false;
        };
        if p.encoding != encoding {
            return false;
        }
        if let Some(last) = self.last_check {
            if now.duration_since(last) < SCORE_RECHECK_INTERVAL {
                return false;
            }
        }
        self.last_check = Some(now);
        let list = self.score_all(encoding, width, height, src_format, (1, 1), targets);
        let Some(best) = list.first() else {
            self.clean();
            return true;
        };
        let p = match self.pipeline.as_ref() {
            Some(p) => p,
            None => return false,
        };
        let same = best.encoder == p.encoder.entry
            && best.converter == p.csc.as_ref().map(|c| c.entry);
        if !same {
            info!(score = best.score, "a better pipeline is available, tearing down");
            self.clean();
            return true;
        }
        false
    }

    // ── Encoding ─────────────────────────────────────────────────

    /// Run one image through the live pipeline.
    pub fn process(
        &mut self,
        image: &WindowImage,
        quality: u8,
        speed: u8,
    ) -> Result<Option<EncodeOutput>, BlitError> {
        let Some(p) = self.pipeline.as_mut() else {
            return Err(BlitError::StalePipeline("no live pipeline"));
        };
        match &mut p.csc {
            Some(c) => {
                let converted = c.instance.convert_image(image)?;
                let (ew, eh) = p.encoder.instance.dimensions();
                if (converted.width, converted.height) != (ew, eh) {
                    return Err(BlitError::StalePipeline(
                        "converter output does not match encoder dimensions",
                    ));
                }
                p.encoder.instance.compress_image(&converted, quality, speed)
            }
            None => p.encoder.instance.compress_image(image, quality, speed),
        }
    }
}

fn scale_dim(dim: u32, (num, den): (u32, u32)) -> u32 {
    (dim as u64 * num as u64 / den.max(1) as u64) as u32
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySpec;
    use crate::codec::{ConverterFactory, EncoderFactory};
    use bytes::Bytes;
    use serde_json::Map;

    struct FakeEncoder {
        encoding: Encoding,
        src_format: PixelFormat,
        dims: (u32, u32),
        fail_init: bool,
    }

    impl PixelEncoder for FakeEncoder {
        fn init_context(
            &mut self,
            width: u32,
            height: u32,
            src_format: PixelFormat,
            _dst_formats: &[PixelFormat],
            encoding: Encoding,
            _quality: u8,
            _speed: u8,
        ) -> Result<(), BlitError> {
            if self.fail_init {
                return Err(BlitError::CodecSetup("forced failure".into()));
            }
            self.dims = (width, height);
            self.src_format = src_format;
            self.encoding = encoding;
            Ok(())
        }

        fn compress_image(
            &mut self,
            image: &WindowImage,
            _quality: u8,
            _speed: u8,
        ) -> Result<Option<EncodeOutput>, BlitError> {
            Ok(Some(EncodeOutput {
                encoding: self.encoding,
                data: Bytes::from_static(b"frame"),
                client_options: Map::new(),
                width: image.width,
                height: image.height,
                stride: 0,
                bits_per_pixel: 24,
            }))
        }

        fn encoding(&self) -> Encoding {
            self.encoding
        }
        fn src_format(&self) -> PixelFormat {
            self.src_format
        }
        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }
        fn clean(&mut self) {}
    }

    struct FakeEncoderFactory {
        encoding: Encoding,
        src_format: PixelFormat,
        fail_init: bool,
    }

    impl EncoderFactory for FakeEncoderFactory {
        fn make_instance(&self) -> Box<dyn PixelEncoder> {
            Box::new(FakeEncoder {
                encoding: self.encoding,
                src_format: self.src_format,
                dims: (0, 0),
                fail_init: self.fail_init,
            })
        }
    }

    struct FakeConverter {
        src: (u32, u32, PixelFormat),
        dst: (u32, u32, PixelFormat),
    }

    impl PixelConverter for FakeConverter {
        fn init_context(
            &mut self,
            src_width: u32,
            src_height: u32,
            src_format: PixelFormat,
            dst_width: u32,
            dst_height: u32,
            dst_format: PixelFormat,
            _speed: u8,
        ) -> Result<(), BlitError> {
            self.src = (src_width, src_height, src_format);
            self.dst = (dst_width, dst_height, dst_format);
            Ok(())
        }

        fn convert_image(&mut self, _image: &WindowImage) -> Result<WindowImage, BlitError> {
            let (w, h, format) = self.dst;
            Ok(WindowImage::packed(
                0,
                0,
                w,
                h,
                format,
                Bytes::from(vec![0u8; (w * h) as usize]),
                w,
            ))
        }

        fn src_format(&self) -> PixelFormat {
            self.src.2
        }
        fn dst_format(&self) -> PixelFormat {
            self.dst.2
        }
        fn src_dimensions(&self) -> (u32, u32) {
            (self.src.0, self.src.1)
        }
        fn dst_dimensions(&self) -> (u32, u32) {
            (self.dst.0, self.dst.1)
        }
        fn clean(&mut self) {}
    }

    struct FakeConverterFactory;

    impl ConverterFactory for FakeConverterFactory {
        fn make_instance(&self) -> Box<dyn PixelConverter> {
            Box::new(FakeConverter {
                src: (0, 0, PixelFormat::Bgrx8),
                dst: (0, 0, PixelFormat::Yuv420p),
            })
        }
    }

    fn client_with_modes(modes: &[PixelFormat]) -> ClientCapabilities {
        let mut client = ClientCapabilities::default();
        client.csc_modes.insert(Encoding::H264, modes.to_vec());
        client
    }

    fn targets() -> ScoreTargets {
        ScoreTargets {
            target_quality: 50,
            min_quality: 0,
            target_speed: 50,
            min_speed: 0,
        }
    }

    fn spec(setup_cost: u8) -> CapabilitySpec {
        CapabilitySpec {
            setup_cost,
            ..Default::default()
        }
    }

    #[test]
    fn live_pipeline_wins_on_edge_resistance() {
        // equal quality/speed; "cheap" costs 10 to set up, "costly" 80
        let registry = CodecRegistry::builder()
            .encoder(
                "cheap",
                Encoding::H264,
                PixelFormat::Yuv444p,
                spec(10),
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .encoder(
                "costly",
                Encoding::H264,
                PixelFormat::Yuv444p,
                spec(80),
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv444p]);
        let mut mgr = PipelineManager::new(registry, client);
        let now = Instant::now();

        let cands = mgr.candidates(
            now,
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &targets(),
        );
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].encoder, 0, "cheaper setup should score higher");

        mgr.setup_pipeline(
            &cands,
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            50,
            50,
        )
        .unwrap();
        assert_eq!(mgr.live_names().unwrap().1, "cheap");

        // once live, it scores a full edge resistance and stays
        let torn_down = mgr.maybe_recheck(
            now + Duration::from_secs(2),
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            &targets(),
        );
        assert!(!torn_down);
        assert!(mgr.pipeline().is_some());
    }

    #[test]
    fn subsampled_intermediate_scores_lower_at_high_quality() {
        let registry = CodecRegistry::builder()
            .converter(
                "to-420",
                PixelFormat::Bgrx8,
                PixelFormat::Yuv420p,
                CapabilitySpec::default(),
                Arc::new(FakeConverterFactory),
            )
            .encoder(
                "enc-420",
                Encoding::H264,
                PixelFormat::Yuv420p,
                CapabilitySpec {
                    quality: 100,
                    ..spec(50)
                },
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv420p,
                    fail_init: false,
                }),
            )
            .encoder(
                "enc-444",
                Encoding::H264,
                PixelFormat::Bgrx8,
                CapabilitySpec {
                    quality: 100,
                    ..spec(50)
                },
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Bgrx8,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv420p, PixelFormat::Bgrx8]);
        let mut mgr = PipelineManager::new(registry, client);

        let t = ScoreTargets {
            target_quality: 100,
            min_quality: 0,
            target_speed: 50,
            min_speed: 0,
        };
        let cands = mgr.candidates(
            Instant::now(),
            Encoding::H264,
            640,
            480,
            PixelFormat::Bgrx8,
            (1, 1),
            &t,
        );
        assert_eq!(cands.len(), 2);
        // full-chroma direct path beats the subsampled csc path
        assert_eq!(cands[0].converter, None);
        assert!(cands[0].score > cands[1].score);
    }

    #[test]
    fn failing_candidate_falls_through_to_next() {
        let registry = CodecRegistry::builder()
            .encoder(
                "broken",
                Encoding::H264,
                PixelFormat::Yuv444p,
                CapabilitySpec {
                    quality: 90,
                    ..spec(0)
                },
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: true,
                }),
            )
            .encoder(
                "working",
                Encoding::H264,
                PixelFormat::Yuv444p,
                spec(0),
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv444p]);
        let mut mgr = PipelineManager::new(registry, client);

        let t = ScoreTargets {
            target_quality: 90,
            min_quality: 0,
            target_speed: 50,
            min_speed: 0,
        };
        let cands = mgr.candidates(
            Instant::now(),
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &t,
        );
        assert_eq!(cands[0].encoder, 0, "broken encoder scores best");
        mgr.setup_pipeline(
            &cands,
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            50,
            50,
        )
        .unwrap();
        assert_eq!(mgr.live_names().unwrap().1, "working");
    }

    #[test]
    fn saturated_encoder_is_rejected() {
        let registry = CodecRegistry::builder()
            .encoder(
                "single",
                Encoding::H264,
                PixelFormat::Yuv444p,
                CapabilitySpec {
                    max_instances: 1,
                    ..Default::default()
                },
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv444p]);
        let entry = &registry.encoders()[0];
        let _held = entry.try_acquire().unwrap();

        let mut mgr = PipelineManager::new(registry.clone(), client);
        let cands = mgr.candidates(
            Instant::now(),
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &targets(),
        );
        assert!(cands.is_empty());
    }

    #[test]
    fn dimension_change_invalidates_pipeline() {
        let registry = CodecRegistry::builder()
            .encoder(
                "enc",
                Encoding::Vp8,
                PixelFormat::Yuv444p,
                CapabilitySpec {
                    width_mask: 0xFFFE,
                    height_mask: 0xFFFE,
                    ..Default::default()
                },
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::Vp8,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .build();
        let mut client = ClientCapabilities::default();
        client
            .csc_modes
            .insert(Encoding::Vp8, vec![PixelFormat::Yuv444p]);
        let mut mgr = PipelineManager::new(registry, client);
        let now = Instant::now();

        mgr.ensure(
            now,
            Encoding::Vp8,
            641,
            481,
            PixelFormat::Yuv444p,
            50,
            50,
            &targets(),
        )
        .unwrap();
        // odd dimensions were masked down
        assert!(mgr.check_pipeline(Encoding::Vp8, 641, 481, PixelFormat::Yuv444p));
        assert_eq!(mgr.pipeline().unwrap().encoder.instance.dimensions(), (640, 480));
        assert_eq!(mgr.width_mask, 0xFFFE);

        assert!(!mgr.check_pipeline(Encoding::Vp8, 320, 240, PixelFormat::Yuv444p));
        mgr.ensure(
            now,
            Encoding::Vp8,
            320,
            240,
            PixelFormat::Yuv444p,
            50,
            50,
            &targets(),
        )
        .unwrap();
        assert_eq!(mgr.pipeline().unwrap().encoder.instance.dimensions(), (320, 240));
    }

    #[test]
    fn csc_pipeline_converts_then_encodes() {
        let registry = CodecRegistry::builder()
            .converter(
                "to-420",
                PixelFormat::Bgrx8,
                PixelFormat::Yuv420p,
                CapabilitySpec::default(),
                Arc::new(FakeConverterFactory),
            )
            .encoder(
                "enc-420",
                Encoding::H264,
                PixelFormat::Yuv420p,
                CapabilitySpec::default(),
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv420p,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv420p]);
        let mut mgr = PipelineManager::new(registry, client);
        let now = Instant::now();

        mgr.ensure(
            now,
            Encoding::H264,
            64,
            64,
            PixelFormat::Bgrx8,
            50,
            50,
            &targets(),
        )
        .unwrap();
        let names = mgr.live_names().unwrap();
        assert_eq!(names, (Some("to-420"), "enc-420"));

        let image = WindowImage::packed(
            0,
            0,
            64,
            64,
            PixelFormat::Bgrx8,
            Bytes::from(vec![0u8; 64 * 64 * 4]),
            64 * 4,
        );
        let out = mgr.process(&image, 50, 50).unwrap().unwrap();
        assert_eq!(out.encoding, Encoding::H264);
        assert_eq!((out.width, out.height), (64, 64));
    }

    #[test]
    fn candidate_cache_expires() {
        let registry = CodecRegistry::builder()
            .encoder(
                "enc",
                Encoding::H264,
                PixelFormat::Yuv444p,
                CapabilitySpec::default(),
                Arc::new(FakeEncoderFactory {
                    encoding: Encoding::H264,
                    src_format: PixelFormat::Yuv444p,
                    fail_init: false,
                }),
            )
            .build();
        let client = client_with_modes(&[PixelFormat::Yuv444p]);
        let mut mgr = PipelineManager::new(registry, client);
        let now = Instant::now();

        let first = mgr.candidates(
            now,
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &targets(),
        );
        assert_eq!(first.len(), 1);
        assert_eq!(mgr.cache.len(), 1);
        // same key within the TTL is served from cache
        mgr.candidates(
            now + Duration::from_millis(100),
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &targets(),
        );
        assert_eq!(mgr.cache.len(), 1);
        // past the TTL the entry is re-scored in place
        mgr.candidates(
            now + Duration::from_secs(2),
            Encoding::H264,
            640,
            480,
            PixelFormat::Yuv444p,
            (1, 1),
            &targets(),
        );
        assert_eq!(mgr.cache.len(), 1);
    }
}
