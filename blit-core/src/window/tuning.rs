//! Quality/speed targets.
//!
//! Speed trades compression effort for encode latency, quality trades
//! fidelity for output size. Both are recomputed from live statistics
//! and blended with their own recent history so they move smoothly.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::stats::{
    age_secs, calculate_timesize_weighted_average_score, logp, push_capped, time_weighted_average,
    GlobalStats, WindowStats, NRECS,
};

use super::batch::{low_limit, BatchConfig};

/// Quality before any statistics exist.
pub const INITIAL_QUALITY: u8 = 40;
/// Speed before any statistics exist.
pub const INITIAL_SPEED: u8 = 40;

/// Clients should keep decoding at least this many pixels per second.
const MIN_DECODE_SPEED: f64 = 1_000_000.0;

fn capr(v: u8) -> u8 {
    v.min(100)
}

// ── Target speed ─────────────────────────────────────────────────

/// Compute the target encoding speed and its ceiling.
///
/// Minimizes damage latency and keeps the client decoding comfortably;
/// ceilings from backlog, pixel rate, bandwidth and congestion cap the
/// result.
#[allow(clippy::too_many_arguments)]
pub fn get_target_speed(
    now: Instant,
    window_dimensions: (u32, u32),
    batch: &BatchConfig,
    global: &GlobalStats,
    stats: &mut WindowStats,
    bandwidth_limit: u64,
    min_speed: u8,
    speed_history: &VecDeque<(Instant, f64)>,
    mmap: bool,
) -> (f64, f64) {
    let (ww, wh) = window_dimensions;
    let low = low_limit(mmap, ww, wh) as f64;

    // four frames behind or more: compress harder
    let (_, pixels_backlog, _) = stats.get_client_backlog(now);
    let pb_ratio = pixels_backlog as f64 / low;
    let pixels_bl_s = 100.0 - 100.0 * logp(pb_ratio / 4.0);

    // larger windows get a laxer latency reference
    let mpixels = low / (1024.0 * 1024.0);
    let ref_damage_latency = (10.0 + 25.0 * (1.0 + mpixels.max(1.0).ln())) / 1000.0;

    let adil = stats.avg_damage_in_latency;
    // never run more than three reference latencies behind
    let dam_lat_abs = (adil - ref_damage_latency).max(0.0) / (ref_damage_latency * 3.0);

    let (dam_lat_rel, dam_lat_s);
    if batch.locked {
        dam_lat_rel = 0.0;
        dam_lat_s = 100.0;
    } else {
        let mut avg_delay = batch.delay;
        if !batch.last_actual_delays.is_empty() {
            let delays: Vec<(Instant, f64)> = batch.last_actual_delays.iter().copied().collect();
            avg_delay = time_weighted_average(now, &delays, 0.1, 2.0);
        }
        // ideal: one frame encoding while the next one batches
        let frame_delay = ((avg_delay + batch.delay) / 2.0).max(10.0);
        let target_damage_latency = ref_damage_latency.max(frame_delay / 1000.0);
        let mut dam_target_speed = min_speed as f64;
        if !speed_history.is_empty() {
            let history: Vec<(Instant, f64)> = speed_history.iter().copied().collect();
            dam_target_speed = dam_target_speed.max(time_weighted_average(now, &history, 0.1, 2.0));
        }
        dam_lat_rel = dam_target_speed / 100.0 * adil / target_damage_latency;
        // batching longer than we should: spend the slack compressing
        dam_lat_s = 100.0 * 2.0 * ref_damage_latency * 1000.0 / frame_delay;
    }

    // pixel rate over the last second
    let recent: Vec<u64> = stats
        .last_damage_events
        .iter()
        .filter(|&&(when, _)| age_secs(now, when) < 1.0)
        .map(|&(_, rect)| rect.pixel_count())
        .collect();
    let mpixels_per_s = recent.iter().sum::<u64>() as f64 / (1024.0 * 1024.0);
    let mut pps = 0.0;
    let mut pixel_rate_s = 100.0;
    if recent.len() > 5 && mpixels_per_s >= 1.0 {
        // 50 MPixels/s is full speed, even fast codecs peak near there
        pps = (mpixels_per_s / 50.0).sqrt();
        pixel_rate_s = 20.0 + mpixels_per_s * 20.0;
    }

    let bandwidth_s = if bandwidth_limit > 0 {
        100.0 * (bandwidth_limit as f64 / 10_000_000.0).sqrt()
    } else {
        100.0
    };

    let gcv = global.congestion_value;
    let congestion_s = if gcv > 0.0 {
        (100.0 - gcv * 1000.0).max(0.0)
    } else {
        100.0
    };

    let dec_lat = match stats.avg_decode_speed {
        Some(ads) if ads > 0.0 => MIN_DECODE_SPEED / ads,
        _ => 0.0,
    };

    let ms = (min_speed as f64).clamp(0.0, 100.0);
    let max_speed = ms.max(
        pixels_bl_s
            .min(dam_lat_s)
            .min(pixel_rate_s)
            .min(bandwidth_s)
            .min(congestion_s),
    );
    let target = dam_lat_abs.max(dam_lat_rel).max(dec_lat).max(pps).min(1.0);
    let speed = (ms + (100.0 - ms) * target).clamp(ms, max_speed.max(ms));
    (speed, max_speed)
}

// ── Target quality ───────────────────────────────────────────────

/// Compute the target encoding quality.
///
/// Minimizes client latency, packet backlog and batch delay; the
/// recent compression ratio decides whether there is headroom to raise
/// it.
#[allow(clippy::too_many_arguments)]
pub fn get_target_quality(
    now: Instant,
    window_dimensions: (u32, u32),
    batch: &BatchConfig,
    global: &GlobalStats,
    stats: &mut WindowStats,
    bandwidth_limit: u64,
    min_quality: u8,
    min_speed: u8,
    mmap: bool,
) -> f64 {
    let (ww, wh) = window_dimensions;
    let low = low_limit(mmap, ww, wh) as f64;

    let (packets_backlog, pixels_backlog, _) = stats.get_client_backlog(now);
    let pb_ratio = pixels_backlog as f64 / low;
    let pixels_bl_q = 1.0 - logp(pb_ratio / 4.0);

    let bandwidth_q = if bandwidth_limit > 0 {
        (bandwidth_limit as f64 / 10_000_000.0).sqrt()
    } else {
        1.0
    };

    let gcv = global.congestion_value;
    let congestion_q = 1.0 - gcv * 10.0;

    let mut batch_q = 1.0;
    let recs = batch.last_actual_delays.len();
    if recs > 0 && !batch.locked {
        // weighted between start delay and min delay so early samples
        // do not torpedo quality; high min-speed narrows the tolerance
        let n = 3.0 - min_speed as f64 / 50.0;
        let tolerance = 10.0 - (min_speed as f64 / 10.0).floor();
        let ref_delay = (tolerance
            + n * (batch.start_delay * 10.0 + batch.min_delay * recs as f64) / (recs as f64 + 10.0))
            .max(0.0);
        batch_q = (n * ref_delay) / batch.delay.max(batch.min_delay).max(1.0);
    }

    let mut latency_q = 1.0;
    if global.client_latency_samples() > 0 && global.recent_client_latency > 0.0 {
        latency_q = 3.0 * stats.target_latency / global.recent_client_latency;
    }

    let mut target = pixels_bl_q
        .min(bandwidth_q)
        .min(congestion_q)
        .min(batch_q)
        .min(latency_q)
        .clamp(0.0, 1.0);

    // compression ratio boost, per-1000 of the raw size
    let es: Vec<(Instant, f64, f64)> = stats
        .encoding_stats
        .iter()
        .filter(|&&(_, _, pixels, ..)| pixels >= 4096)
        .map(|&(when, _, pixels, bpp, csize, _)| {
            let ratio = 1000.0 * csize as f64 * bpp as f64 / (pixels as f64 * 32.0);
            (when, pixels as f64, ratio)
        })
        .collect();
    if es.len() >= 2 {
        let (ascore, rscore) = calculate_timesize_weighted_average_score(now, &es);
        let comp_boost = if ascore > rscore {
            // compressing better than usual: raise quality, but only
            // with no backlog to absorb the extra bytes
            if packets_backlog == 0 {
                logp((150.0 + ascore) / (150.0 + rscore)) - 1.0
            } else {
                0.0
            }
        } else {
            let mult = (1000.0 + rscore) / 2000.0;
            -logp((50.0 + rscore) / (50.0 + ascore) - 1.0) * mult
        };
        target = (target + comp_boost).max(0.0);
    }

    // speed requirements discount quality aggressively
    if min_speed > 0 {
        target = target.powf((100.0 + 4.0 * min_speed as f64) / 100.0);
    }

    // few recent damage events: we can afford better quality
    if ww > 0 && wh > 0 && !stats.last_damage_events.is_empty() {
        let mut pixl5 = 0u64;
        let mut pixn5 = 0u64;
        for &(when, rect) in &stats.last_damage_events {
            let age = age_secs(now, when);
            if age <= 5.0 {
                pixl5 += rect.pixel_count();
            } else if age <= 10.0 {
                pixn5 += rect.pixel_count();
            }
        }
        let pctpixdamaged = pixl5 as f64 / (ww as f64 * wh as f64);
        if pctpixdamaged < 0.5 {
            target *= 1.5 - pctpixdamaged;
        }
        if pixl5 < pixn5 {
            target = target.sqrt();
        }
    }

    let mq = (min_quality as f64).clamp(0.0, 100.0);
    let quality = mq + (100.0 - mq) * target;
    quality.clamp(mq, 100.0)
}

// ── Tuning state ─────────────────────────────────────────────────

/// Current quality/speed plus the histories they blend with.
#[derive(Debug)]
pub struct Tuning {
    pub current_quality: u8,
    pub current_speed: u8,
    /// Transient per-damage hint, cleared by the caller.
    pub quality_hint: Option<u8>,
    pub speed_hint: Option<u8>,
    /// Pinned by configuration; disables recalculation.
    pub fixed_quality: Option<u8>,
    pub fixed_speed: Option<u8>,
    pub min_quality: u8,
    pub min_speed: u8,
    quality_history: VecDeque<(Instant, f64)>,
    speed_history: VecDeque<(Instant, f64)>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self::new()
    }
}

impl Tuning {
    pub fn new() -> Self {
        Self {
            current_quality: INITIAL_QUALITY,
            current_speed: INITIAL_SPEED,
            quality_hint: None,
            speed_hint: None,
            fixed_quality: None,
            fixed_speed: None,
            min_quality: 0,
            min_speed: 0,
            quality_history: VecDeque::with_capacity(NRECS),
            speed_history: VecDeque::with_capacity(NRECS),
        }
    }

    /// Recompute the current speed from live statistics.
    #[allow(clippy::too_many_arguments)]
    pub fn update_speed(
        &mut self,
        now: Instant,
        suspended: bool,
        mmap: bool,
        sequence: u64,
        window_dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStats,
        stats: &mut WindowStats,
        bandwidth_limit: u64,
    ) {
        if suspended || mmap {
            return;
        }
        if let Some(hint) = self.speed_hint {
            self.current_speed = capr(hint);
            return;
        }
        if let Some(fixed) = self.fixed_speed {
            self.current_speed = capr(fixed);
            return;
        }
        if sequence < 10 {
            // too early to tell how the connection behaves
            return;
        }
        let (target, max_speed) = get_target_speed(
            now,
            window_dimensions,
            batch,
            global,
            stats,
            bandwidth_limit,
            self.min_speed,
            &self.speed_history,
            mmap,
        );
        let mut blended: Vec<(Instant, f64)> = self.speed_history.iter().copied().collect();
        blended.push((now, target));
        let speed = time_weighted_average(now, &blended, 1.0, 1.1)
            .max(self.min_speed as f64)
            .min(max_speed)
            .max(0.0);
        debug!(
            speed = speed as u8,
            target = target as u8,
            max = max_speed as u8,
            "updated speed"
        );
        self.current_speed = speed as u8;
        push_capped(&mut self.speed_history, NRECS, (now, speed));
    }

    /// Recompute the current quality from live statistics.
    #[allow(clippy::too_many_arguments)]
    pub fn update_quality(
        &mut self,
        now: Instant,
        suspended: bool,
        mmap: bool,
        sequence: u64,
        lossless_encoding: bool,
        content_text: bool,
        content_video: bool,
        window_dimensions: (u32, u32),
        batch: &BatchConfig,
        global: &GlobalStats,
        stats: &mut WindowStats,
        bandwidth_limit: u64,
    ) {
        if suspended || mmap {
            return;
        }
        if let Some(hint) = self.quality_hint {
            self.current_quality = capr(hint);
            return;
        }
        if let Some(fixed) = self.fixed_quality {
            self.current_quality = capr(fixed);
            return;
        }
        if lossless_encoding {
            // the chosen encoding ignores quality entirely
            self.current_quality = 100;
            return;
        }
        if sequence < 10 {
            return;
        }
        let mut target = get_target_quality(
            now,
            window_dimensions,
            batch,
            global,
            stats,
            bandwidth_limit,
            self.min_quality,
            self.min_speed,
            mmap,
        );
        if content_text {
            target = (target + 20.0).min(100.0);
        } else if content_video {
            target = (target - 20.0).max(0.0);
        }
        let mut blended: Vec<(Instant, f64)> = self.quality_history.iter().copied().collect();
        blended.push((now, target));
        let quality = time_weighted_average(now, &blended, 0.1, 1.2)
            .max(self.min_quality as f64)
            .min(99.0)
            .max(0.0);
        debug!(
            quality = quality as u8,
            target = target as u8,
            "updated quality"
        );
        self.current_quality = quality as u8;
        push_capped(&mut self.quality_history, NRECS, (now, quality));
    }
}

// ── Tests ────────────────────────────────────────────────────────
