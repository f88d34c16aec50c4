//! Damage batching.
//!
//! Every damage event either goes out immediately or lands in a
//! [`DelayedRegion`] that accumulates rectangles until its delay
//! expires. The delay itself is adaptive: a weighted blend of recent
//! delays and correction factors derived from latency, backlog and
//! congestion statistics.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::encoding::Encoding;
use crate::geometry::Rectangle;
use crate::stats::{
    age_secs, logp, push_capped, queue_inspect, Factor, GlobalStats, WindowStats, NRECS,
};

/// Floor for the adaptive batch delay (ms).
pub const MIN_BATCH_DELAY: f64 = 5.0;
/// Delay assumed before any statistics exist (ms).
pub const START_BATCH_DELAY: f64 = 50.0;
/// Ceiling for the adaptive batch delay (ms).
pub const MAX_BATCH_DELAY: f64 = 15_000.0;
/// How long an unexpired region may sit before it is marked expired (ms).
pub const EXPIRE_DELAY: f64 = 250.0;
/// Hard limit: a region older than this triggers recovery (ms).
pub const TIMEOUT_DELAY: f64 = 15_000.0;
/// Delay applied when a caller locks batching without a value (ms).
pub const LOCKED_BATCH_DELAY: f64 = 1_000.0;
/// Damage events per `TIME_UNIT` before a storm is declared.
pub const MAX_BATCH_EVENTS: usize = 80;
/// Damaged pixels per `TIME_UNIT` before a storm is declared.
pub const MAX_BATCH_PIXELS: u64 = 1_048_576;
/// Window for the storm budget (seconds).
pub const TIME_UNIT: f64 = 1.0;
/// Soft-expiry deferrals allowed before the hard timeout arms.
pub const MAX_SOFT_EXPIRED: u32 = 5;

// ── Per-damage options ───────────────────────────────────────────

/// Overrides a caller may attach to one damage event.
///
/// When the event merges into an existing [`DelayedRegion`], values
/// already present win unless `override_options` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DamageOptions {
    /// Replace the batch delay for this event (ms).
    pub delay: Option<f64>,
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub quality: Option<u8>,
    pub speed: Option<u8>,
    pub encoding: Option<Encoding>,
    /// Marks packets produced by the auto-refresh path.
    pub auto_refresh: bool,
    /// New values replace existing ones when merging.
    pub override_options: bool,
}

impl DamageOptions {
    /// Merge `self` into options already attached to a delayed region.
    pub fn merge_into(&self, existing: &mut DamageOptions) {
        fn pick<T: Copy>(force: bool, new: Option<T>, old: &mut Option<T>) {
            if new.is_some() && (force || old.is_none()) {
                *old = new;
            }
        }
        let force = self.override_options;
        pick(force, self.delay, &mut existing.delay);
        pick(force, self.min_delay, &mut existing.min_delay);
        pick(force, self.max_delay, &mut existing.max_delay);
        pick(force, self.quality, &mut existing.quality);
        pick(force, self.speed, &mut existing.speed);
        pick(force, self.encoding, &mut existing.encoding);
        existing.auto_refresh |= self.auto_refresh;
    }
}

// ── Delayed region ───────────────────────────────────────────────

/// Damage waiting out its batch delay.
#[derive(Debug)]
pub struct DelayedRegion {
    /// When the first rectangle arrived.
    pub damage_time: Instant,
    pub regions: Vec<Rectangle>,
    /// Encoding requested at creation; `None` leaves the choice to the
    /// selector at dispatch time.
    pub encoding: Option<Encoding>,
    pub options: DamageOptions,
    /// Set once the expiry timer fired; dispatch may happen any time
    /// after that.
    pub expired: bool,
}

impl DelayedRegion {
    pub fn new(
        damage_time: Instant,
        rect: Rectangle,
        encoding: Option<Encoding>,
        options: DamageOptions,
    ) -> Self {
        Self {
            damage_time,
            regions: vec![rect],
            encoding,
            options,
            expired: false,
        }
    }
}

// ── Batch configuration ──────────────────────────────────────────

/// Adaptive batch-delay state for one window.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Batch unconditionally, even when the link is idle.
    pub always: bool,
    pub min_delay: f64,
    pub max_delay: f64,
    pub timeout_delay: f64,
    pub expire_delay: f64,
    pub start_delay: f64,
    /// Current adaptive delay (ms).
    pub delay: f64,
    /// A locked delay is honoured exactly and never recalculated.
    pub locked: bool,
    /// Delay to restore on unlock.
    pub saved: f64,
    pub max_events: usize,
    pub max_pixels: u64,
    /// Storm accounting window (seconds).
    pub time_unit: f64,
    /// Last time a region was handed off for processing.
    pub last_event: Option<Instant>,
    /// `(when, delay_ms)` as computed at damage time.
    pub last_delays: VecDeque<(Instant, f64)>,
    /// `(when, delay_ms)` as actually waited before dispatch.
    pub last_actual_delays: VecDeque<(Instant, f64)>,
    pub last_updated: Option<Instant>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self {
            always: false,
            min_delay: MIN_BATCH_DELAY,
            max_delay: MAX_BATCH_DELAY,
            timeout_delay: TIMEOUT_DELAY,
            expire_delay: EXPIRE_DELAY,
            start_delay: START_BATCH_DELAY,
            delay: START_BATCH_DELAY,
            locked: false,
            saved: START_BATCH_DELAY,
            max_events: MAX_BATCH_EVENTS,
            max_pixels: MAX_BATCH_PIXELS,
            time_unit: TIME_UNIT,
            last_event: None,
            last_delays: VecDeque::with_capacity(NRECS),
            last_actual_delays: VecDeque::with_capacity(NRECS),
            last_updated: None,
        }
    }

    pub fn record_delay(&mut self, now: Instant, delay: f64) {
        push_capped(&mut self.last_delays, NRECS, (now, delay));
    }

    pub fn record_actual_delay(&mut self, now: Instant, delay: f64) {
        push_capped(&mut self.last_actual_delays, NRECS, (now, delay));
    }

    /// Pin the delay to a fixed value, saving the adaptive one.
    pub fn lock(&mut self, delay: f64) {
        if !self.locked {
            self.locked = true;
            self.saved = self.delay;
        }
        self.delay = delay.max(self.min_delay);
    }

    /// Restore the adaptive delay saved by [`lock`](Self::lock).
    pub fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            self.delay = self.saved;
        }
    }

    /// Delay for a fresh damage event, before the batching decision.
    ///
    /// Starts from the adaptive delay (or the caller's override), bumps
    /// it after a recent resize, stretches it while congestion is hot
    /// or the encode queue is deep, clamps to the caller's bounds and
    /// finally discounts the time already elapsed since the last
    /// dispatch.
    pub fn compute_delay(
        &self,
        now: Instant,
        options: &DamageOptions,
        last_resized: Option<Instant>,
        seconds_since_congestion: f64,
        encode_queue_depth: usize,
    ) -> f64 {
        let mut delay = options.delay.unwrap_or(self.delay);
        if let Some(resized) = last_resized {
            if age_secs(now, resized) < 0.5 {
                delay = (delay + 25.0).max(50.0);
            }
        }
        if seconds_since_congestion < 1.0 {
            delay *= 2.0 - seconds_since_congestion;
        }
        if encode_queue_depth > 4 {
            delay *= encode_queue_depth as f64 / 4.0;
        }
        let min = options.min_delay.unwrap_or(self.min_delay);
        let max = options.max_delay.unwrap_or(self.max_delay);
        delay = delay.max(min).min(max);
        let elapsed_ms = self
            .last_event
            .map(|e| age_secs(now, e) * 1000.0)
            .unwrap_or(f64::INFINITY);
        (delay - elapsed_ms).max(0.0)
    }

    /// Whether this event must join a delayed region rather than going
    /// out on its own.
    pub fn must_batch(
        &self,
        now: Instant,
        delay: f64,
        force: bool,
        bandwidth_limit: u64,
        seconds_since_congestion: f64,
        last_damage_event_time: Option<Instant>,
    ) -> bool {
        if force || self.always || delay > self.min_delay || bandwidth_limit > 0 {
            return true;
        }
        if seconds_since_congestion < 60.0 {
            return true;
        }
        if let Some(last) = last_damage_event_time {
            if age_secs(now, last) * 1000.0 < self.min_delay {
                return true;
            }
        }
        // five or more events within 10ms mean a burst is in progress
        if self.last_delays.len() >= 5 {
            let (when, _) = self.last_delays[self.last_delays.len() - 5];
            if age_secs(now, when) < 0.010 {
                return true;
            }
        }
        false
    }

    /// Force batching on when the damage rate blows the per-time-unit
    /// budget while the delay sits at its minimum. Returns the overrun
    /// ratio the delay was scaled by.
    pub fn apply_damage_storm(&mut self, events_in_unit: usize, pixels_in_unit: u64) -> Option<f64> {
        if self.delay > self.min_delay || self.always {
            return None;
        }
        let eratio = events_in_unit as f64 / self.max_events as f64;
        let pratio = pixels_in_unit as f64 / self.max_pixels as f64;
        let ratio = eratio.max(pratio);
        if ratio <= 1.0 {
            return None;
        }
        self.delay = (self.min_delay * ratio).min(self.max_delay);
        Some(ratio)
    }

    /// Expiry timeout for a new delayed region.
    ///
    /// Uses the smaller of the configured expiry and the computed
    /// delay, then stretches it when the last delays ran long, so one
    /// slow region does not make the next one expire instantly.
    pub fn expire_delay_for(&self, now: Instant, delay: f64) -> f64 {
        let expire = self.expire_delay.min(delay);
        let mut inc: f64 = 0.0;
        for entry in [self.last_actual_delays.back(), self.last_delays.back()] {
            if let Some(&(when, d)) = entry {
                let delta = age_secs(now, when);
                if d > expire && delta < 5.0 {
                    let weight = (5.0 - delta) / 10.0;
                    inc = inc.max((d - expire) * weight);
                }
            }
        }
        expire + inc
    }
}

// ── Delay recalculation ──────────────────────────────────────────

/// Pixel count below which the client backlog counts as "low":
/// one frame of this window, more when the zero-copy path is active.
pub fn low_limit(mmap: bool, ww: u32, wh: u32) -> u64 {
    let mut limit = 1024 * 1024;
    if ww > 0 && wh > 0 {
        limit = (ww as u64 * wh as u64).max(64);
    }
    if mmap {
        limit *= 4;
    }
    limit
}

/// Gather correction factors from the window and connection statistics
/// and update `batch.delay`.
#[allow(clippy::too_many_arguments)]
pub fn calculate_batch_delay(
    wid: u32,
    window_dimensions: (u32, u32),
    has_focus: bool,
    soft_expired: u32,
    batch: &mut BatchConfig,
    global: &GlobalStats,
    stats: &mut WindowStats,
    bandwidth_limit: u64,
    mmap: bool,
    now: Instant,
) {
    let (ww, wh) = window_dimensions;
    let low = low_limit(mmap, ww, wh) as f64;
    let mut factors = stats.get_factors(now, bandwidth_limit);
    stats.target_latency =
        stats.get_target_client_latency(now, global.min_client_latency, global.avg_client_latency);
    factors.extend(global.get_factors(now, low));
    // damage pixels of ours still in the packet queue
    let qpixels: VecDeque<(Instant, f64)> = global.damage_qpixels_for(wid);
    let inflight = queue_inspect("damage-packet-queue-pixels", now, &qpixels, 1.0, low);
    if inflight.weight > 0.01 {
        factors.push(inflight);
    }
    // focused windows get a boost
    if has_focus {
        factors.push(Factor::new("focus", 0.0, 1.0));
    }
    // soft-expired regions are a strong sign the client cannot keep up
    if soft_expired > 0 {
        factors.push(Factor::new("soft-expired", soft_expired as f64, 1.0));
    }
    let min_delay = if batch.always { batch.min_delay } else { 0.0 };
    update_batch_delay(batch, &factors, min_delay, now);
}

/// Blend a time-weighted average of recent delays with the factor
/// targets to produce the next batch delay.
pub fn update_batch_delay(batch: &mut BatchConfig, factors: &[Factor], min_delay: f64, now: Instant) {
    let current_delay = batch.delay;
    let mut tv = 0.0;
    let mut tw = 0.0;
    // older samples matter more when we already batch a lot
    let decay = (logp(current_delay / batch.min_delay) / 5.0).max(1.0);
    let max_delay = batch.max_delay;
    for (delays, d_weight) in [
        (&batch.last_delays, 0.25),
        (&batch.last_actual_delays, 0.75),
    ] {
        for &(when, delay) in delays.iter() {
            let age = age_secs(now, when);
            let w = d_weight / (1.0 + (age / decay).powi(2));
            tv += delay.clamp(0.0, max_delay) * w;
            tw += w;
        }
    }
    let hist_w = tw;
    let all_weight: f64 = factors.iter().map(|f| f.weight).sum();
    if all_weight <= 0.0 {
        debug!(delay = current_delay, "no factor weights yet");
        return;
    }
    for f in factors {
        let target_delay = (current_delay * f.factor).clamp(0.0, max_delay);
        let w = hist_w.max(1.0) * f.weight / all_weight;
        tw += w;
        tv += target_delay * w;
    }
    batch.delay = (tv / tw).min(max_delay).max(min_delay);
    batch.last_updated = Some(now);
}

// ── Tests ────────────────────────────────────────────────────────
