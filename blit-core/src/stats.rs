//! Performance statistics driving the feedback controllers.
//!
//! Two levels: [`WindowStats`] belongs to one window's scheduler and
//! records damage latencies, encode results and pending acks;
//! [`GlobalStats`] aggregates client latency and congestion events
//! across every window of a client connection (shared behind a mutex,
//! appends are cheap and rare).
//!
//! All the weighted-average math lives here too. The guiding idea of
//! every helper: recent samples matter far more than old ones, and a
//! `factor > 1.0` means "slow down" while `factor < 1.0` means "speed
//! up", with `weight` expressing how much the metric trusts itself.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::encoding::Encoding;
use crate::geometry::Rectangle;

// ── Constants ────────────────────────────────────────────────────

/// Rolling-window length for most sample deques.
pub const NRECS: usize = 100;

/// Assumed latency (seconds) until real samples arrive.
pub const DEFAULT_LATENCY: f64 = 0.1;

/// Slack added to the target latency when counting backlog (seconds).
pub const TARGET_LATENCY_TOLERANCE: f64 = 0.020;

/// Floor for the computed target client latency (seconds).
pub const ABS_MIN_LATENCY: f64 = 0.010;

/// Pending acks older than this are presumed lost (seconds).
const ACK_EXPIRY: f64 = 60.0;

// ── Weighted averages ────────────────────────────────────────────

/// `log2(1 + x)`: a gentle curve that maps 0 to 0 and 1 to 1, used to
/// soften every ratio before it becomes a factor or weight.
pub fn logp(x: f64) -> f64 {
    (1.0 + x.max(0.0)).log2()
}

pub(crate) fn age_secs(now: Instant, when: Instant) -> f64 {
    now.saturating_duration_since(when).as_secs_f64()
}

/// Time-weighted average with tunable falloff: each sample weighs
/// `1 / (min_offset + age^rpow)`.
pub fn time_weighted_average(
    now: Instant,
    data: &[(Instant, f64)],
    min_offset: f64,
    rpow: f64,
) -> f64 {
    let mut tv = 0.0;
    let mut tw = 0.0;
    for &(when, value) in data {
        let w = 1.0 / (min_offset + age_secs(now, when).powf(rpow));
        tv += value * w;
        tw += w;
    }
    if tw <= 0.0 { 0.0 } else { tv / tw }
}

/// Returns `(average, recent)`: both time-weighted, the second one
/// slanted hard towards the last few hundred milliseconds.
pub fn calculate_time_weighted_average(now: Instant, data: &[(Instant, f64)]) -> (f64, f64) {
    let mut tv = 0.0;
    let mut tw = 0.0;
    let mut rv = 0.0;
    let mut rw = 0.0;
    for &(when, value) in data {
        let age = age_secs(now, when);
        let w = 1.0 / (1.0 + age);
        tv += value * w;
        tw += w;
        let w = 1.0 / (0.1 + age * age);
        rv += value * w;
        rw += w;
    }
    if tw <= 0.0 || rw <= 0.0 {
        (0.0, 0.0)
    } else {
        (tv / tw, rv / rw)
    }
}

/// Time-weighted throughput average where bigger samples also weigh
/// more, to stop tiny packets from skewing the rate.
///
/// `data` holds `(when, size, elapsed)` records; each contributes
/// `size * sizeunit / elapsed` (a rate). Returns `(average, recent)`.
pub fn calculate_timesize_weighted_average(
    now: Instant,
    data: &[(Instant, f64, f64)],
    sizeunit: f64,
) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let size_avg = data.iter().map(|&(_, s, _)| s).sum::<f64>() / data.len() as f64;
    if size_avg <= 0.0 {
        return (0.0, 0.0);
    }
    let mut tv = 0.0;
    let mut tw = 0.0;
    let mut rv = 0.0;
    let mut rw = 0.0;
    for &(when, size, elapsed) in data {
        if elapsed <= 0.0 {
            continue;
        }
        let pw = logp(size / size_avg);
        let rate = (size * sizeunit / elapsed).max(1.0);
        let age = age_secs(now, when);
        let w = pw / (1.0 + age);
        tv += w * rate;
        tw += w;
        let w = pw / (0.1 + age * age);
        rv += w * rate;
        rw += w;
    }
    if tw <= 0.0 || rw <= 0.0 {
        (0.0, 0.0)
    } else {
        (tv / tw, rv / rw)
    }
}

/// Like [`calculate_timesize_weighted_average`] but averages the raw
/// value of each `(when, size, value)` record instead of a rate.
///
/// Used for scoring series like compression ratios, where the value is
/// already normalized and size only decides how much a sample counts.
pub fn calculate_timesize_weighted_average_score(
    now: Instant,
    data: &[(Instant, f64, f64)],
) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let size_avg = data.iter().map(|&(_, s, _)| s).sum::<f64>() / data.len() as f64;
    if size_avg <= 0.0 {
        return (0.0, 0.0);
    }
    let mut tv = 0.0;
    let mut tw = 0.0;
    let mut rv = 0.0;
    let mut rw = 0.0;
    for &(when, size, value) in data {
        let pw = logp(size / size_avg);
        let age = age_secs(now, when);
        let w = pw / (1.0 + age);
        tv += w * value;
        tw += w;
        let w = pw / (0.1 + age * age);
        rv += w * value;
        rw += w;
    }
    if tw <= 0.0 || rw <= 0.0 {
        (0.0, 0.0)
    } else {
        (tv / tw, rv / rw)
    }
}

// ── Factor ───────────────────────────────────────────────────────

/// One metric's opinion on the batch delay (or quality/speed target).
///
/// `factor` multiplies the current value towards where the metric
/// wants it; `weight` says how loudly this metric gets to argue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub metric: &'static str,
    pub factor: f64,
    pub weight: f64,
}

impl Factor {
    pub fn new(metric: &'static str, factor: f64, weight: f64) -> Self {
        Self {
            metric,
            factor,
            weight,
        }
    }

    /// Same factor with the weight scaled by `m`.
    pub fn scaled_weight(mut self, m: f64) -> Self {
        self.weight *= m;
        self
    }
}

/// Push towards `target`: the factor grows past 1.0 as the recent
/// value overshoots the target, and the weight grows with how far the
/// recent value strays from the average.
pub fn calculate_for_target(
    metric: &'static str,
    target: f64,
    avg: f64,
    recent: f64,
    div: f64,
    slope: f64,
) -> Factor {
    let factor = logp((slope + recent) / (slope + target) / div);
    let weight = logp((slope + (recent - target).abs()) / (slope + (avg - target).abs()));
    if !factor.is_finite() || !weight.is_finite() {
        return Factor::new(metric, 1.0, 0.0);
    }
    Factor::new(metric, factor, weight)
}

/// Push towards the historical average, for metrics with no known
/// optimum.
pub fn calculate_for_average(
    metric: &'static str,
    avg: f64,
    recent: f64,
    div: f64,
    weight_div: f64,
    weight_offset: f64,
) -> Factor {
    let avg = avg / div;
    let recent = recent / div;
    if avg <= 0.0 || recent <= 0.0 {
        return Factor::new(metric, 1.0, 0.0);
    }
    let factor = logp(recent / avg);
    let weight = if factor == 0.0 {
        0.0
    } else if factor < 1.0 {
        logp(avg / recent)
    } else {
        factor
    };
    Factor::new(metric, factor, weight / weight_div + weight_offset)
}

/// Inspect a queue-depth history: are things getting better or worse?
pub fn queue_inspect(
    metric: &'static str,
    now: Instant,
    values: &VecDeque<(Instant, f64)>,
    target: f64,
    div: f64,
) -> Factor {
    if values.is_empty() {
        return Factor::new(metric, 1.0, 0.0);
    }
    let data: Vec<(Instant, f64)> = values.iter().copied().collect();
    let (avg, recent) = calculate_time_weighted_average(now, &data);
    calculate_for_target(metric, target, avg, recent, div, 0.5)
}

pub(crate) fn push_capped<T>(q: &mut VecDeque<T>, cap: usize, value: T) {
    if q.len() >= cap {
        q.pop_front();
    }
    q.push_back(value);
}

// ── PendingAck ───────────────────────────────────────────────────

/// Bookkeeping for one sent draw packet until its ack returns.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub encoding: Encoding,
    pub pixels: u64,
    /// When the damage event behind this packet arrived.
    pub damage_time: Instant,
    /// The area the packet covers, kept so a failed send can be
    /// re-damaged.
    pub rect: Rectangle,
    /// When the region left the batch and encoding started. Equal to
    /// `damage_time` until the caller says otherwise.
    pub process_time: Instant,
    /// Frame index for stream encoders; frame 0 pays decoder setup on
    /// the client and is exempt from lateness checks.
    pub frame: Option<u64>,
    /// When the transport started writing the packet.
    pub start_send: Option<Instant>,
    /// When the last byte was handed to the socket.
    pub end_send: Option<Instant>,
    pub start_bytes: u64,
    pub end_bytes: u64,
    /// Compressed payload size; the slow-send check needs it.
    pub size: usize,
}

impl PendingAck {
    pub fn new(encoding: Encoding, pixels: u64, damage_time: Instant, rect: Rectangle) -> Self {
        Self {
            encoding,
            pixels,
            damage_time,
            rect,
            process_time: damage_time,
            frame: None,
            start_send: None,
            end_send: None,
            start_bytes: 0,
            end_bytes: 0,
            size: 0,
        }
    }

    /// Bytes this packet put on the wire (0 until completed).
    pub fn bytes_sent(&self) -> u64 {
        self.end_bytes.saturating_sub(self.start_bytes)
    }
}

// ── WindowStats ──────────────────────────────────────────────────

/// Per-window performance history.
///
/// Latencies are in seconds; client decode times in microseconds (the
/// unit acks carry them in). Derived values are refreshed by
/// [`update_averages`](Self::update_averages).
#[derive(Debug)]
pub struct WindowStats {
    /// `(ack_time, pixels, decode_time_us)`.
    pub client_decode_time: VecDeque<(Instant, f64, f64)>,
    /// `(when, encoding, pixels, bits_per_pixel, compressed_size, encode_secs)`.
    pub encoding_stats: VecDeque<(Instant, Encoding, u64, u8, usize, f64)>,
    /// `(when, pixels, batch_delay_secs, latency_secs)`: damage event to
    /// packet creation.
    pub damage_in_latency: VecDeque<(Instant, u64, f64, f64)>,
    /// Same shape, but damage event to transport write completion.
    pub damage_out_latency: VecDeque<(Instant, u64, f64, f64)>,
    /// Sent packets awaiting their ack, by draw sequence.
    pub damage_ack_pending: HashMap<u64, PendingAck>,
    /// Frames and pixels sent, per encoding.
    pub encoding_totals: HashMap<Encoding, (u64, u64)>,
    /// Regions handed to the encode context but not yet packetised:
    /// sequence to `(damage_time, w, h)`.
    pub encoding_pending: HashMap<u64, (Instant, u32, u32)>,
    /// Recent raw damage events.
    pub last_damage_events: VecDeque<(Instant, Rectangle)>,
    pub last_damage_event_time: Option<Instant>,
    pub damage_events_count: u64,
    pub packet_count: u64,
    pub last_resized: Option<Instant>,

    // Derived by update_averages:
    pub target_latency: f64,
    pub avg_damage_in_latency: f64,
    pub recent_damage_in_latency: f64,
    pub avg_damage_out_latency: f64,
    pub recent_damage_out_latency: f64,
    pub max_latency: f64,
    /// Pixels per second, once at least one decode time arrived.
    pub avg_decode_speed: Option<f64>,
    pub recent_decode_speed: Option<f64>,
}

impl Default for WindowStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowStats {
    pub fn new() -> Self {
        Self {
            client_decode_time: VecDeque::with_capacity(NRECS),
            encoding_stats: VecDeque::with_capacity(NRECS),
            damage_in_latency: VecDeque::with_capacity(NRECS),
            damage_out_latency: VecDeque::with_capacity(NRECS),
            damage_ack_pending: HashMap::new(),
            encoding_totals: HashMap::new(),
            encoding_pending: HashMap::new(),
            last_damage_events: VecDeque::with_capacity(4 * NRECS),
            last_damage_event_time: None,
            damage_events_count: 0,
            packet_count: 0,
            last_resized: None,
            target_latency: DEFAULT_LATENCY,
            avg_damage_in_latency: DEFAULT_LATENCY,
            recent_damage_in_latency: DEFAULT_LATENCY,
            avg_damage_out_latency: 2.0 * DEFAULT_LATENCY,
            recent_damage_out_latency: 2.0 * DEFAULT_LATENCY,
            max_latency: 2.0 * DEFAULT_LATENCY,
            avg_decode_speed: None,
            recent_decode_speed: None,
        }
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn record_damage_event(&mut self, now: Instant, rect: Rectangle) {
        push_capped(&mut self.last_damage_events, 4 * NRECS, (now, rect));
        self.last_damage_event_time = Some(now);
        self.damage_events_count += 1;
    }

    pub fn record_decode_time(&mut self, now: Instant, pixels: u64, decode_us: f64) {
        push_capped(
            &mut self.client_decode_time,
            NRECS,
            (now, pixels as f64, decode_us),
        );
    }

    pub fn record_encode(
        &mut self,
        now: Instant,
        encoding: Encoding,
        pixels: u64,
        bits_per_pixel: u8,
        compressed_size: usize,
        encode_secs: f64,
    ) {
        push_capped(
            &mut self.encoding_stats,
            NRECS,
            (now, encoding, pixels, bits_per_pixel, compressed_size, encode_secs),
        );
        let totals = self.encoding_totals.entry(encoding).or_insert((0, 0));
        totals.0 += 1;
        totals.1 += pixels;
    }

    pub fn record_in_latency(&mut self, now: Instant, pixels: u64, batch_delay: f64, latency: f64) {
        push_capped(
            &mut self.damage_in_latency,
            NRECS,
            (now, pixels, batch_delay, latency),
        );
    }

    pub fn record_out_latency(&mut self, now: Instant, pixels: u64, batch_delay: f64, latency: f64) {
        push_capped(
            &mut self.damage_out_latency,
            NRECS,
            (now, pixels, batch_delay, latency),
        );
    }

    // ── Derived values ───────────────────────────────────────────

    pub fn update_averages(&mut self, now: Instant) {
        if !self.damage_in_latency.is_empty() {
            let data: Vec<(Instant, f64)> = self
                .damage_in_latency
                .iter()
                .map(|&(when, _, _, latency)| (when, latency))
                .collect();
            let (avg, recent) = calculate_time_weighted_average(now, &data);
            self.avg_damage_in_latency = avg;
            self.recent_damage_in_latency = recent;
        }
        if !self.damage_out_latency.is_empty() {
            let data: Vec<(Instant, f64)> = self
                .damage_out_latency
                .iter()
                .map(|&(when, _, _, latency)| (when, latency))
                .collect();
            let (avg, recent) = calculate_time_weighted_average(now, &data);
            self.avg_damage_out_latency = avg;
            self.recent_damage_out_latency = recent;
        }
        if !self.client_decode_time.is_empty() {
            let data: Vec<(Instant, f64, f64)> =
                self.client_decode_time.iter().copied().collect();
            // Decode times arrive in microseconds; scale to pixels/second.
            let (avg, recent) = calculate_timesize_weighted_average(now, &data, 1_000_000.0);
            self.avg_decode_speed = Some(avg);
            self.recent_decode_speed = Some(recent);
        }
        self.max_latency = [
            DEFAULT_LATENCY,
            self.avg_damage_in_latency,
            self.recent_damage_in_latency,
            self.avg_damage_out_latency,
            self.recent_damage_out_latency,
        ]
        .into_iter()
        .fold(0.0, f64::max);
    }

    /// Batch-delay factors from this window's own history.
    pub fn get_factors(&self, now: Instant, bandwidth_limit: u64) -> Vec<Factor> {
        let mut factors = Vec::new();
        // The gap between "in" and "out" latency is the network's share.
        if !self.damage_in_latency.is_empty() && !self.damage_out_latency.is_empty() {
            let ad = (0.040 + self.avg_damage_out_latency - self.avg_damage_in_latency).max(0.010);
            let rd =
                (0.040 + self.recent_damage_out_latency - self.recent_damage_in_latency).max(0.010);
            factors.push(calculate_for_average(
                "damage-network-delay",
                ad,
                rd,
                1.0,
                1.0,
                0.0,
            ));
        }
        if let (Some(ads), Some(rds)) = (self.avg_decode_speed, self.recent_decode_speed) {
            if ads > 0.0 && rds > 0.0 {
                // Invert: time to decode 1MB, so that slower means higher.
                let avg_1mb = 1_048_576.0 / ads;
                let recent_1mb = 1_048_576.0 / rds;
                let weight_div = (rds / 4_000_000.0).max(0.25);
                factors.push(calculate_for_average(
                    "client-decode-speed",
                    avg_1mb,
                    recent_1mb,
                    1.0,
                    weight_div,
                    0.0,
                ));
            }
        }
        if let Some(ldet) = self.last_damage_event_time {
            // A quiet window can shed its batch delay, but only once the
            // silence clearly exceeds the latency noise floor.
            let elapsed = age_secs(now, ldet);
            let mtime = (elapsed - self.max_latency * 2.0).max(0.0);
            let weight = mtime.sqrt();
            let target = (1.0 - mtime).max(0.0);
            factors.push(Factor::new("damage-rate", target, weight));
        }
        if bandwidth_limit > 0 {
            let used = self.get_bits_encoded(now, 1.0) as f64;
            // Aim for 10% below the limit.
            let target = used * 1.10 / bandwidth_limit as f64;
            let weight = (target - 1.0).max(0.0) * (5.0 + logp(target));
            factors.push(Factor::new("bandwidth-limit", target, weight));
        }
        factors
    }

    /// Latency the client should comfortably sustain: the geometric
    /// mean of minimum and average, capped at twice the minimum, plus
    /// the observed decode latency.
    pub fn get_target_client_latency(
        &self,
        now: Instant,
        min_client_latency: f64,
        avg_client_latency: f64,
    ) -> f64 {
        let mut decoding_latency = 0.010;
        if !self.client_decode_time.is_empty() {
            let data: Vec<(Instant, f64, f64)> =
                self.client_decode_time.iter().copied().collect();
            let (avg, _) = calculate_timesize_weighted_average(now, &data, 1.0);
            decoding_latency = avg / 1000.0;
        }
        let min_latency = min_client_latency.max(ABS_MIN_LATENCY) * 1.2;
        let avg_latency = avg_client_latency.max(min_latency);
        let max_latency = 2.0 * min_latency;
        (min_latency * avg_latency)
            .sqrt()
            .min(max_latency)
            .max(ABS_MIN_LATENCY)
            + decoding_latency
    }

    // ── Backlog ──────────────────────────────────────────────────

    /// Packets, pixels and bytes the client should have acked by now
    /// but has not. Pending acks older than a minute are dropped with
    /// an error (the connection is likely going away).
    pub fn get_client_backlog(&mut self, now: Instant) -> (u32, u64, u64) {
        let mut packets = 0u32;
        let mut pixels = 0u64;
        let mut bytes = 0u64;
        if self.damage_ack_pending.is_empty() {
            return (0, 0, 0);
        }
        let late_threshold = self.target_latency + TARGET_LATENCY_TOLERANCE;
        let mut dropped: Vec<u64> = Vec::new();
        for (&sequence, ack) in &self.damage_ack_pending {
            let (Some(start_send), Some(_)) = (ack.start_send, ack.end_send) else {
                continue;
            };
            let age = age_secs(now, start_send);
            if age <= late_threshold {
                continue;
            }
            if age > ACK_EXPIRY {
                dropped.push(sequence);
            } else {
                packets += 1;
                pixels += ack.pixels;
                bytes += ack.bytes_sent();
            }
        }
        if !dropped.is_empty() {
            error!(
                missing = dropped.len(),
                "expiring damage acks never answered, connection may be closing"
            );
            for sequence in dropped {
                self.damage_ack_pending.remove(&sequence);
            }
        }
        (packets, pixels, bytes)
    }

    pub fn get_acks_pending(&self) -> usize {
        self.damage_ack_pending.len()
    }

    /// Completed sends the client is late acking. `tolerance_pct`
    /// loosens the deadline for windows that just started or just
    /// recovered from congestion.
    pub fn get_packets_backlog(&self, now: Instant, tolerance_pct: u32) -> u32 {
        if self.damage_ack_pending.is_empty() {
            return 0;
        }
        let tolerance = TARGET_LATENCY_TOLERANCE * (1.0 + tolerance_pct as f64 / 100.0);
        let deadline = self.target_latency + tolerance;
        self.damage_ack_pending
            .values()
            .filter(|ack| match (ack.start_send, ack.end_send) {
                (Some(start), Some(_)) => age_secs(now, start) > deadline,
                _ => false,
            })
            .count() as u32
    }

    /// Pixels and items currently queued for the encode context.
    pub fn get_pixels_encoding_backlog(&self) -> (u64, usize) {
        let pixels = self
            .encoding_pending
            .values()
            .map(|&(_, w, h)| w as u64 * h as u64)
            .sum();
        (pixels, self.encoding_pending.len())
    }

    /// Bits of compressed output produced in the last `elapsed` seconds.
    pub fn get_bits_encoded(&self, now: Instant, elapsed: f64) -> u64 {
        self.encoding_stats
            .iter()
            .filter(|&&(when, ..)| age_secs(now, when) < elapsed)
            .map(|&(_, _, _, _, csize, _)| csize as u64 * 8)
            .sum()
    }

    /// Pixels damaged in the last `elapsed` seconds.
    pub fn get_damage_pixels(&self, now: Instant, elapsed: f64) -> u64 {
        self.last_damage_events
            .iter()
            .filter(|&&(when, _)| age_secs(now, when) < elapsed)
            .map(|&(_, rect)| rect.pixel_count())
            .sum()
    }
}

// ── GlobalStats ──────────────────────────────────────────────────

/// Statistics shared by every window of one client connection.
#[derive(Debug)]
pub struct GlobalStats {
    /// Transport queue depth as seen when packets were handed over.
    pub packet_qsizes: VecDeque<(Instant, f64)>,
    /// In-flight pixels per window at packet queue time: `(when, wid, pixels)`.
    pub damage_packet_qpixels: VecDeque<(Instant, u32, f64)>,
    /// Encode work queue depth at submit time.
    pub work_qsizes: VecDeque<(Instant, f64)>,
    /// `(wid, when, pixels, send_latency_secs)`.
    client_latency: VecDeque<(u32, Instant, u64, f64)>,
    /// Throttle evidence: `(when, lateness_pct, send_speed_bps)`.
    congestion_send_speed: VecDeque<(Instant, f64, f64)>,
    /// `(when, bytes)` put on the wire.
    pub bytes_sent: VecDeque<(Instant, u64)>,
    /// `(wid, when, pixels, damage_to_ack_secs)`.
    frame_total_latency: VecDeque<(u32, Instant, u64, f64)>,

    pub last_congestion_time: Option<Instant>,
    /// How congested the link looks, 0.0 (calm) towards 1.0 (bad).
    pub congestion_value: f64,
    pub damage_events_count: u64,
    pub packet_count: u64,
    pub decode_errors: u64,

    // Derived by update_averages:
    pub min_client_latency: f64,
    pub avg_client_latency: f64,
    pub recent_client_latency: f64,
    pub avg_congestion_send_speed: f64,
    pub avg_frame_total_latency: f64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            packet_qsizes: VecDeque::with_capacity(NRECS),
            damage_packet_qpixels: VecDeque::with_capacity(NRECS),
            work_qsizes: VecDeque::with_capacity(NRECS),
            client_latency: VecDeque::with_capacity(NRECS),
            congestion_send_speed: VecDeque::with_capacity(NRECS / 4),
            bytes_sent: VecDeque::with_capacity(NRECS / 4),
            frame_total_latency: VecDeque::with_capacity(NRECS),
            last_congestion_time: None,
            congestion_value: 0.0,
            damage_events_count: 0,
            packet_count: 0,
            decode_errors: 0,
            min_client_latency: DEFAULT_LATENCY,
            avg_client_latency: DEFAULT_LATENCY,
            recent_client_latency: DEFAULT_LATENCY,
            avg_congestion_send_speed: 0.0,
            avg_frame_total_latency: 0.0,
        }
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn record_packet_queued(&mut self, now: Instant, queue_depth: usize, wid: u32, inflight_pixels: u64) {
        push_capped(&mut self.packet_qsizes, NRECS, (now, queue_depth as f64));
        push_capped(
            &mut self.damage_packet_qpixels,
            NRECS,
            (now, wid, inflight_pixels as f64),
        );
    }

    pub fn record_work_queued(&mut self, now: Instant, queue_depth: usize) {
        push_capped(&mut self.work_qsizes, NRECS, (now, queue_depth as f64));
    }

    pub fn record_sent_bytes(&mut self, now: Instant, bytes: u64) {
        push_capped(&mut self.bytes_sent, NRECS / 4, (now, bytes));
    }

    /// Record one acked packet's latency breakdown.
    ///
    /// `decode_us` is subtracted so `client_latency` only measures the
    /// network; `total_latency` spans damage event to ack arrival.
    pub fn record_latency(
        &mut self,
        wid: u32,
        now: Instant,
        decode_us: f64,
        start_send: Instant,
        pixels: u64,
        total_latency: f64,
    ) {
        let send_diff = age_secs(now, start_send);
        let send_latency = (send_diff - decode_us / 1_000_000.0).max(0.0);
        if send_latency < self.min_client_latency {
            self.min_client_latency = send_latency;
        }
        push_capped(
            &mut self.client_latency,
            NRECS,
            (wid, now, pixels, send_latency),
        );
        push_capped(
            &mut self.frame_total_latency,
            NRECS,
            (wid, now, pixels, total_latency),
        );
    }

    /// Note evidence of congestion (late ack, slow send, expiry limit).
    pub fn record_congestion_event(
        &mut self,
        now: Instant,
        source: &str,
        late_pct: f64,
        send_speed: f64,
    ) {
        debug!(source, late_pct, send_speed, "congestion event");
        self.last_congestion_time = Some(now);
        push_capped(
            &mut self.congestion_send_speed,
            NRECS / 4,
            (now, late_pct, send_speed),
        );
    }

    pub fn seconds_since_congestion(&self, now: Instant) -> f64 {
        match self.last_congestion_time {
            Some(when) => age_secs(now, when),
            None => f64::INFINITY,
        }
    }

    pub fn client_latency_samples(&self) -> usize {
        self.client_latency.len()
    }

    /// In-flight pixel history for one window.
    pub fn damage_qpixels_for(&self, wid: u32) -> VecDeque<(Instant, f64)> {
        self.damage_packet_qpixels
            .iter()
            .filter(|&&(_, w, _)| w == wid)
            .map(|&(when, _, v)| (when, v))
            .collect()
    }

    /// Bits per second actually sent over the last `window` seconds.
    pub fn send_bitrate(&self, now: Instant, window: f64) -> u64 {
        let bits: u64 = self
            .bytes_sent
            .iter()
            .filter(|&&(when, _)| age_secs(now, when) < window)
            .map(|&(_, b)| b * 8)
            .sum();
        (bits as f64 / window) as u64
    }

    // ── Derived values ───────────────────────────────────────────

    pub fn update_averages(&mut self, now: Instant) {
        if !self.client_latency.is_empty() {
            let data: Vec<(Instant, f64)> = self
                .client_latency
                .iter()
                .map(|&(_, when, _, latency)| (when, latency))
                .collect();
            self.min_client_latency = data
                .iter()
                .map(|&(_, l)| l)
                .fold(f64::INFINITY, f64::min)
                .max(0.0);
            let (avg, recent) = calculate_time_weighted_average(now, &data);
            self.avg_client_latency = avg.max(0.001);
            self.recent_client_latency = recent.max(0.001);
        }
        self.update_congestion_send_speed(now);
        self.update_congestion_value(now);
        if !self.frame_total_latency.is_empty() {
            let data: Vec<(Instant, f64)> = self
                .frame_total_latency
                .iter()
                .map(|&(_, when, _, latency)| (when, latency))
                .collect();
            self.avg_frame_total_latency = calculate_time_weighted_average(now, &data).0;
        }
    }

    fn update_congestion_send_speed(&mut self, now: Instant) {
        // Average the throttled send speeds seen in the last minute,
        // weighted by recency and lateness; needs two samples to mean
        // anything, and loosens as the last event recedes.
        let css: Vec<&(Instant, f64, f64)> = self
            .congestion_send_speed
            .iter()
            .filter(|&&(when, _, _)| age_secs(now, when) < 60.0)
            .collect();
        let mut acss = 0.0;
        if css.len() >= 2 {
            let mut tv = 0.0;
            let mut tw = 0.0;
            for &&(when, late_pct, speed) in &css {
                let w = (1.0 + late_pct / 100.0) / (1.0 + age_secs(now, when));
                tv += speed * w;
                tw += w;
            }
            if tw > 0.0 {
                acss = tv / tw;
            }
            if let Some(&&(latest, _, _)) = css.last() {
                let elapsed = age_secs(now, latest);
                if elapsed < 30.0 {
                    acss *= 1.0 + elapsed;
                }
            }
        }
        self.avg_congestion_send_speed = acss;
    }

    fn update_congestion_value(&mut self, now: Instant) {
        // Bucket events into the last ten one-second intervals, then
        // take a recency-weighted average of the counts.
        let times: Vec<Instant> = self
            .congestion_send_speed
            .iter()
            .map(|&(when, _, _)| when)
            .collect();
        let mut cps: Vec<(Instant, f64)> = Vec::with_capacity(10);
        for t in 0..10u64 {
            let bucket_end = now - Duration::from_secs(t);
            let count = times
                .iter()
                .filter(|&&when| {
                    let age = age_secs(bucket_end, when);
                    when <= bucket_end && age < 1.0
                })
                .count();
            cps.push((bucket_end, count as f64));
        }
        self.congestion_value = time_weighted_average(now, &cps, 0.1, 2.0);
    }

    /// Batch-delay factors from connection-wide state.
    pub fn get_factors(&self, now: Instant, pixel_count: f64) -> Vec<Factor> {
        let mut factors = Vec::new();
        let mut push = |f: Factor| {
            if f.weight > 0.01 {
                factors.push(f);
            }
        };
        if !self.client_latency.is_empty() {
            let target = 0.005 + self.min_client_latency;
            let wm = logp(target / 0.020);
            push(
                calculate_for_target(
                    "client-latency",
                    target,
                    self.avg_client_latency,
                    self.recent_client_latency,
                    1.0,
                    0.005,
                )
                .scaled_weight(wm),
            );
        }
        push(queue_inspect(
            "packet-queue-size",
            now,
            &self.packet_qsizes,
            0.5,
            1.0,
        ));
        let qpix: VecDeque<(Instant, f64)> = self
            .damage_packet_qpixels
            .iter()
            .map(|&(when, _, v)| (when, v))
            .collect();
        push(queue_inspect(
            "packet-queue-pixels",
            now,
            &qpix,
            1.0,
            pixel_count,
        ));
        push(queue_inspect(
            "compression-work-queue",
            now,
            &self.work_qsizes,
            0.5,
            1.0,
        ));
        if self.congestion_value > 0.0 {
            push(Factor::new(
                "congestion",
                1.0 + self.congestion_value,
                self.congestion_value * 10.0,
            ));
        }
        factors
    }
}

// ── Tests ────────────────────────────────────────────────────────
