//! Ack tracking and congestion detection.
//!
//! Every draw packet carries a sequence number the client echoes back
//! once it has decoded the pixels. Until then the packet sits in the
//! per-window pending table; the transport reports send start and
//! completion so the wait splits into queueing, wire time and decode
//! time. Three signals come out of this: latency samples for the batch
//! factors, congestion events for the bandwidth controller, and forced
//! lossless repaints when the client reports a decode error.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::encoding::Encoding;
use crate::geometry::Rectangle;
use crate::stats::{age_secs, logp, GlobalStats, PendingAck, WindowStats};

/// Percentage padding on the measured network latency before an ack
/// counts as late.
pub const ACK_JITTER: u64 = 20;

/// Fixed grace period before an ack counts as late (ms).
pub const ACK_TOLERANCE: u64 = 100;

/// Slow sends only count as congestion while the bandwidth limit sits
/// below this (bps); above it scheduling noise dominates wire time.
pub const SLOW_SEND_THRESHOLD: u64 = 20_000_000;

/// How long this packet should take to send, in ms.
///
/// Uses the bandwidth limit when one is known, otherwise a log curve
/// that stays tolerant for large packets.
pub fn estimate_send_delay(bytes: u64, bandwidth_limit: u64) -> f64 {
    if bandwidth_limit > 0 {
        1000.0 * (bytes * 8) as f64 / bandwidth_limit.max(200_000) as f64
    } else {
        10.0 * logp(bytes as f64 / 1024.0)
    }
}

// ── AckVerdict ───────────────────────────────────────────────────

/// Follow-up the control task owes after processing an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    /// On time, or nothing measurable.
    Ok,
    /// Late enough to count as congestion: hold pending refreshes
    /// back.
    Congested,
    /// The client could not decode the packet; force a lossless
    /// repaint after this debounce delay.
    DecodeError { refresh_delay: Duration },
}

// ── AckTracker ───────────────────────────────────────────────────

/// Per-window bookkeeping around [`WindowStats::damage_ack_pending`].
#[derive(Debug)]
pub struct AckTracker {
    wid: u32,
    /// When this window started sending; the lateness tolerance decays
    /// over the first two seconds of its life.
    init_time: Instant,
    /// Client-reported transport jitter (ms), added to the tolerance.
    pub jitter: u64,
}

impl AckTracker {
    pub fn new(wid: u32, jitter: u64, now: Instant) -> Self {
        Self {
            wid,
            init_time: now,
            jitter,
        }
    }

    /// Register a packet handed to the transport: opens the pending
    /// record and takes the damage-to-packet latency sample.
    #[allow(clippy::too_many_arguments)]
    pub fn record_queued(
        &self,
        stats: &mut WindowStats,
        now: Instant,
        sequence: u64,
        encoding: Encoding,
        rect: Rectangle,
        damage_time: Instant,
        process_time: Instant,
        frame: Option<u64>,
        size: usize,
    ) {
        let pixels = rect.pixel_count();
        let mut pending = PendingAck::new(encoding, pixels, damage_time, rect);
        pending.process_time = process_time;
        pending.frame = frame;
        pending.size = size;
        stats.damage_ack_pending.insert(sequence, pending);
        let batch = age_secs(process_time, damage_time);
        stats.record_in_latency(now, pixels, batch, age_secs(now, process_time));
        stats.packet_count += 1;
    }

    /// The transport started writing the packet. `bytes` is the
    /// transport's cumulative output counter.
    pub fn send_started(&self, stats: &mut WindowStats, now: Instant, sequence: u64, bytes: u64) {
        if let Some(pending) = stats.damage_ack_pending.get_mut(&sequence) {
            pending.start_send = Some(now);
            pending.start_bytes = bytes;
        }
    }

    /// The transport finished writing the packet. Returns true when
    /// the send was slow enough to count as a congestion event.
    pub fn send_completed(
        &self,
        stats: &mut WindowStats,
        global: &mut GlobalStats,
        now: Instant,
        sequence: u64,
        bytes: u64,
        bandwidth_limit: u64,
    ) -> bool {
        let Some(pending) = stats.damage_ack_pending.get_mut(&sequence) else {
            return false;
        };
        pending.end_send = Some(now);
        pending.end_bytes = bytes;
        let pixels = pending.pixels;
        let size = pending.size;
        let batch = age_secs(pending.process_time, pending.damage_time);
        let out_latency = age_secs(now, pending.process_time);
        let started = pending.start_send;
        stats.record_out_latency(now, pixels, batch, out_latency);
        // Slow sends only matter when the link is already known to be
        // constrained.
        if size <= 1024 || bandwidth_limit >= SLOW_SEND_THRESHOLD {
            return false;
        }
        let Some(started) = started else {
            return false;
        };
        let elapsed_ms = 1000.0 * age_secs(now, started);
        let max_send_delay = 5.0 + estimate_send_delay(size as u64, bandwidth_limit);
        if elapsed_ms <= max_send_delay {
            return false;
        }
        let late_pct = elapsed_ms * 100.0 / max_send_delay - 100.0;
        let send_speed = (size * 8) as f64 * 1000.0 / elapsed_ms;
        self.congestion_event(global, now, "slow send", late_pct, send_speed);
        true
    }

    /// Process the client's acknowledgement for `sequence`.
    ///
    /// `decode_time_us` is the decode time the client measured, in
    /// microseconds; zero means no measurement (synthesised acks) and
    /// negative values are error codes.
    #[allow(clippy::too_many_arguments)]
    pub fn acked(
        &self,
        stats: &mut WindowStats,
        global: &mut GlobalStats,
        now: Instant,
        sequence: u64,
        width: u32,
        height: u32,
        decode_time_us: i64,
        message: &str,
        bandwidth_limit: u64,
    ) -> AckVerdict {
        debug!(
            wid = self.wid,
            sequence,
            width,
            height,
            decode_ms = decode_time_us as f64 / 1000.0,
            "packet decoded"
        );
        let mut verdict = AckVerdict::Ok;
        if decode_time_us > 0 {
            stats.record_decode_time(now, width as u64 * height as u64, decode_time_us as f64);
        } else if decode_time_us < 0 {
            verdict = self.decode_error(global, decode_time_us, message);
        }
        let Some(pending) = stats.damage_ack_pending.remove(&sequence) else {
            debug!(sequence, "no pending record for this ack");
            return verdict;
        };
        // The ack can outrun the transport's completion report; only
        // measure fully accounted sends.
        let bytecount = pending.bytes_sent();
        let (Some(start_send), Some(_)) = (pending.start_send, pending.end_send) else {
            return verdict;
        };
        if bytecount == 0 {
            return verdict;
        }
        if decode_time_us > 0 {
            let total_latency = age_secs(now, pending.damage_time);
            global.record_latency(
                self.wid,
                now,
                decode_time_us as f64,
                start_send,
                pending.pixels,
                total_latency,
            );
        }
        // The first frame of a stream pays decoder setup on the
        // client; its timing says nothing about the network.
        if pending.frame == Some(0) {
            return verdict;
        }
        let decode_ms = decode_time_us.max(0) as f64 / 1000.0;
        let netlatency = 1000.0 * global.min_client_latency * (100 + ACK_JITTER) as f64 / 100.0;
        let sendlatency = estimate_send_delay(bytecount, bandwidth_limit).min(200.0);
        let live_time = 1000.0 * age_secs(now, self.init_time);
        let ack_tolerance =
            (self.jitter + ACK_TOLERANCE) as f64 + (200.0 - live_time / 10.0).max(0.0);
        let expected = netlatency + sendlatency + decode_ms + ack_tolerance;
        let actual = 1000.0 * age_secs(now, start_send);
        let late_by = actual - expected;
        if late_by > 0.0 && (live_time >= 1000.0 || pending.pixels >= 4096) {
            let actual_send_latency = actual - netlatency - decode_ms;
            let late_pct = actual_send_latency * 100.0 / (1.0 + sendlatency);
            let send_speed = if pending.pixels <= 4096 || actual_send_latency <= 0.0 {
                // Small packets skew the estimate; scroll-sized ones
                // especially.
                0.0
            } else {
                (bytecount * 8) as f64 * 1000.0 / actual_send_latency
            };
            debug!(
                sequence,
                late_by, netlatency, sendlatency, decode_ms, ack_tolerance, "late ack"
            );
            self.congestion_event(global, now, "late-ack", late_pct, send_speed);
            if verdict == AckVerdict::Ok {
                verdict = AckVerdict::Congested;
            }
        }
        verdict
    }

    /// The transport gave up on this packet. Synthesises the missing
    /// ack so the pending table stays truthful and returns the
    /// rectangle so the caller can damage it again.
    pub fn send_failed(
        &self,
        stats: &mut WindowStats,
        global: &mut GlobalStats,
        now: Instant,
        sequence: u64,
        bandwidth_limit: u64,
    ) -> Option<Rectangle> {
        let rect = stats.damage_ack_pending.get(&sequence).map(|p| p.rect)?;
        warn!(wid = self.wid, sequence, "packet send failed, repainting");
        self.acked(
            stats,
            global,
            now,
            sequence,
            rect.w as u32,
            rect.h as u32,
            0,
            "",
            bandwidth_limit,
        );
        Some(rect)
    }

    fn decode_error(&self, global: &mut GlobalStats, code: i64, message: &str) -> AckVerdict {
        global.decode_errors += 1;
        if message.is_empty() {
            warn!(wid = self.wid, code, "client decoding error: unknown cause");
        } else {
            warn!(wid = self.wid, code, message, "client decoding error");
        }
        // Repaint losslessly, debounced harder as errors accumulate.
        let delay = (250 + global.decode_errors * 100).min(1000);
        AckVerdict::DecodeError {
            refresh_delay: Duration::from_millis(delay),
        }
    }

    /// Record one congestion event, estimating the usable send speed
    /// from recent wire history.
    fn congestion_event(
        &self,
        global: &mut GlobalStats,
        now: Instant,
        source: &str,
        late_pct: f64,
        cur_send_speed: f64,
    ) {
        let speed = blended_send_speed(global, now, late_pct, cur_send_speed);
        debug!(
            wid = self.wid,
            source,
            late_pct,
            speed_kbps = speed / 1024.0,
            "congestion event"
        );
        global.record_congestion_event(now, source, late_pct, speed);
    }
}

// ── Send speed ───────────────────────────────────────────────────

/// Average wire speed over a 4-10s window ending just before the
/// congestion started, blended with the instantaneous measurement
/// (weighted by how late we are — the later, the more the instant
/// reading can be trusted).
fn blended_send_speed(
    global: &GlobalStats,
    now: Instant,
    late_pct: f64,
    cur_send_speed: f64,
) -> f64 {
    let sent = &global.bytes_sent;
    let n = sent.len();
    if n < 5 {
        return cur_send_speed;
    }
    // Newest sample more than a second old, checking at most three
    // back: the congestion hopefully started after it.
    let mut i = 1;
    let mut t1 = sent[n - 1].0;
    while i < 4 {
        let (when, _) = sent[n - i];
        t1 = when;
        i += 1;
        if age_secs(now, when) > 1.0 {
            break;
        }
    }
    // Walk further back for a sample 4-10s earlier with at least
    // 64KiB sent in between.
    let mut accumulated = sent[n - (i - 1)].1;
    let mut between = accumulated;
    let mut span = 0.0;
    while i < n {
        let (when, increment) = sent[n - i];
        span = age_secs(t1, when);
        between = accumulated;
        if span > 10.0 {
            // Too far back: not enough data sent in ten seconds.
            break;
        }
        if span >= 4.0 && between >= 65_536 {
            break;
        }
        accumulated += increment;
        i += 1;
    }
    if !(4.0..=10.0).contains(&span) {
        return cur_send_speed;
    }
    let avg = (between * 8) as f64 / span;
    if cur_send_speed > 0.0 {
        (avg * 100.0 + cur_send_speed * late_pct) / 2.0 / (100.0 + late_pct)
    } else {
        avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn rect(w: i32, h: i32) -> Rectangle {
        Rectangle::new(0, 0, w, h)
    }

    /// Queue + start + complete one packet covering `r`, `age` seconds
    /// before `now`, with `wire_bytes` on the wire.
    fn sent_packet(
        tracker: &AckTracker,
        stats: &mut WindowStats,
        global: &mut GlobalStats,
        now: Instant,
        sequence: u64,
        r: Rectangle,
        age: f64,
        wire_bytes: u64,
    ) {
        let then = now - secs(age);
        tracker.record_queued(stats, then, sequence, Encoding::Png, r, then, then, None, 100);
        tracker.send_started(stats, then, sequence, 1000);
        tracker.send_completed(stats, global, now - secs(age * 0.5), sequence, 1000 + wire_bytes, 0);
    }

    #[test]
    fn timely_ack_records_latency() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now - secs(10.0));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        sent_packet(&tracker, &mut stats, &mut global, now, 7, rect(100, 100), 0.05, 20_000);
        let verdict = tracker.acked(&mut stats, &mut global, now, 7, 100, 100, 3_000, "", 0);
        assert_eq!(verdict, AckVerdict::Ok);
        assert!(stats.damage_ack_pending.is_empty());
        assert_eq!(stats.client_decode_time.len(), 1);
        assert_eq!(global.client_latency_samples(), 1);
        assert!(global.last_congestion_time.is_none());
    }

    #[test]
    fn late_ack_counts_as_congestion() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now - secs(10.0));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        // Started a full second ago: far past expected latency.
        sent_packet(&tracker, &mut stats, &mut global, now, 7, rect(400, 400), 1.0, 100_000);
        let verdict = tracker.acked(&mut stats, &mut global, now, 7, 400, 400, 5_000, "", 0);
        assert_eq!(verdict, AckVerdict::Congested);
        assert!(global.last_congestion_time.is_some());
    }

    #[test]
    fn first_frame_is_exempt_from_lateness() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now - secs(10.0));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        let r = rect(400, 400);
        let then = now - secs(1.0);
        tracker.record_queued(&mut stats, then, 7, Encoding::H264, r, then, then, Some(0), 100);
        tracker.send_started(&mut stats, then, 7, 0);
        tracker.send_completed(&mut stats, &mut global, then, 7, 100_000, 0);
        let verdict = tracker.acked(&mut stats, &mut global, now, 7, 400, 400, 5_000, "", 0);
        assert_eq!(verdict, AckVerdict::Ok);
        assert!(global.last_congestion_time.is_none());
    }

    #[test]
    fn young_window_small_packet_gets_grace() {
        let now = Instant::now();
        // Window just appeared: tolerance term still near its maximum.
        let tracker = AckTracker::new(1, 0, now - secs(0.5));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        // Tiny region: below the 4096px floor for lateness checks.
        sent_packet(&tracker, &mut stats, &mut global, now, 7, rect(20, 20), 1.0, 100_000);
        let verdict = tracker.acked(&mut stats, &mut global, now, 7, 20, 20, 5_000, "", 0);
        assert_eq!(verdict, AckVerdict::Ok);
        assert!(global.last_congestion_time.is_none());
    }

    #[test]
    fn ack_before_send_complete_only_pops() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now);
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        tracker.record_queued(&mut stats, now, 3, Encoding::Png, rect(50, 50), now, now, None, 900);
        tracker.send_started(&mut stats, now, 3, 0);
        let verdict = tracker.acked(&mut stats, &mut global, now, 3, 50, 50, 2_000, "", 0);
        assert_eq!(verdict, AckVerdict::Ok);
        assert!(stats.damage_ack_pending.is_empty());
        assert_eq!(global.client_latency_samples(), 0);
    }

    #[test]
    fn unknown_sequence_is_harmless() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now);
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        let verdict = tracker.acked(&mut stats, &mut global, now, 99, 10, 10, 1_000, "", 0);
        assert_eq!(verdict, AckVerdict::Ok);
    }

    #[test]
    fn slow_send_on_constrained_link_is_congestion() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now - secs(10.0));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        let then = now - secs(2.0);
        tracker.record_queued(
            &mut stats,
            then,
            5,
            Encoding::Png,
            rect(300, 300),
            then,
            then,
            None,
            100_000,
        );
        tracker.send_started(&mut stats, then, 5, 0);
        // 100KB taking 2s against a 1Mbps budget of ~805ms.
        let congested = tracker.send_completed(&mut stats, &mut global, now, 5, 100_000, 1_000_000);
        assert!(congested);
        assert!(global.last_congestion_time.is_some());
    }

    #[test]
    fn slow_send_on_fast_link_is_ignored() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now - secs(10.0));
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        let then = now - secs(2.0);
        tracker.record_queued(
            &mut stats,
            then,
            5,
            Encoding::Png,
            rect(300, 300),
            then,
            then,
            None,
            100_000,
        );
        tracker.send_started(&mut stats, then, 5, 0);
        let congested =
            tracker.send_completed(&mut stats, &mut global, now, 5, 100_000, SLOW_SEND_THRESHOLD);
        assert!(!congested);
        assert!(global.last_congestion_time.is_none());
    }

    #[test]
    fn decode_error_debounce_grows_with_errors() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now);
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        tracker.record_queued(&mut stats, now, 1, Encoding::Png, rect(50, 50), now, now, None, 0);
        let first = tracker.acked(&mut stats, &mut global, now, 1, 50, 50, -1, "bad data", 0);
        assert_eq!(
            first,
            AckVerdict::DecodeError {
                refresh_delay: Duration::from_millis(350)
            }
        );
        tracker.record_queued(&mut stats, now, 2, Encoding::Png, rect(50, 50), now, now, None, 0);
        let second = tracker.acked(&mut stats, &mut global, now, 2, 50, 50, -1, "", 0);
        assert_eq!(
            second,
            AckVerdict::DecodeError {
                refresh_delay: Duration::from_millis(450)
            }
        );
        // Caps at one second no matter how many errors pile up.
        global.decode_errors = 50;
        tracker.record_queued(&mut stats, now, 3, Encoding::Png, rect(50, 50), now, now, None, 0);
        let capped = tracker.acked(&mut stats, &mut global, now, 3, 50, 50, -2, "", 0);
        assert_eq!(
            capped,
            AckVerdict::DecodeError {
                refresh_delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(global.decode_errors, 51);
    }

    #[test]
    fn send_failure_returns_rect_and_settles_pending() {
        let now = Instant::now();
        let tracker = AckTracker::new(1, 0, now);
        let mut stats = WindowStats::new();
        let mut global = GlobalStats::new();
        let r = Rectangle::new(10, 20, 100, 50);
        tracker.record_queued(&mut stats, now, 4, Encoding::Webp, r, now, now, None, 4_000);
        let redamage = tracker.send_failed(&mut stats, &mut global, now, 4, 0);
        assert_eq!(redamage, Some(r));
        assert!(stats.damage_ack_pending.is_empty());
        // A second failure report for the same sequence finds nothing.
        assert_eq!(tracker.send_failed(&mut stats, &mut global, now, 4, 0), None);
    }

    #[test]
    fn estimate_send_delay_uses_limit_when_known() {
        // 100KB over 1Mbps: 800ms.
        assert!((estimate_send_delay(100_000, 1_000_000) - 800.0).abs() < 1.0);
        // Limits below the 200kbps floor do not blow the estimate up.
        assert!((estimate_send_delay(100_000, 10_000) - 4000.0).abs() < 1.0);
        // No limit: log curve, gentle for big packets.
        let unknown = estimate_send_delay(102_400, 0);
        assert!(unknown > 60.0 && unknown < 70.0, "got {unknown}");
    }

    #[test]
    fn send_speed_window_picks_pre_congestion_samples() {
        let now = Instant::now();
        let mut global = GlobalStats::new();
        // Oldest first. The scan should anchor on the sample 1.5s ago
        // and pair it with the one 6s back: 80KB over 4.5s.
        global.record_sent_bytes(now - secs(12.0), 10_000);
        global.record_sent_bytes(now - secs(6.0), 30_000);
        global.record_sent_bytes(now - secs(3.0), 40_000);
        global.record_sent_bytes(now - secs(1.5), 40_000);
        global.record_sent_bytes(now - secs(0.1), 5_000);
        let avg = blended_send_speed(&global, now, 0.0, 0.0);
        let expected = 80_000.0 * 8.0 / 4.5;
        assert!((avg - expected).abs() < 1.0, "got {avg}, want {expected}");
        // With an instantaneous reading, very-late events trust it
        // more.
        let blended = blended_send_speed(&global, now, 100.0, 50_000.0);
        let want = (expected * 100.0 + 50_000.0 * 100.0) / 2.0 / 200.0;
        assert!((blended - want).abs() < 1.0, "got {blended}, want {want}");
    }

    #[test]
    fn send_speed_needs_history() {
        let now = Instant::now();
        let mut global = GlobalStats::new();
        global.record_sent_bytes(now - secs(5.0), 100_000);
        global.record_sent_bytes(now - secs(0.1), 100_000);
        assert_eq!(blended_send_speed(&global, now, 50.0, 123.0), 123.0);
    }
}
