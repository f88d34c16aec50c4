//! Auto-refresh scheduling.
//!
//! Lossy screen updates leave the client with an approximation; this
//! module tracks which rectangles still need a lossless pass and when
//! to send it. There is one refresh timer per window and later lossy
//! sends can only push its target time further out, so a busy window
//! converges instead of refreshing mid-burst.

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

use crate::encoding::Encoding;
use crate::geometry::{add_rectangle, remove_rectangle, total_pixels, Rectangle};
use crate::packet::options;
use crate::window::select::{ContentType, Selector};

pub const AUTO_REFRESH_QUALITY: u8 = 100;
pub const AUTO_REFRESH_SPEED: u8 = 50;
/// Initial floor for the recomputed minimum refresh delay (ms).
pub const MIN_AUTO_REFRESH_DELAY: u64 = 50;

/// Fires this close to the target count as on time.
const FIRE_SLACK: Duration = Duration::from_millis(50);

/// What the caller should do with the refresh timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// Leave the timer alone.
    Keep,
    /// Cancel any armed timer.
    Cancel,
    /// (Re-)arm the timer to fire after this many milliseconds.
    Schedule(u64),
}

/// Outcome of a refresh timer firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerFire {
    /// Nothing left to refresh.
    Idle,
    /// The target moved while the timer was pending; re-arm for the
    /// remaining milliseconds.
    ReArm(u64),
    /// Due: refresh these rectangles now.
    Refresh(Vec<Rectangle>),
}

// ── RefreshState ─────────────────────────────────────────────────

/// Pending-refresh bookkeeping for one window.
///
/// Pure state plus decisions; the owning scheduler does the actual
/// timer plumbing from the returned [`RefreshAction`]s.
#[derive(Debug)]
pub struct RefreshState {
    /// Configured base delay in ms; 0 disables auto-refresh.
    pub auto_refresh_delay: u64,
    /// Recomputed floor for any scheduled delay (ms).
    pub min_delay: u64,
    /// Recomputed base delay the percentage scaling applies to (ms).
    pub base_delay: u64,
    /// Quality bar: packets below it count as lossy.
    pub quality: u8,
    /// Speed used when encoding the refresh itself.
    pub speed: u8,
    /// Rectangles still shown lossy client-side. Non-overlapping.
    pub regions: Vec<Rectangle>,
    pub timer_armed: bool,
    event_time: Option<Instant>,
    target_time: Option<Instant>,
}

impl RefreshState {
    pub fn new(auto_refresh_delay: u64) -> Self {
        Self {
            auto_refresh_delay,
            min_delay: MIN_AUTO_REFRESH_DELAY,
            base_delay: auto_refresh_delay,
            quality: AUTO_REFRESH_QUALITY,
            speed: AUTO_REFRESH_SPEED,
            regions: Vec::new(),
            timer_armed: false,
            event_time: None,
            target_time: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.auto_refresh_delay > 0
    }

    /// Drop all pending-refresh state, returning what was pending.
    pub fn clear(&mut self) -> Vec<Rectangle> {
        self.event_time = None;
        self.target_time = None;
        self.timer_armed = false;
        std::mem::take(&mut self.regions)
    }

    // ── Attribute recomputation ──────────────────────────────────

    /// Recompute delays and the refresh quality/speed pair from the
    /// current tuning values.
    #[allow(clippy::too_many_arguments)]
    pub fn update_attributes(
        &mut self,
        mmap_active: bool,
        ww: u32,
        wh: u32,
        congestion_value: f64,
        current_quality: u8,
        current_speed: u8,
        batch_delay: f64,
        bandwidth_limit: u64,
        content: ContentType,
    ) {
        if mmap_active {
            // that path is lossless, nothing ever needs a refresh
            return;
        }
        if self.auto_refresh_delay == 0 {
            self.base_delay = 0;
            return;
        }
        let cv = congestion_value;
        // bigger windows, lower quality/speed and congestion all
        // stretch the delay
        let sizef = ((ww as u64 * wh as u64) as f64 / 1e6).sqrt();
        let qf = (150 - current_quality as i32) as f64 / 100.0;
        let sf = (150 - current_speed as i32) as f64 / 100.0;
        let cf = (100.0 + cv * 500.0) / 100.0;
        let mut min_delay = (100.0 * cf)
            .max(self.auto_refresh_delay as f64)
            .max(50.0 * sizef)
            .max(batch_delay * 4.0) as u64;
        if bandwidth_limit > 0 {
            // 1Mbps -> 1s, 10Mbps -> 0.1s
            min_delay = min_delay.max(1_000_000_000 / bandwidth_limit);
        }
        let max_delay = (1000.0 * cf) as u64;
        let mut raw_delay = (sizef * qf * sf * cf) as u64;
        match content {
            ContentType::Text => raw_delay = raw_delay * 2 / 3,
            ContentType::Video => raw_delay = raw_delay * 3 / 2,
            _ => {}
        }
        self.min_delay = min_delay;
        self.base_delay = min_delay.max(max_delay.min(raw_delay));

        let mut rs = AUTO_REFRESH_SPEED;
        let mut rq = AUTO_REFRESH_QUALITY as i64;
        let bits_per_pixel = bandwidth_limit as f64 / (1 + ww as u64 * wh as u64) as f64;
        if current_quality < 70 && (cv > 0.1 || (bandwidth_limit > 0 && bits_per_pixel < 1.0)) {
            // bandwidth is scarce: almost-lossless instead of lossless
            rs = AUTO_REFRESH_SPEED / 2;
            let mut q = 100.0 - cv * 10.0;
            if bandwidth_limit > 0 {
                q -= ((1_000_000 / bandwidth_limit) as f64).sqrt();
            }
            rs = rs.min(50);
            rq = (q as i64).max(80).max(current_quality as i64 + 30).min(99);
        }
        debug!(
            min_delay = self.min_delay,
            base_delay = self.base_delay,
            quality = rq,
            speed = rs,
            cv,
            "refresh attributes updated"
        );
        self.quality = rq as u8;
        self.speed = rs;
    }

    // ── Scheduling ───────────────────────────────────────────────

    /// New damage below the refresh quality bar pushes a pending
    /// refresh further out: no point refreshing pixels about to be
    /// repainted lossy again.
    #[allow(clippy::too_many_arguments)]
    pub fn note_damage_overlap(
        &mut self,
        now: Instant,
        ww: u32,
        wh: u32,
        damage_quality: Option<u8>,
        current_quality: u8,
        congestion_value: f64,
    ) {
        if !self.timer_armed || damage_quality.unwrap_or(current_quality) >= self.quality {
            return;
        }
        let overlap = total_pixels(&self.regions);
        if overlap == 0 || ww == 0 || wh == 0 {
            return;
        }
        let pct = ((100 * overlap / (ww as u64 * wh as u64)).min(100) as f64
            * (1.0 + congestion_value)) as u64;
        let sched = self.min_delay.max(self.base_delay * pct / 100);
        let pushed = now + Duration::from_millis(sched);
        self.target_time = Some(self.target_time.map_or(pushed, |t| t.max(pushed)));
    }

    /// Hold a pending refresh back to at least `until`: a refresh right
    /// after a congestion event would only feed the congestion.
    pub fn hold_back(&mut self, until: Instant) {
        if let Some(t) = self.target_time {
            self.target_time = Some(t.max(until));
        }
    }

    /// Account for one sent packet and decide what the timer should
    /// do. Lossless packets shrink the pending set; lossy ones grow it
    /// and schedule (or push out) the refresh.
    #[allow(clippy::too_many_arguments)]
    pub fn note_packet(
        &mut self,
        now: Instant,
        encoding: Encoding,
        client_options: &Map<String, Value>,
        region: Rectangle,
        auto_refresh: bool,
        ww: u32,
        wh: u32,
        congestion_value: f64,
        batch_delay: f64,
    ) -> RefreshAction {
        let lossy = if encoding.is_lossless() {
            false
        } else {
            let actual_quality = client_options
                .get(options::QUALITY)
                .and_then(Value::as_u64)
                .unwrap_or(0) as u8;
            let csc_lossy = client_options
                .get(options::CSC)
                .and_then(Value::as_str)
                .is_some_and(|s| matches!(s, "YUV420P" | "YUV422P"));
            actual_quality < self.quality
                || csc_lossy
                || client_options.contains_key(options::SCALED_SIZE)
        };

        if !lossy || auto_refresh {
            remove_rectangle(&mut self.regions, region);
            if !self.timer_armed {
                return RefreshAction::Keep;
            }
            if self.regions.is_empty() {
                debug!("covered all regions that needed a refresh, cancelling timer");
                self.timer_armed = false;
                self.event_time = None;
                self.target_time = None;
                return RefreshAction::Cancel;
            }
            return RefreshAction::Keep;
        }

        if ww == 0 || wh == 0 {
            self.timer_armed = false;
            return RefreshAction::Cancel;
        }
        let window_pixcount = ww as u64 * wh as u64;
        let region_pixcount = region.pixel_count();
        let before = total_pixels(&self.regions);
        add_rectangle(&mut self.regions, region);
        let added_pixcount = total_pixels(&self.regions) - before;
        let mut pct = 100 * region_pixcount / window_pixcount;
        if pct == 100 {
            // everything was repainted, start the clock fresh
            self.timer_armed = false;
        }

        if !self.timer_armed {
            if region_pixcount == 0 || self.regions.is_empty() {
                return RefreshAction::Keep;
            }
            self.event_time = Some(now);
            // congestion slows the first trigger down
            let mult = ((pct as f64 * (1.0 + congestion_value)).sqrt() / 10.0).floor();
            let sched = (batch_delay * 5.0)
                .max(self.min_delay as f64)
                .max((self.base_delay as f64 * mult).floor()) as u64;
            self.target_time = Some(now + Duration::from_millis(sched));
            self.timer_armed = true;
            debug!(sched, pct, "scheduling refresh");
            return RefreshAction::Schedule(sched);
        }

        // a refresh is already due: only ever push the target later
        let due_pixcount = total_pixels(&self.regions);
        if added_pixcount >= due_pixcount / 2 {
            pct = 100 * due_pixcount / window_pixcount;
        }
        // no sqrt here, so small updates after big ones cannot move
        // the target forward
        let sched = (batch_delay * 5.0)
            .max(self.min_delay as f64)
            .max((self.base_delay as f64 * pct as f64 / 100.0).floor()) as u64;
        let max_time = self.event_time.unwrap_or(now) + Duration::from_millis(5 * self.base_delay);
        let target = self.target_time.unwrap_or(now);
        self.target_time =
            Some(max_time.min(target.max(now + Duration::from_millis(sched))));
        RefreshAction::Keep
    }

    /// The armed timer fired: refresh now, re-arm, or stand down.
    pub fn on_timer_fire(&mut self, now: Instant) -> TimerFire {
        self.timer_armed = false;
        if self.event_time.is_none() {
            return TimerFire::Idle;
        }
        let target = match self.target_time {
            Some(t) => t,
            None => now,
        };
        if target > now + FIRE_SLACK {
            let remaining = target.duration_since(now).as_millis() as u64;
            self.timer_armed = true;
            return TimerFire::ReArm(remaining);
        }
        self.event_time = None;
        self.target_time = None;
        let regions = std::mem::take(&mut self.regions);
        if regions.is_empty() {
            return TimerFire::Idle;
        }
        TimerFire::Refresh(regions)
    }

    // ── Refresh encoding ─────────────────────────────────────────

    /// Pick the encoding for one refresh rectangle.
    ///
    /// A degraded (sub-100) refresh on a 24/32-bit window prefers the
    /// cheap lossy codecs; otherwise the regular selector runs with
    /// the refresh quality/speed, constrained to the refresh set.
    pub fn refresh_encoding(
        &self,
        w: u32,
        h: u32,
        refresh_encodings: &[Encoding],
        image_depth: u8,
        selector: &Selector,
    ) -> Encoding {
        if self.quality < 100 && matches!(image_depth, 24 | 32) {
            for e in [Encoding::Jpeg, Encoding::Webp] {
                if refresh_encodings.contains(&e) {
                    return e;
                }
            }
        }
        let previous = refresh_encodings.first().copied();
        let best = selector.select(w, h, self.quality, self.speed, previous);
        if refresh_encodings.contains(&best) {
            best
        } else {
            previous.unwrap_or(best)
        }
    }
}

/// The options every refresh send carries: lossless-grade quality and
/// a marker so the refresh can never trigger another refresh.
pub fn refresh_options() -> crate::window::batch::DamageOptions {
    crate::window::batch::DamageOptions {
        quality: Some(AUTO_REFRESH_QUALITY),
        speed: Some(AUTO_REFRESH_SPEED),
        auto_refresh: true,
        ..Default::default()
    }
}

// ── Tests ────────────────────────────────────────────────────────
