//! The per-window control loop.
//!
//! One [`WindowScheduler`] task owns all mutable state for a window:
//! the delayed region, the adaptive batch delay, quality/speed tuning,
//! the encoding selector, refresh scheduling and the ack table. Damage
//! events, client acks and transport progress all arrive over channels
//! and are processed here, single-threaded; the only work done off
//! this task is pixel encoding, which runs in the paired
//! [`EncodeWorker`].
//!
//! Cancellation is cooperative: the scheduler publishes a watermark of
//! the highest cancelled capture sequence and the worker checks it
//! before and after each compression. A packet that survives the
//! post-encode check is always delivered.
//!
//! Connection-wide statistics are shared behind a mutex. The lock is
//! taken around short synchronous sections only and is always released
//! before queueing encode work: the work channel is bounded, so that
//! send blocks for as long as the transport does, and a stalled
//! transport must only ever stall its own window.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::capability::{ClientCapabilities, CodecRegistry};
use crate::encoding::{Encoding, PREFERRED_ORDER, REFRESH_ORDER, common_encodings};
use crate::error::BlitError;
use crate::flags::ClientFlags;
use crate::geometry::{Rectangle, add_rectangle, total_pixels};
use crate::pixels::Capture;
use crate::stats::{GlobalStats, WindowStats, age_secs};
use crate::timers::{TimerHandle, Timers};
use crate::transport::{PacketSink, SendProgress};
use crate::window::ack::{AckTracker, AckVerdict};
use crate::window::batch::{
    BatchConfig, DamageOptions, DelayedRegion, LOCKED_BATCH_DELAY, MAX_SOFT_EXPIRED,
    calculate_batch_delay,
};
use crate::window::encode::{EncodeWork, EncodeWorker, WorkerEvent};
use crate::window::merge::{MergeConfig, plan_regions};
use crate::window::pipeline::ScoreTargets;
use crate::window::refresh::{
    MIN_AUTO_REFRESH_DELAY, RefreshAction, RefreshState, TimerFire, refresh_options,
};
use crate::window::select::{ContentType, EncodingChoice, Selector};
use crate::window::tuning::Tuning;

/// Windows larger than this on either axis are refused outright.
pub const MAX_WINDOW_DIM: u32 = 16_384;

/// Damage covering at least this many pixels (or a quarter of the
/// window) makes a pending refresh pointless.
const LARGE_DAMAGE_PIXELS: u64 = 512 * 1024;

/// Recheck interval while the bandwidth budget is spent (ms).
const BANDWIDTH_RECHECK_DELAY: f64 = 50.0;

/// Encode backlog still considered drainable, in queued work items.
const MAX_ENCODE_ITEMS: usize = 10;

// ── Commands ─────────────────────────────────────────────────────

/// Everything the outside world may ask of a running scheduler.
///
/// All of these are marshalled onto the control task; none of the
/// scheduler's state is touched from the caller's context.
#[derive(Debug)]
pub enum WindowCommand {
    /// A rectangle of the window changed.
    Damage {
        rect: Rectangle,
        options: DamageOptions,
    },
    /// The client acknowledged a draw packet. Negative `decode_time_us`
    /// values are client-side error codes.
    Ack {
        sequence: u64,
        width: u32,
        height: u32,
        decode_time_us: i64,
        message: String,
    },
    /// Stop producing packets; pending work is cancelled.
    Suspend,
    /// Resume after [`Suspend`](WindowCommand::Suspend); repaints the
    /// whole window since anything may have changed meanwhile.
    Resume,
    /// Pin the batch delay. `None` applies the default locked delay.
    LockBatchDelay(Option<f64>),
    /// Restore the adaptive delay saved by the lock.
    UnlockBatchDelay,
    /// Drop the delayed region and cancel all queued encode work.
    CancelDamage,
    SetClient(Box<ClientCapabilities>),
    SetContent(ContentType),
    SetEncoding(EncodingChoice),
    SetQuality { fixed: Option<u8>, min: u8 },
    SetSpeed { fixed: Option<u8>, min: u8 },
    SetBandwidthLimit(u64),
    SetFocus(bool),
    Resize { width: u32, height: u32 },
    Info(oneshot::Sender<SchedulerInfo>),
    Stop,
}

/// Timer roles multiplexed onto the scheduler's single timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerToken {
    /// The delayed region's batch delay ran out.
    Expire,
    /// A soft-expiry deferral ran out.
    SoftExpire,
    /// Re-run the dispatch gates (bandwidth or encode backlog).
    MaySend,
    /// The auto-refresh target time arrived.
    Refresh,
    /// The delayed region has been stuck past the hard limit.
    HardTimeout,
    /// Debounce delay after a client decode error ran out.
    DecodeErrorRefresh,
}

// ── Configuration and info ───────────────────────────────────────

/// Construction-time settings for one window's scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub wid: u32,
    pub width: u32,
    pub height: u32,
    /// Bit depth of the captured pixels.
    pub image_depth: u8,
    pub has_focus: bool,
    pub encoding: EncodingChoice,
    /// Encodings this server can produce.
    pub server_encodings: Vec<Encoding>,
    /// Base auto-refresh delay in ms; zero disables refreshes.
    pub auto_refresh_delay: u64,
    /// Bits per second; zero means unlimited.
    pub bandwidth_limit: u64,
    /// Client-reported transport jitter (ms).
    pub ack_jitter: u64,
    pub merge: MergeConfig,
    /// Encode work items the worker may hold before damage dispatch
    /// blocks.
    pub work_queue: usize,
    pub command_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wid: 1,
            width: 1024,
            height: 768,
            image_depth: 24,
            has_focus: false,
            encoding: EncodingChoice::Auto,
            server_encodings: PREFERRED_ORDER.to_vec(),
            auto_refresh_delay: 150,
            bandwidth_limit: 0,
            ack_jitter: 0,
            merge: MergeConfig::default(),
            work_queue: 16,
            command_queue: 128,
        }
    }
}

/// Point-in-time snapshot of a scheduler, for diagnostics.
#[derive(Debug, Clone)]
pub struct SchedulerInfo {
    pub wid: u32,
    pub dimensions: (u32, u32),
    pub suspended: bool,
    /// Capture sequence of the last dispatched work item.
    pub sequence: u64,
    pub packet_count: u64,
    pub damage_events: u64,
    pub batch_delay: f64,
    pub batch_locked: bool,
    pub quality: u8,
    pub speed: u8,
    pub congestion_value: f64,
    pub soft_expired: u32,
    pub acks_pending: usize,
    pub encode_pending: usize,
    /// Pixels still waiting for a lossless repaint.
    pub refresh_pixels: u64,
    /// `(packets, bytes)` sent per encoding.
    pub encoding_totals: HashMap<Encoding, (u64, u64)>,
}

// ── Handle ───────────────────────────────────────────────────────

/// Cloneable front door to a running [`WindowScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<WindowCommand>,
}

impl SchedulerHandle {
    pub async fn damage(&self, rect: Rectangle, options: DamageOptions) -> Result<(), BlitError> {
        self.send(WindowCommand::Damage { rect, options }).await
    }

    pub async fn ack(
        &self,
        sequence: u64,
        width: u32,
        height: u32,
        decode_time_us: i64,
        message: String,
    ) -> Result<(), BlitError> {
        self.send(WindowCommand::Ack {
            sequence,
            width,
            height,
            decode_time_us,
            message,
        })
        .await
    }

    pub async fn suspend(&self) -> Result<(), BlitError> {
        self.send(WindowCommand::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), BlitError> {
        self.send(WindowCommand::Resume).await
    }

    pub async fn lock_batch_delay(&self, delay: Option<f64>) -> Result<(), BlitError> {
        self.send(WindowCommand::LockBatchDelay(delay)).await
    }

    pub async fn unlock_batch_delay(&self) -> Result<(), BlitError> {
        self.send(WindowCommand::UnlockBatchDelay).await
    }

    pub async fn cancel_damage(&self) -> Result<(), BlitError> {
        self.send(WindowCommand::CancelDamage).await
    }

    pub async fn set_client(&self, client: ClientCapabilities) -> Result<(), BlitError> {
        self.send(WindowCommand::SetClient(Box::new(client))).await
    }

    pub async fn set_content(&self, content: ContentType) -> Result<(), BlitError> {
        self.send(WindowCommand::SetContent(content)).await
    }

    pub async fn set_encoding(&self, choice: EncodingChoice) -> Result<(), BlitError> {
        self.send(WindowCommand::SetEncoding(choice)).await
    }

    pub async fn set_quality(&self, fixed: Option<u8>, min: u8) -> Result<(), BlitError> {
        self.send(WindowCommand::SetQuality { fixed, min }).await
    }

    pub async fn set_speed(&self, fixed: Option<u8>, min: u8) -> Result<(), BlitError> {
        self.send(WindowCommand::SetSpeed { fixed, min }).await
    }

    pub async fn set_bandwidth_limit(&self, limit: u64) -> Result<(), BlitError> {
        self.send(WindowCommand::SetBandwidthLimit(limit)).await
    }

    pub async fn set_focus(&self, focused: bool) -> Result<(), BlitError> {
        self.send(WindowCommand::SetFocus(focused)).await
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<(), BlitError> {
        self.send(WindowCommand::Resize { width, height }).await
    }

    /// Snapshot the scheduler's state.
    pub async fn info(&self) -> Result<SchedulerInfo, BlitError> {
        let (tx, rx) = oneshot::channel();
        self.send(WindowCommand::Info(tx)).await?;
        rx.await.map_err(|_| BlitError::ChannelClosed)
    }

    /// Ask the scheduler to shut down. Idempotent.
    pub async fn stop(&self) {
        let _ = self.commands.send(WindowCommand::Stop).await;
    }

    async fn send(&self, command: WindowCommand) -> Result<(), BlitError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BlitError::ChannelClosed)
    }
}

// ── Scheduler ────────────────────────────────────────────────────

/// Drives one window's damage through batching, encoding and delivery.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tokio::sync::Mutex;
/// # use blit_core::capability::{ClientCapabilities, CodecRegistry};
/// # use blit_core::stats::GlobalStats;
/// # use blit_core::window::scheduler::{SchedulerConfig, WindowScheduler};
/// # fn capture() -> Box<dyn blit_core::pixels::Capture> { unimplemented!() }
/// # fn sink() -> Arc<dyn blit_core::transport::PacketSink> { unimplemented!() }
/// # async fn start() {
/// let registry = CodecRegistry::builder().build();
/// let global = Arc::new(Mutex::new(GlobalStats::new()));
/// let (scheduler, handle) = WindowScheduler::new(
///     SchedulerConfig::default(),
///     capture(),
///     registry,
///     ClientCapabilities::default(),
///     sink(),
///     global,
/// );
/// tokio::spawn(scheduler.run());
/// # }
/// ```
pub struct WindowScheduler {
    wid: u32,
    dimensions: (u32, u32),
    image_depth: u8,
    has_focus: bool,
    suspended: bool,
    mmap_active: bool,
    /// One oversize warning per window, reset when the size recovers.
    oversize_warned: bool,
    content: ContentType,
    bandwidth_limit: u64,
    server_encodings: Vec<Encoding>,

    capture: Box<dyn Capture>,
    client: ClientCapabilities,
    /// Connection-wide statistics. Locked briefly inside handlers,
    /// never held across the bounded work-channel send.
    global: Arc<Mutex<GlobalStats>>,

    batch: BatchConfig,
    merge: MergeConfig,
    tuning: Tuning,
    selector: Selector,
    refresh: RefreshState,
    ack: AckTracker,
    stats: WindowStats,

    delayed: Option<DelayedRegion>,
    /// Target delay computed when the delayed region was created (ms).
    region_delay: f64,
    soft_expired: u32,
    /// Capture sequence, bumped per dispatched work item.
    sequence: u64,
    last_encoding: Option<Encoding>,
    /// Shared with the worker; sequences at or below are cancelled.
    cancel: Arc<AtomicU64>,

    timers: Timers<TimerToken>,
    expire_timer: Option<TimerHandle>,
    soft_timer: Option<TimerHandle>,
    recheck_timer: Option<TimerHandle>,
    timeout_timer: Option<TimerHandle>,
    refresh_timer: Option<TimerHandle>,
    decode_refresh_timer: Option<TimerHandle>,

    commands: mpsc::Receiver<WindowCommand>,
    work: mpsc::Sender<EncodeWork>,
    events: mpsc::Receiver<WorkerEvent>,
    progress: mpsc::Receiver<SendProgress>,
    /// Spawned on the first call to [`run`](Self::run).
    worker: Option<EncodeWorker>,
}

impl WindowScheduler {
    pub fn new(
        config: SchedulerConfig,
        capture: Box<dyn Capture>,
        registry: Arc<CodecRegistry>,
        client: ClientCapabilities,
        sink: Arc<dyn PacketSink>,
        global: Arc<Mutex<GlobalStats>>,
    ) -> (Self, SchedulerHandle) {
        let now = Instant::now();
        let (command_tx, command_rx) = mpsc::channel(config.command_queue.max(1));
        let (work_tx, work_rx) = mpsc::channel(config.work_queue.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.work_queue.max(1) * 4);
        let (progress_tx, progress_rx) = mpsc::channel(config.work_queue.max(1) * 4);
        let cancel = Arc::new(AtomicU64::new(0));
        let worker = EncodeWorker::new(
            config.wid,
            registry,
            client.clone(),
            sink,
            cancel.clone(),
            work_rx,
            event_tx,
            progress_tx,
        );
        let common = common_encodings(PREFERRED_ORDER, &client.encodings, &config.server_encodings);
        let mut scheduler = Self {
            wid: config.wid,
            dimensions: (config.width, config.height),
            image_depth: config.image_depth,
            has_focus: config.has_focus,
            suspended: false,
            mmap_active: false,
            oversize_warned: false,
            content: ContentType::Unknown,
            bandwidth_limit: config.bandwidth_limit,
            server_encodings: config.server_encodings,
            capture,
            client,
            global,
            batch: BatchConfig::new(),
            merge: config.merge,
            tuning: Tuning::new(),
            selector: Selector::new(config.encoding, common),
            refresh: RefreshState::new(config.auto_refresh_delay),
            ack: AckTracker::new(config.wid, config.ack_jitter, now),
            stats: WindowStats::new(),
            delayed: None,
            region_delay: 0.0,
            soft_expired: 0,
            sequence: 0,
            last_encoding: None,
            cancel,
            timers: Timers::new(),
            expire_timer: None,
            soft_timer: None,
            recheck_timer: None,
            timeout_timer: None,
            refresh_timer: None,
            decode_refresh_timer: None,
            commands: command_rx,
            work: work_tx,
            events: event_rx,
            progress: progress_rx,
            worker: Some(worker),
        };
        scheduler.apply_client();
        (scheduler, SchedulerHandle {
            commands: command_tx,
        })
    }

    /// Run until [`SchedulerHandle::stop`] or until every handle is
    /// dropped. Consumes the scheduler; spawn it.
    pub async fn run(mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }
        debug!(wid = self.wid, "window scheduler running");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(WindowCommand::Stop) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                token = self.timers.expired() => self.handle_timer(token).await,
                event = self.events.recv() => {
                    match event {
                        None => break,
                        Some(event) => self.handle_worker_event(event).await,
                    }
                }
                progress = self.progress.recv() => {
                    if let Some(progress) = progress {
                        self.handle_progress(progress).await;
                    }
                }
            }
        }
        self.cancel_damage();
        self.timers.clear();
        debug!(wid = self.wid, "window scheduler stopped");
    }

    // ── Command handling ─────────────────────────────────────────

    async fn handle_command(&mut self, command: WindowCommand) {
        let now = Instant::now();
        match command {
            WindowCommand::Damage { rect, options } => {
                self.damage(now, rect, options).await;
            }
            WindowCommand::Ack {
                sequence,
                width,
                height,
                decode_time_us,
                message,
            } => {
                self.handle_ack(now, sequence, width, height, decode_time_us, &message)
                    .await;
            }
            WindowCommand::Suspend => {
                debug!(wid = self.wid, "suspending");
                self.suspended = true;
                self.cancel_damage();
            }
            WindowCommand::Resume => {
                debug!(wid = self.wid, "resuming, repainting everything");
                self.suspended = false;
                self.full_refresh(now).await;
            }
            WindowCommand::LockBatchDelay(delay) => {
                self.batch.lock(delay.unwrap_or(LOCKED_BATCH_DELAY));
            }
            WindowCommand::UnlockBatchDelay => self.batch.unlock(),
            WindowCommand::CancelDamage => self.cancel_damage(),
            WindowCommand::SetClient(client) => {
                self.client = *client;
                self.apply_client();
            }
            WindowCommand::SetContent(content) => self.content = content,
            WindowCommand::SetEncoding(choice) => {
                self.selector.choice = choice;
                self.selector.rebuild();
            }
            WindowCommand::SetQuality { fixed, min } => {
                self.tuning.fixed_quality = fixed;
                self.tuning.min_quality = min;
            }
            WindowCommand::SetSpeed { fixed, min } => {
                self.tuning.fixed_speed = fixed;
                self.tuning.min_speed = min;
            }
            WindowCommand::SetBandwidthLimit(limit) => self.bandwidth_limit = limit,
            WindowCommand::SetFocus(focused) => self.has_focus = focused,
            WindowCommand::Resize { width, height } => {
                self.dimensions = (width, height);
                self.stats.last_resized = Some(now);
                if width <= MAX_WINDOW_DIM && height <= MAX_WINDOW_DIM {
                    self.oversize_warned = false;
                }
                self.selector.window_area = width as u64 * height as u64;
                self.selector.rebuild();
            }
            WindowCommand::Info(reply) => {
                let global = self.global.clone().lock_owned().await;
                let _ = reply.send(self.info(&global));
            }
            WindowCommand::Stop => {}
        }
    }

    /// Push the client's capabilities into the selector.
    ///
    /// The worker keeps the codec-side copy it was built with; only
    /// selection-side attributes change at runtime.
    fn apply_client(&mut self) {
        self.mmap_active = self.client.flags.contains(ClientFlags::SHARED_MEMORY);
        self.selector.common = common_encodings(
            PREFERRED_ORDER,
            &self.client.encodings,
            &self.server_encodings,
        );
        self.selector.client_depth = self.client.depth;
        self.selector.depth = self.image_depth;
        self.selector.want_alpha =
            self.client.flags.contains(ClientFlags::ALPHA) && self.image_depth == 32;
        self.selector.strict = self.client.flags.contains(ClientFlags::STRICT);
        self.selector.mmap_active = self.mmap_active;
        let (ww, wh) = self.dimensions;
        self.selector.window_area = ww as u64 * wh as u64;
        if self.client.flags.contains(ClientFlags::GRAYSCALE)
            && matches!(self.selector.choice, EncodingChoice::Auto)
        {
            self.selector.choice = EncodingChoice::Grayscale;
        }
        self.selector.rebuild();
    }

    // ── Damage intake ────────────────────────────────────────────

    async fn damage(&mut self, now: Instant, rect: Rectangle, options: DamageOptions) {
        let immediate = {
            let mut global = self.global.clone().lock_owned().await;
            self.note_damage(now, rect, options, &mut global)
        };
        if let Some((rect, options)) = immediate {
            self.send_regions(now, now, vec![rect], options.encoding, options)
                .await;
        }
    }

    /// Record one damage event and decide its fate: drop, merge into
    /// the delayed region, start batching, or (`Some`) send right away.
    fn note_damage(
        &mut self,
        now: Instant,
        rect: Rectangle,
        options: DamageOptions,
        global: &mut GlobalStats,
    ) -> Option<(Rectangle, DamageOptions)> {
        if self.suspended {
            debug!(wid = self.wid, "suspended, ignoring damage");
            return None;
        }
        let (ww, wh) = self.dimensions;
        if ww == 0 || wh == 0 {
            return None;
        }
        if ww > MAX_WINDOW_DIM || wh > MAX_WINDOW_DIM {
            if !self.oversize_warned {
                self.oversize_warned = true;
                warn!(
                    wid = self.wid,
                    width = ww,
                    height = wh,
                    "window dimensions out of range, dropping damage"
                );
            }
            return None;
        }
        let full = Rectangle::new(0, 0, ww as i32, wh as i32);
        let rect = if self.merge.full_frames_only {
            full
        } else {
            rect.intersection(&full)?
        };
        if rect.is_empty() {
            return None;
        }
        global.damage_events_count += 1;
        // the batching heuristics want the previous event's time
        let previous_event = self.stats.last_damage_event_time;
        self.stats.record_damage_event(now, rect);

        if !options.auto_refresh && self.refresh_timer.is_some() {
            let pixels = rect.pixel_count();
            if pixels * 4 >= full.pixel_count() || pixels >= LARGE_DAMAGE_PIXELS {
                // most of the window is being repainted anyway
                debug!(wid = self.wid, pixels, "large damage, dropping pending refresh");
                self.refresh.clear();
                self.clear_refresh_timer();
            }
        }
        self.refresh.note_damage_overlap(
            now,
            ww,
            wh,
            options.quality,
            self.tuning.current_quality,
            global.congestion_value,
        );

        if let Some(region) = self.delayed.as_mut() {
            options.merge_into(&mut region.options);
            if region.encoding.is_none() {
                region.encoding = options.encoding;
            }
            add_rectangle(&mut region.regions, rect);
            if region.regions.len() > self.merge.max_small_regions {
                region.regions = vec![full];
            }
            return None;
        }

        let seconds_since_congestion = global.seconds_since_congestion(now);
        let (_, encode_items) = self.stats.get_pixels_encoding_backlog();
        let delay = self.batch.compute_delay(
            now,
            &options,
            self.stats.last_resized,
            seconds_since_congestion,
            encode_items,
        );
        self.batch.record_delay(now, delay);

        let events_in_unit = self
            .stats
            .last_damage_events
            .iter()
            .filter(|&&(when, _)| age_secs(now, when) < self.batch.time_unit)
            .count();
        let pixels_in_unit = self.stats.get_damage_pixels(now, self.batch.time_unit);
        if let Some(ratio) = self.batch.apply_damage_storm(events_in_unit, pixels_in_unit) {
            debug!(
                wid = self.wid,
                ratio,
                delay = self.batch.delay,
                "damage storm, forcing batching"
            );
        }

        let must = self.batch.must_batch(
            now,
            delay,
            self.batch.locked,
            self.bandwidth_limit,
            seconds_since_congestion,
            previous_event,
        );
        if !must && self.backlog_clear(now, global) {
            self.batch.last_event = Some(now);
            self.batch.record_actual_delay(now, 0.0);
            return Some((rect, options));
        }

        self.region_delay = delay.max(self.batch.min_delay);
        self.delayed = Some(DelayedRegion::new(now, rect, options.encoding, options));
        self.soft_expired = 0;
        let expire = self.batch.expire_delay_for(now, self.region_delay);
        self.clear_region_timers();
        self.expire_timer = Some(self.timers.schedule(millis(expire), TimerToken::Expire));
        debug!(wid = self.wid, delay = self.region_delay, expire, "damage batched");
        None
    }

    /// Nothing queued anywhere: an immediate send cannot add latency.
    fn backlog_clear(&self, now: Instant, global: &GlobalStats) -> bool {
        if self.stats.get_packets_backlog(now, self.ack_tolerance(now, global)) > 0 {
            return false;
        }
        let (pixels, items) = self.stats.get_pixels_encoding_backlog();
        let (ww, wh) = self.dimensions;
        pixels < ww as u64 * wh as u64 && items <= MAX_ENCODE_ITEMS
    }

    /// Unacked packets tolerated before the backlog counts as real:
    /// grows with the window's life and shrinks after congestion.
    fn ack_tolerance(&self, now: Instant, global: &GlobalStats) -> u32 {
        let seconds = global.seconds_since_congestion(now).min(10.0);
        (self.sequence.min(10) as f64 * seconds) as u32
    }

    // ── Delayed-region dispatch ──────────────────────────────────

    /// Run the dispatch gates for the expired delayed region, sending
    /// it or scheduling the next attempt.
    async fn may_send_delayed(&mut self, now: Instant) {
        let dispatch = {
            let mut global = self.global.clone().lock_owned().await;
            self.dispatch_gates(now, &mut global)
        };
        if dispatch {
            self.send_delayed(now).await;
        }
    }

    /// True when the delayed region should go out now; otherwise the
    /// next attempt has been scheduled.
    fn dispatch_gates(&mut self, now: Instant, global: &mut GlobalStats) -> bool {
        let Some(region) = self.delayed.as_ref() else {
            return false;
        };
        if !region.expired {
            return false;
        }
        let elapsed_ms = age_secs(now, region.damage_time) * 1000.0;
        if self.batch.locked {
            // a locked delay is a deadline, not a hint
            if elapsed_ms < self.batch.delay {
                self.schedule_recheck(self.batch.delay - elapsed_ms);
                return false;
            }
            return true;
        }
        let backlog = self
            .stats
            .get_packets_backlog(now, self.ack_tolerance(now, global));
        if backlog > 0 {
            if self.soft_expired < MAX_SOFT_EXPIRED {
                self.soft_expired += 1;
                let defer = self.soft_expired as f64 * self.region_delay;
                debug!(
                    wid = self.wid,
                    backlog,
                    deferral = self.soft_expired,
                    defer,
                    "client backlog, deferring delayed region"
                );
                if let Some(handle) = self.soft_timer.take() {
                    self.timers.cancel(handle);
                }
                self.soft_timer = Some(self.timers.schedule(millis(defer), TimerToken::SoftExpire));
            } else {
                // the ladder is exhausted; if the link was congested
                // recently this deferral is itself evidence
                let seconds = global.seconds_since_congestion(now);
                if seconds < 10.0 {
                    let late_pct = 200.0 * self.soft_expired as f64;
                    global.record_congestion_event(now, "soft-expire", late_pct, 0.0);
                }
                if self.timeout_timer.is_none() {
                    let remaining = (self.batch.timeout_delay - elapsed_ms).max(0.0);
                    debug!(wid = self.wid, remaining, "deferral limit reached, arming hard timeout");
                    self.timeout_timer =
                        Some(self.timers.schedule(millis(remaining), TimerToken::HardTimeout));
                }
            }
            return false;
        }
        if self.bandwidth_limit > 0 {
            let used = self.stats.get_bits_encoded(now, 1.0);
            if used >= self.bandwidth_limit {
                debug!(
                    wid = self.wid,
                    used,
                    limit = self.bandwidth_limit,
                    "bandwidth budget spent, rechecking shortly"
                );
                self.schedule_recheck(BANDWIDTH_RECHECK_DELAY);
                return false;
            }
        }
        let (pixels, items) = self.stats.get_pixels_encoding_backlog();
        let (ww, wh) = self.dimensions;
        if pixels >= ww as u64 * wh as u64 || items > MAX_ENCODE_ITEMS {
            let recheck = (elapsed_ms / 10.0).clamp(10.0, self.batch.max_delay);
            debug!(wid = self.wid, pixels, items, recheck, "encode backlog, rechecking later");
            self.schedule_recheck(recheck);
            return false;
        }
        true
    }

    async fn send_delayed(&mut self, now: Instant) {
        let Some(region) = self.delayed.take() else {
            return;
        };
        self.clear_region_timers();
        self.soft_expired = 0;
        let actual = age_secs(now, region.damage_time) * 1000.0;
        self.batch.record_actual_delay(now, actual);
        self.batch.last_event = Some(now);
        debug!(
            wid = self.wid,
            rects = region.regions.len(),
            actual,
            "dispatching delayed region"
        );
        self.send_regions(
            region.damage_time,
            now,
            region.regions,
            region.encoding,
            region.options,
        )
        .await;
    }

    /// Plan, capture and queue the encode work for a region set.
    async fn send_regions(
        &mut self,
        damage_time: Instant,
        now: Instant,
        rects: Vec<Rectangle>,
        encoding: Option<Encoding>,
        options: DamageOptions,
    ) {
        let works = {
            let mut global = self.global.clone().lock_owned().await;
            self.plan_work(damage_time, now, rects, encoding, options, &mut global)
        };
        self.dispatch_work(works).await;
    }

    /// Plan, capture and account a region set, producing the encode
    /// work items to dispatch. Synchronous: runs under the stats lock.
    fn plan_work(
        &mut self,
        damage_time: Instant,
        now: Instant,
        rects: Vec<Rectangle>,
        encoding: Option<Encoding>,
        options: DamageOptions,
        global: &mut GlobalStats,
    ) -> Vec<EncodeWork> {
        let (ww, wh) = self.dimensions;
        if ww == 0 || wh == 0 || rects.is_empty() {
            return Vec::new();
        }
        self.recalculate(now, &options, global);
        let (quality, speed) = if options.auto_refresh {
            (self.refresh.quality, self.refresh.speed)
        } else {
            (self.tuning.current_quality, self.tuning.current_speed)
        };
        let previous = self.last_encoding;
        let override_encoding = encoding.filter(|e| self.selector.common.contains(e));
        let plan = {
            let selector = &self.selector;
            if options.auto_refresh {
                let refresh_encodings = self.refresh_encodings();
                let refresh = &self.refresh;
                let depth = self.image_depth;
                plan_regions(&self.merge, ww, wh, &rects, None, self.mmap_active, |w, h| {
                    refresh.refresh_encoding(w, h, &refresh_encodings, depth, selector)
                })
            } else if let Some(fixed) = override_encoding {
                plan_regions(&self.merge, ww, wh, &rects, None, self.mmap_active, |_, _| fixed)
            } else {
                plan_regions(&self.merge, ww, wh, &rects, None, self.mmap_active, |w, h| {
                    selector.select(w, h, quality, speed, previous)
                })
            }
        };
        if plan.is_empty() {
            return Vec::new();
        }
        // the plan is emitted in send order; the last packet flushes
        self.last_encoding = plan.last().map(|p| p.encoding);
        let targets = ScoreTargets {
            target_quality: quality,
            min_quality: self.tuning.min_quality,
            target_speed: speed,
            min_speed: self.tuning.min_speed,
        };
        let mut works = Vec::with_capacity(plan.len());
        for planned in plan {
            self.sequence += 1;
            let sequence = self.sequence;
            let rect = planned.rect;
            let Some(image) = self.capture.get_image(rect.x, rect.y, rect.w, rect.h) else {
                debug!(wid = self.wid, ?rect, "no image for damage rectangle");
                continue;
            };
            if self.cancel.load(Ordering::Acquire) >= sequence {
                continue;
            }
            self.stats
                .encoding_pending
                .insert(sequence, (damage_time, rect.w as u32, rect.h as u32));
            let (_, depth) = self.stats.get_pixels_encoding_backlog();
            global.record_work_queued(now, depth);
            works.push(EncodeWork {
                sequence,
                image,
                encoding: planned.encoding,
                damage_time,
                process_time: now,
                quality,
                speed,
                targets,
                auto_refresh: options.auto_refresh,
                flush: planned.flush,
            });
        }
        works
    }

    /// Hand planned work to the encode worker. The work channel is
    /// bounded and the worker drains it at transport speed, so this
    /// await runs with no locks held.
    async fn dispatch_work(&mut self, works: Vec<EncodeWork>) {
        let mut works = works.into_iter();
        while let Some(work) = works.next() {
            let sequence = work.sequence;
            if self.work.send(work).await.is_err() {
                warn!(wid = self.wid, "encode worker gone, dropping work");
                self.stats.encoding_pending.remove(&sequence);
                for rest in works {
                    self.stats.encoding_pending.remove(&rest.sequence);
                }
                return;
            }
        }
    }

    /// Refresh set: the client's preference, or derived from what both
    /// sides speak.
    fn refresh_encodings(&self) -> Vec<Encoding> {
        if !self.client.refresh_encodings.is_empty() {
            self.client.refresh_encodings.clone()
        } else {
            common_encodings(REFRESH_ORDER, &self.client.encodings, &self.server_encodings)
        }
    }

    // ── Tuning ───────────────────────────────────────────────────

    /// Refresh every derived control value before a send.
    fn recalculate(&mut self, now: Instant, options: &DamageOptions, global: &mut GlobalStats) {
        self.stats.update_averages(now);
        global.update_averages(now);
        if !self.batch.locked && !self.skip_recalculation(now) {
            calculate_batch_delay(
                self.wid,
                self.dimensions,
                self.has_focus,
                self.soft_expired,
                &mut self.batch,
                global,
                &mut self.stats,
                self.bandwidth_limit,
                self.mmap_active,
                now,
            );
        }
        if !options.auto_refresh {
            self.tuning.quality_hint = options.quality;
            self.tuning.speed_hint = options.speed;
        }
        self.tuning.update_speed(
            now,
            self.suspended,
            self.mmap_active,
            self.sequence,
            self.dimensions,
            &self.batch,
            global,
            &mut self.stats,
            self.bandwidth_limit,
        );
        self.tuning.update_quality(
            now,
            self.suspended,
            self.mmap_active,
            self.sequence,
            self.selector.choice.ignores_quality(),
            matches!(self.content, ContentType::Text),
            matches!(self.content, ContentType::Video),
            self.dimensions,
            &self.batch,
            global,
            &mut self.stats,
            self.bandwidth_limit,
        );
        self.tuning.quality_hint = None;
        self.tuning.speed_hint = None;
        self.selector.update_thresholds(
            self.tuning.current_speed,
            self.tuning.current_quality,
            self.stats.packet_count,
            global.congestion_value,
            self.bandwidth_limit,
            self.content,
            self.mmap_active,
        );
        let (ww, wh) = self.dimensions;
        self.refresh.update_attributes(
            self.mmap_active,
            ww,
            wh,
            global.congestion_value,
            self.tuning.current_quality,
            self.tuning.current_speed,
            self.batch.delay,
            self.bandwidth_limit,
            self.content,
        );
    }

    /// Whether the full factor recalculation would be wasted: the
    /// delay sits near its floor, nothing is backlogged and little has
    /// happened since the last run.
    fn skip_recalculation(&self, now: Instant) -> bool {
        let Some(last) = self.batch.last_updated else {
            return false;
        };
        if self.batch.delay > 2.0 * self.batch.min_delay {
            return false;
        }
        if self.stats.get_acks_pending() > 0 {
            return false;
        }
        let elapsed = age_secs(now, last);
        let encodes = self
            .stats
            .encoding_stats
            .iter()
            .rev()
            .take_while(|&&(when, ..)| age_secs(now, when) < elapsed)
            .count();
        if encodes < 5 {
            return true;
        }
        let (ww, wh) = self.dimensions;
        let frame = (ww as u64 * wh as u64).max(1);
        if self.stats.get_damage_pixels(now, elapsed) < frame {
            return true;
        }
        (self.stats.get_bits_encoded(now, elapsed) as f64) < 16_384.0 * 8.0 * elapsed
    }

    // ── Timers ───────────────────────────────────────────────────

    async fn handle_timer(&mut self, token: TimerToken) {
        let now = Instant::now();
        match token {
            TimerToken::Expire => {
                self.expire_timer = None;
                if let Some(region) = self.delayed.as_mut() {
                    region.expired = true;
                }
                self.may_send_delayed(now).await;
            }
            TimerToken::SoftExpire => {
                self.soft_timer = None;
                self.may_send_delayed(now).await;
            }
            TimerToken::MaySend => {
                self.recheck_timer = None;
                self.may_send_delayed(now).await;
            }
            TimerToken::Refresh => {
                self.refresh_timer = None;
                self.refresh_due(now).await;
            }
            TimerToken::HardTimeout => {
                self.timeout_timer = None;
                self.hard_timeout(now).await;
            }
            TimerToken::DecodeErrorRefresh => {
                self.decode_refresh_timer = None;
                debug!(wid = self.wid, "decode error debounce over, repainting losslessly");
                self.full_refresh(now).await;
            }
        }
    }

    /// The delayed region could not be delivered within the hard
    /// limit: give up on incremental updates and start over.
    async fn hard_timeout(&mut self, now: Instant) {
        let Some(region) = self.delayed.take() else {
            return;
        };
        let elapsed_ms = (age_secs(now, region.damage_time) * 1000.0) as u64;
        let stalled = BlitError::DelayedRegionStalled {
            sequence: self.sequence,
            elapsed_ms,
        };
        warn!(wid = self.wid, %stalled, "forcing a full repaint");
        self.cancel_damage();
        self.full_refresh(now).await;
    }

    async fn refresh_due(&mut self, now: Instant) {
        match self.refresh.on_timer_fire(now) {
            TimerFire::Idle => {}
            TimerFire::ReArm(ms) => {
                self.refresh_timer = Some(
                    self.timers
                        .schedule(Duration::from_millis(ms), TimerToken::Refresh),
                );
            }
            TimerFire::Refresh(regions) => {
                debug!(wid = self.wid, rects = regions.len(), "auto-refresh firing");
                self.send_regions(now, now, regions, None, refresh_options())
                    .await;
            }
        }
    }

    /// Repaint the whole window at refresh quality.
    async fn full_refresh(&mut self, now: Instant) {
        let (ww, wh) = self.dimensions;
        if ww == 0 || wh == 0 {
            return;
        }
        self.refresh.clear();
        self.clear_refresh_timer();
        let full = Rectangle::new(0, 0, ww as i32, wh as i32);
        self.damage(now, full, refresh_options()).await;
    }

    /// Cancel the delayed region and all encode work queued so far.
    fn cancel_damage(&mut self) {
        self.cancel.store(self.sequence, Ordering::Release);
        self.delayed = None;
        self.soft_expired = 0;
        self.clear_region_timers();
    }

    fn clear_region_timers(&mut self) {
        for handle in [
            self.expire_timer.take(),
            self.soft_timer.take(),
            self.recheck_timer.take(),
            self.timeout_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.timers.cancel(handle);
        }
    }

    fn clear_refresh_timer(&mut self) {
        if let Some(handle) = self.refresh_timer.take() {
            self.timers.cancel(handle);
        }
    }

    fn schedule_recheck(&mut self, delay_ms: f64) {
        if let Some(handle) = self.recheck_timer.take() {
            self.timers.cancel(handle);
        }
        self.recheck_timer = Some(self.timers.schedule(millis(delay_ms), TimerToken::MaySend));
    }

    fn apply_refresh_action(&mut self, action: RefreshAction) {
        match action {
            RefreshAction::Keep => {}
            RefreshAction::Cancel => self.clear_refresh_timer(),
            RefreshAction::Schedule(ms) => {
                self.clear_refresh_timer();
                self.refresh_timer = Some(
                    self.timers
                        .schedule(Duration::from_millis(ms), TimerToken::Refresh),
                );
            }
        }
    }

    // ── Worker events and transport progress ─────────────────────

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        let now = Instant::now();
        match event {
            WorkerEvent::Queued(report) => {
                let mut global = self.global.clone().lock_owned().await;
                self.ack.record_queued(
                    &mut self.stats,
                    now,
                    report.packet_sequence,
                    report.encoding,
                    report.rect,
                    report.damage_time,
                    report.process_time,
                    report.frame,
                    report.compressed_size,
                );
                self.stats.record_encode(
                    now,
                    report.encoding,
                    report.pixels,
                    report.bits_per_pixel,
                    report.compressed_size,
                    report.encode_secs,
                );
                global.packet_count += 1;
                let mut unsent = 0usize;
                let mut inflight = 0u64;
                for pending in self.stats.damage_ack_pending.values() {
                    if pending.end_send.is_none() {
                        unsent += 1;
                        inflight += pending.pixels;
                    }
                }
                global.record_packet_queued(now, unsent, self.wid, inflight);
                let (ww, wh) = self.dimensions;
                let action = self.refresh.note_packet(
                    now,
                    report.encoding,
                    &report.client_options,
                    report.rect,
                    report.auto_refresh,
                    ww,
                    wh,
                    global.congestion_value,
                    self.batch.delay,
                );
                self.apply_refresh_action(action);
            }
            WorkerEvent::Finished { sequence } => {
                self.stats.encoding_pending.remove(&sequence);
                // a drained encode queue may unblock the next dispatch
                self.may_send_delayed(now).await;
            }
        }
    }

    async fn handle_progress(&mut self, progress: SendProgress) {
        let now = Instant::now();
        match progress {
            SendProgress::Started { sequence, bytes } => {
                self.ack.send_started(&mut self.stats, now, sequence, bytes);
            }
            SendProgress::Completed { sequence, bytes } => {
                let mut global = self.global.clone().lock_owned().await;
                let slow = self.ack.send_completed(
                    &mut self.stats,
                    &mut global,
                    now,
                    sequence,
                    bytes,
                    self.bandwidth_limit,
                );
                if let Some(pending) = self.stats.damage_ack_pending.get(&sequence) {
                    global.record_sent_bytes(now, pending.bytes_sent());
                }
                drop(global);
                if slow {
                    self.hold_refresh_back(now);
                }
            }
            SendProgress::Failed { sequence } => {
                let repaint = {
                    let mut global = self.global.clone().lock_owned().await;
                    self.ack.send_failed(
                        &mut self.stats,
                        &mut global,
                        now,
                        sequence,
                        self.bandwidth_limit,
                    )
                };
                if let Some(rect) = repaint {
                    self.damage(now, rect, DamageOptions::default()).await;
                }
            }
        }
    }

    // ── Acks ─────────────────────────────────────────────────────

    async fn handle_ack(
        &mut self,
        now: Instant,
        sequence: u64,
        width: u32,
        height: u32,
        decode_time_us: i64,
        message: &str,
    ) {
        let verdict = {
            let mut global = self.global.clone().lock_owned().await;
            self.ack.acked(
                &mut self.stats,
                &mut global,
                now,
                sequence,
                width,
                height,
                decode_time_us,
                message,
                self.bandwidth_limit,
            )
        };
        match verdict {
            AckVerdict::Ok => {}
            AckVerdict::Congested => self.hold_refresh_back(now),
            AckVerdict::DecodeError { refresh_delay } => {
                if let Some(handle) = self.decode_refresh_timer.take() {
                    self.timers.cancel(handle);
                }
                self.decode_refresh_timer = Some(
                    self.timers
                        .schedule(refresh_delay, TimerToken::DecodeErrorRefresh),
                );
            }
        }
        // a drained client backlog may unblock the next dispatch
        self.may_send_delayed(now).await;
    }

    fn hold_refresh_back(&mut self, now: Instant) {
        let delay = self.refresh.base_delay.max(MIN_AUTO_REFRESH_DELAY);
        self.refresh.hold_back(now + Duration::from_millis(delay));
    }

    // ── Info ─────────────────────────────────────────────────────

    fn info(&self, global: &GlobalStats) -> SchedulerInfo {
        SchedulerInfo {
            wid: self.wid,
            dimensions: self.dimensions,
            suspended: self.suspended,
            sequence: self.sequence,
            packet_count: self.stats.packet_count,
            damage_events: self.stats.damage_events_count,
            batch_delay: self.batch.delay,
            batch_locked: self.batch.locked,
            quality: self.tuning.current_quality,
            speed: self.tuning.current_speed,
            congestion_value: global.congestion_value,
            soft_expired: self.soft_expired,
            acks_pending: self.stats.get_acks_pending(),
            encode_pending: self.stats.encoding_pending.len(),
            refresh_pixels: total_pixels(&self.refresh.regions),
            encoding_totals: self.stats.encoding_totals.clone(),
        }
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DrawPacket;
    use crate::pixels::{PixelFormat, WindowImage};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct TestCapture;

    impl Capture for TestCapture {
        fn get_image(&mut self, x: i32, y: i32, width: i32, height: i32) -> Option<WindowImage> {
            let stride = width as u32 * 4;
            let buffer = Bytes::from(vec![0u8; (stride * height as u32) as usize]);
            Some(WindowImage::packed(
                x,
                y,
                width as u32,
                height as u32,
                PixelFormat::Bgrx8,
                buffer,
                stride,
            ))
        }
    }

    struct NullSink;

    #[async_trait]
    impl PacketSink for NullSink {
        async fn queue_packet(
            &self,
            _packet: DrawPacket,
            _progress: mpsc::Sender<SendProgress>,
        ) -> Result<(), BlitError> {
            Ok(())
        }
    }

    fn scheduler_pair(width: u32, height: u32) -> (WindowScheduler, SchedulerHandle) {
        let config = SchedulerConfig {
            width,
            height,
            ..Default::default()
        };
        WindowScheduler::new(
            config,
            Box::new(TestCapture),
            CodecRegistry::builder().build(),
            ClientCapabilities::default(),
            Arc::new(NullSink),
            Arc::new(Mutex::new(GlobalStats::new())),
        )
    }

    fn rect(w: i32, h: i32) -> Rectangle {
        Rectangle::new(0, 0, w, h)
    }

    #[tokio::test]
    async fn first_damage_goes_out_immediately() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        s.damage(Instant::now(), rect(100, 100), DamageOptions::default())
            .await;
        assert!(s.delayed.is_none());
        assert_eq!(s.sequence, 1);
        assert!(s.stats.encoding_pending.contains_key(&1));
    }

    #[tokio::test]
    async fn rapid_damage_is_batched() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        let now = Instant::now();
        s.damage(now, rect(50, 50), DamageOptions::default()).await;
        // second event lands within min_delay of the first
        s.damage(now, rect(60, 60), DamageOptions::default()).await;
        let region = s.delayed.as_ref().unwrap();
        assert!(!region.expired);
        assert!(s.expire_timer.is_some());
        // further damage merges instead of creating a new region
        s.damage(now, Rectangle::new(100, 100, 20, 20), DamageOptions::default())
            .await;
        assert_eq!(s.delayed.as_ref().unwrap().regions.len(), 2);
    }

    #[tokio::test]
    async fn damage_dropped_while_suspended() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        s.suspended = true;
        s.damage(Instant::now(), rect(100, 100), DamageOptions::default())
            .await;
        assert_eq!(s.sequence, 0);
        assert!(s.delayed.is_none());
    }

    #[tokio::test]
    async fn oversize_window_drops_damage_and_warns_once() {
        let (mut s, _handle) = scheduler_pair(MAX_WINDOW_DIM + 1, 480);
        s.damage(Instant::now(), rect(100, 100), DamageOptions::default())
            .await;
        assert_eq!(s.sequence, 0);
        assert!(s.oversize_warned);
        // a resize back into range resets the warning
        s.handle_command(WindowCommand::Resize {
            width: 800,
            height: 600,
        })
        .await;
        assert!(!s.oversize_warned);
    }

    #[tokio::test]
    async fn cancel_damage_publishes_watermark() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        let now = Instant::now();
        s.damage(now, rect(100, 100), DamageOptions::default()).await;
        assert_eq!(s.sequence, 1);
        s.cancel_damage();
        assert_eq!(s.cancel.load(Ordering::Acquire), 1);
        assert!(s.delayed.is_none());
    }

    #[tokio::test]
    async fn lock_and_unlock_batch_delay() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        s.handle_command(WindowCommand::LockBatchDelay(None)).await;
        assert!(s.batch.locked);
        assert!((s.batch.delay - LOCKED_BATCH_DELAY).abs() < f64::EPSILON);
        s.handle_command(WindowCommand::UnlockBatchDelay).await;
        assert!(!s.batch.locked);
    }

    #[tokio::test]
    async fn full_frames_only_widens_damage() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        s.merge.full_frames_only = true;
        s.damage(Instant::now(), rect(10, 10), DamageOptions::default())
            .await;
        // the single pending encode covers the whole window
        let (_, w, h) = s.stats.encoding_pending[&1];
        assert_eq!((w, h), (640, 480));
    }

    #[tokio::test]
    async fn backlog_defers_expired_region() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        let mut global = GlobalStats::new();
        let now = Instant::now();
        s.damage(now, rect(50, 50), DamageOptions::default()).await;
        s.damage(now, rect(60, 60), DamageOptions::default()).await;
        assert!(s.delayed.is_some());
        // fake a sent-but-unacked packet so the backlog gate trips
        let sent = now - Duration::from_secs(5);
        s.ack
            .record_queued(&mut s.stats, sent, 1, Encoding::Png, rect(50, 50), sent, sent, None, 10_000);
        s.ack.send_started(&mut s.stats, sent, 1, 0);
        s.ack.send_completed(&mut s.stats, &mut global, sent, 1, 10_000, 0);
        if let Some(region) = s.delayed.as_mut() {
            region.expired = true;
        }
        s.may_send_delayed(now).await;
        assert!(s.delayed.is_some(), "region must not dispatch into a backlog");
        assert_eq!(s.soft_expired, 1);
        assert!(s.soft_timer.is_some());
    }

    #[tokio::test]
    async fn deferral_limit_arms_hard_timeout() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        let mut global = GlobalStats::new();
        let now = Instant::now();
        s.damage(now, rect(50, 50), DamageOptions::default()).await;
        s.damage(now, rect(60, 60), DamageOptions::default()).await;
        let sent = now - Duration::from_secs(5);
        s.ack
            .record_queued(&mut s.stats, sent, 1, Encoding::Png, rect(50, 50), sent, sent, None, 10_000);
        s.ack.send_started(&mut s.stats, sent, 1, 0);
        s.ack.send_completed(&mut s.stats, &mut global, sent, 1, 10_000, 0);
        if let Some(region) = s.delayed.as_mut() {
            region.expired = true;
        }
        s.soft_expired = MAX_SOFT_EXPIRED;
        s.may_send_delayed(now).await;
        assert!(s.timeout_timer.is_some());
    }

    #[tokio::test]
    async fn info_snapshot_reflects_state() {
        let (mut s, _handle) = scheduler_pair(640, 480);
        let global = GlobalStats::new();
        s.damage(Instant::now(), rect(100, 100), DamageOptions::default())
            .await;
        let info = s.info(&global);
        assert_eq!(info.wid, 1);
        assert_eq!(info.dimensions, (640, 480));
        assert_eq!(info.sequence, 1);
        assert_eq!(info.encode_pending, 1);
        assert!(!info.suspended);
    }

    #[tokio::test]
    async fn planning_never_awaits_the_work_channel() {
        // The work channel holds one item and nobody drains it, so
        // only the plan/dispatch split keeps this from deadlocking.
        let config = SchedulerConfig {
            width: 640,
            height: 480,
            work_queue: 1,
            ..Default::default()
        };
        let (mut s, _handle) = WindowScheduler::new(
            config,
            Box::new(TestCapture),
            CodecRegistry::builder().build(),
            ClientCapabilities::default(),
            Arc::new(NullSink),
            Arc::new(Mutex::new(GlobalStats::new())),
        );
        let mut global = GlobalStats::new();
        let works = s.plan_work(
            Instant::now(),
            Instant::now(),
            vec![rect(100, 100)],
            None,
            DamageOptions::default(),
            &mut global,
        );
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].sequence, 1);
        assert!(s.stats.encoding_pending.contains_key(&1));
    }
}
