//! Synthetic damage source and an in-memory client.
//!
//! Three pieces stand in for the real world: [`SimCapture`] produces
//! noise pixels on demand, [`SimLink`] plays the transport and delays
//! delivery according to the configured wire speed, and
//! [`spawn_client`] acks every delivered packet after the configured
//! link latency. Together they close the scheduler's feedback loop
//! without a display or a socket.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use blit_core::error::BlitError;
use blit_core::geometry::Rectangle;
use blit_core::packet::DrawPacket;
use blit_core::pixels::{Capture, PixelFormat, WindowImage};
use blit_core::transport::{PacketSink, SendProgress};
use blit_core::window::scheduler::SchedulerHandle;

use crate::config::{LinkConfig, WorkloadConfig};

// ── Rng ──────────────────────────────────────────────────────────

/// Tiny xorshift generator so runs with the same seed produce the
/// same damage stream.
#[derive(Debug, Clone)]
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        Self(seed | 1)
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform value in `0..bound` (`bound` of zero yields zero).
    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 { 0 } else { self.next() % bound }
    }
}

// ── Capture ──────────────────────────────────────────────────────

/// Capture source that fills every requested rectangle with noise.
pub struct SimCapture {
    rng: Rng,
}

impl SimCapture {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Rng::new(seed),
        }
    }
}

impl Capture for SimCapture {
    fn get_image(&mut self, x: i32, y: i32, width: i32, height: i32) -> Option<WindowImage> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let stride = width as u32 * 4;
        let mut buffer = vec![0u8; stride as usize * height as usize];
        for chunk in buffer.chunks_mut(8) {
            let word = self.rng.next().to_le_bytes();
            let n = chunk.len();
            chunk.copy_from_slice(&word[..n]);
        }
        Some(WindowImage::packed(
            x,
            y,
            width as u32,
            height as u32,
            PixelFormat::Bgrx8,
            Bytes::from(buffer),
            stride,
        ))
    }
}

// ── Link ─────────────────────────────────────────────────────────

/// A packet that made it across the simulated wire.
#[derive(Debug, Clone, Copy)]
pub struct Delivered {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

/// Transport stand-in: reports send progress paced by the configured
/// bandwidth, then hands the packet to the client task.
pub struct SimLink {
    bandwidth_bps: u64,
    delivered: mpsc::UnboundedSender<Delivered>,
}

impl SimLink {
    pub fn new(config: &LinkConfig, delivered: mpsc::UnboundedSender<Delivered>) -> Self {
        Self {
            bandwidth_bps: config.bandwidth_bps,
            delivered,
        }
    }
}

#[async_trait]
impl PacketSink for SimLink {
    async fn queue_packet(
        &self,
        packet: DrawPacket,
        progress: mpsc::Sender<SendProgress>,
    ) -> Result<(), BlitError> {
        let sequence = packet.sequence;
        let bytes = packet.data.len() as u64;
        let wire_time = if self.bandwidth_bps > 0 {
            Duration::from_secs_f64((bytes * 8) as f64 / self.bandwidth_bps as f64)
        } else {
            Duration::ZERO
        };
        let delivered = self.delivered.clone();
        let report = Delivered {
            sequence,
            width: packet.width,
            height: packet.height,
            bytes,
        };
        let _ = progress.send(SendProgress::Started { sequence, bytes: 0 }).await;
        tokio::spawn(async move {
            tokio::time::sleep(wire_time).await;
            let _ = progress.send(SendProgress::Completed { sequence, bytes }).await;
            let _ = delivered.send(report);
        });
        Ok(())
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Run the pretend client: wait out the link latency for each
/// delivered packet, then ack it with the configured decode time.
pub fn spawn_client(
    handle: SchedulerHandle,
    mut delivered: mpsc::UnboundedReceiver<Delivered>,
    link: LinkConfig,
    seed: u64,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut rng = Rng::new(seed);
        let mut acked = 0u64;
        while let Some(packet) = delivered.recv().await {
            let jitter = rng.below(link.jitter_ms + 1);
            tokio::time::sleep(Duration::from_millis(link.latency_ms + jitter)).await;
            if handle
                .ack(
                    packet.sequence,
                    packet.width,
                    packet.height,
                    link.decode_us,
                    String::new(),
                )
                .await
                .is_err()
            {
                break;
            }
            acked += 1;
        }
        acked
    })
}

// ── Workload ─────────────────────────────────────────────────────

/// Generates damage rectangles inside the window, one burst per tick.
pub struct Workload {
    width: u32,
    height: u32,
    burst: u32,
    max_rect: u32,
    rng: Rng,
}

impl Workload {
    pub fn new(width: u32, height: u32, config: &WorkloadConfig) -> Self {
        Self {
            width,
            height,
            burst: config.burst.max(1),
            max_rect: config.max_rect.clamp(1, width.max(1)),
            rng: Rng::new(config.seed),
        }
    }

    /// The rectangles damaged by one workload tick.
    pub fn next_burst(&mut self) -> Vec<Rectangle> {
        let mut rects = Vec::with_capacity(self.burst as usize);
        for _ in 0..self.burst {
            let w = 1 + self.rng.below(self.max_rect as u64) as i32;
            let h = 1 + self.rng.below(self.max_rect as u64) as i32;
            let x = self.rng.below(self.width.max(1) as u64) as i32;
            let y = self.rng.below(self.height.max(1) as u64) as i32;
            rects.push(Rectangle::new(x, y, w, h));
        }
        rects
    }
}

/// Drive the scheduler with damage until the duration elapses or the
/// stop flag is raised. Returns the number of damage events sent.
pub async fn drive(
    handle: &SchedulerHandle,
    workload: &mut Workload,
    config: &WorkloadConfig,
    stop: &std::sync::atomic::AtomicBool,
) -> Result<u64, BlitError> {
    use std::sync::atomic::Ordering;

    let rate = config.events_per_sec.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate as f64));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.duration_secs);
    let mut sent = 0u64;
    while tokio::time::Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        ticker.tick().await;
        for rect in workload.next_burst() {
            handle.damage(rect, Default::default()).await?;
            sent += 1;
        }
    }
    Ok(sent)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_rects_start_inside_the_window() {
        let config = WorkloadConfig::default();
        let mut workload = Workload::new(640, 480, &config);
        for _ in 0..100 {
            for rect in workload.next_burst() {
                assert!(rect.x >= 0 && rect.x < 640);
                assert!(rect.y >= 0 && rect.y < 480);
                assert!(rect.w >= 1 && rect.h >= 1);
            }
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let config = WorkloadConfig::default();
        let mut a = Workload::new(800, 600, &config);
        let mut b = Workload::new(800, 600, &config);
        for _ in 0..10 {
            assert_eq!(a.next_burst(), b.next_burst());
        }
    }

    #[test]
    fn capture_returns_requested_dimensions() {
        let mut capture = SimCapture::new(1);
        let image = capture.get_image(10, 20, 64, 32).unwrap();
        assert_eq!(image.width, 64);
        assert_eq!(image.height, 32);
        assert!(capture.get_image(0, 0, 0, 16).is_none());
    }
}
