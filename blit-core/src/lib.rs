//! # blit-core
//!
//! Adaptive damage-to-packet scheduling for a remote-display server.
//!
//! Screen updates ("damage") arrive as rectangles; this crate turns
//! them into encoded draw packets at a rate the client and the link
//! can actually sustain. Each window gets a closed control loop that
//! batches damage under an adaptive delay, picks an encoding and a
//! quality/speed point per rectangle, watches acks and transport
//! progress for congestion, and schedules lossless refreshes behind
//! lossy updates.
//!
//! This crate contains:
//! - **Geometry**: `Rectangle` and region set helpers
//! - **Pixels**: `WindowImage`, pixel formats, the `Capture` seam
//! - **Codec**: the codec registry and the built-in rgb encoder
//! - **Packet**: the bincode-framed `DrawPacket`
//! - **Transport**: the `PacketSink` seam and send progress reports
//! - **Stats**: per-window and per-connection statistics and factors
//! - **Window**: the scheduler, encode worker and their collaborators
//! - **Error**: `BlitError` — typed, `thiserror`-based error hierarchy

pub mod capability;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod flags;
pub mod geometry;
pub mod packet;
pub mod pixels;
pub mod stats;
pub mod timers;
pub mod transport;
pub mod window;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capability::{ClientCapabilities, CodecRegistry};
pub use encoding::Encoding;
pub use error::BlitError;
pub use flags::ClientFlags;
pub use geometry::Rectangle;
pub use packet::DrawPacket;
pub use pixels::{Capture, PixelFormat, WindowImage};
pub use stats::{GlobalStats, WindowStats};
pub use transport::{PacketSink, SendProgress};
pub use window::scheduler::{SchedulerConfig, SchedulerHandle, SchedulerInfo, WindowScheduler};
pub use window::select::{ContentType, EncodingChoice};
