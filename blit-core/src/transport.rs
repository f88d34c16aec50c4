//! Transport seam: where finished packets leave the pipeline.
//!
//! The actual wire (framing, connection management, retransmission) is
//! someone else's problem. The pipeline needs exactly two things from
//! it: a queue to drop packets into, and progress events back so the
//! ack tracker can measure send latency and spot slow sends.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BlitError;
use crate::packet::DrawPacket;

// ── SendProgress ─────────────────────────────────────────────────

/// Per-packet progress reported by the transport, tagged with the
/// packet's draw sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// The first byte hit the wire.
    Started { sequence: u64, bytes: u64 },
    /// The last byte was handed to the socket.
    Completed { sequence: u64, bytes: u64 },
    /// The transport gave up on this packet; the rectangle must be
    /// re-damaged.
    Failed { sequence: u64 },
}

impl SendProgress {
    pub fn sequence(&self) -> u64 {
        match self {
            SendProgress::Started { sequence, .. }
            | SendProgress::Completed { sequence, .. }
            | SendProgress::Failed { sequence } => *sequence,
        }
    }
}

// ── PacketSink ───────────────────────────────────────────────────

/// Outbound packet queue implemented by the transport layer.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Queue one draw packet for delivery.
    ///
    /// The sink reports [`SendProgress`] events for this packet on
    /// `progress` as the bytes actually move; it may drop the sender
    /// without events only if it never attempts the send (in which
    /// case it must have returned an error here).
    async fn queue_packet(
        &self,
        packet: DrawPacket,
        progress: mpsc::Sender<SendProgress>,
    ) -> Result<(), BlitError>;
}
