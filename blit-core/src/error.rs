//! Domain-specific error types for the damage pipeline.
//!
//! All fallible operations return `Result<T, BlitError>`.
//! No panics on invalid input — a failed dispatch degrades the stream
//! (dropped rect, forced refresh) and the window carries on.

use thiserror::Error;

use crate::encoding::Encoding;
use crate::pixels::PixelFormat;

/// The canonical error type for the damage pipeline.
#[derive(Debug, Error)]
pub enum BlitError {
    // ── Pipeline Errors ──────────────────────────────────────────
    /// Every scored candidate failed to instantiate.
    #[error("no viable pipeline for {encoding} at {width}x{height} from {src_format}")]
    PipelineExhausted {
        encoding: Encoding,
        width: u32,
        height: u32,
        src_format: PixelFormat,
    },

    /// A codec instance could not be constructed or initialised.
    #[error("codec setup failed: {0}")]
    CodecSetup(String),

    /// A codec hit a transient condition and should be retried later.
    #[error("transient codec failure: {0}")]
    CodecTransient(String),

    /// The live pipeline no longer matches the frame it was asked to
    /// encode (format, dimensions or encoding drifted).
    #[error("stale pipeline: {0}")]
    StalePipeline(&'static str),

    // ── Encode Errors ────────────────────────────────────────────
    /// The encoder produced no output for a non-cancelled frame.
    #[error("encoder returned no data for {encoding} at {width}x{height}")]
    EmptyEncode {
        encoding: Encoding,
        width: u32,
        height: u32,
    },

    /// Raw pixel compression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// The pixel buffer does not match its declared geometry.
    #[error("pixel buffer mismatch: {0}")]
    BufferMismatch(String),

    // ── Damage Errors ────────────────────────────────────────────
    /// Damage or window dimensions outside the supported range.
    #[error("invalid dimensions: {width}x{height} (max {max})")]
    InvalidDimensions { width: i32, height: i32, max: i32 },

    /// A delayed region could not be delivered before the hard timeout.
    #[error("delayed region stalled for {elapsed_ms}ms (sequence {sequence})")]
    DelayedRegionStalled { sequence: u64, elapsed_ms: u64 },

    // ── Channel Errors ───────────────────────────────────────────
    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a packet failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for BlitError {
    fn from(s: String) -> Self {
        BlitError::Other(s)
    }
}

impl From<&str> for BlitError {
    fn from(s: &str) -> Self {
        BlitError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BlitError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BlitError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for BlitError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        BlitError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = BlitError::PipelineExhausted {
            encoding: Encoding::Vp9,
            width: 1920,
            height: 1080,
            src_format: PixelFormat::Bgrx8,
        };
        assert!(e.to_string().contains("1920x1080"));

        let e = BlitError::InvalidDimensions {
            width: 65536,
            height: 100,
            max: 16384,
        };
        assert!(e.to_string().contains("65536"));
        assert!(e.to_string().contains("16384"));
    }

    #[test]
    fn from_string() {
        let e: BlitError = "something broke".into();
        assert!(matches!(e, BlitError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "zstd");
        let e: BlitError = io_err.into();
        assert!(matches!(e, BlitError::Compression(_)));
    }
}
