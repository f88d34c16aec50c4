//! Client feature flags.
//!
//! Bitfield flags negotiated per window, controlling which optional
//! packet fields and encoding paths the client can handle.

use bitflags::bitflags;

bitflags! {
    /// Capabilities the client advertised for a window.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        /// The client composites alpha, so transparency must survive.
        const ALPHA          = 1 << 0;
        /// The client honours the `flush` hint on draw packets.
        const FLUSH          = 1 << 1;
        /// The client wants capture/encode timestamps in packet options.
        const TIMESTAMPS     = 1 << 2;
        /// A shared-memory segment is mapped; the zero-copy path wins.
        const SHARED_MEMORY  = 1 << 3;
        /// The client can upscale, so the server may encode downscaled.
        const VIDEO_SCALING  = 1 << 4;
        /// The window is a tray/OR surface that must keep its alpha.
        const TRAY           = 1 << 5;
        /// Encodings may never change once chosen (strict mode).
        const STRICT         = 1 << 6;
        /// The client renders grayscale only.
        const GRAYSCALE      = 1 << 7;
    }
}

impl Default for ClientFlags {
    fn default() -> Self {
        Self::FLUSH | Self::VIDEO_SCALING
    }
}
