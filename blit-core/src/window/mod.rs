//! Per-window damage processing.
//!
//! Damage flows through two cooperating tasks per window:
//!
//! ```text
//!  damage ─▶ scheduler (control task)
//!              ├─ batch:     delayed region + adaptive delay
//!              ├─ merge:     rectangles -> ordered send plan
//!              ├─ select:    encoding choice per rectangle
//!              ├─ tuning:    quality/speed targets
//!              ├─ refresh:   lossless auto-refresh bookkeeping
//!              └─ ack:       pending-packet table, congestion
//!                    │
//!                    ▼ EncodeWork (bounded channel)
//!            encode worker (encode task)
//!              ├─ pipeline:  scored converter/encoder instances
//!              └─ encode:    compression, packet assembly, sink
//! ```
//!
//! The scheduler owns all adaptive state; the worker owns the codec
//! instances. They share only the cancellation watermark and their
//! channels.

pub mod ack;
pub mod batch;
pub mod encode;
pub mod merge;
pub mod pipeline;
pub mod refresh;
pub mod scheduler;
pub mod select;
pub mod tuning;

pub use ack::{AckTracker, AckVerdict};
pub use batch::{BatchConfig, DamageOptions, DelayedRegion};
pub use encode::{EncodeWork, EncodeWorker, PacketReport, WorkerEvent};
pub use merge::{MergeConfig, PlannedSend};
pub use refresh::RefreshState;
pub use scheduler::{SchedulerConfig, SchedulerHandle, SchedulerInfo, WindowCommand, WindowScheduler};
pub use select::{ContentType, EncodingChoice, Selector};
pub use tuning::Tuning;
