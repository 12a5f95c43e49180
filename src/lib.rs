//! # framerelay
//!
//! Shared-memory frame and cursor relay for remote desktop pipelines.
//!
//! A producer process (the capture side) and a consumer process (the render
//! side) share one memory region. Frames and cursor updates travel through
//! lock-free message queues inside that region; pixel payloads never leave
//! it, so a frame crosses the process boundary as one descriptor plus a
//! slot index.
//!
//! # Architecture
//!
//! ```text
//! producer process                       consumer process
//!   ├─> RelayHost (region + header)       ├─> RelayClient (attach + handshake)
//!   ├─> FramePublisher ──┐                ├─> FrameConsumer ──> RenderSink
//!   └─> CursorPublisher ─┤                └─> CursorConsumer ─> CursorSink
//!                        │  shared region │
//!                        └────────────────┘
//! ```
//!
//! # Data Flow
//!
//! **Frame path:** capture → `FramePublisher::begin` → payload copy →
//! finalize/post → `FrameConsumer::poll` → validate → `RenderSink`
//!
//! **Cursor path:** cursor callback → `CursorPublisher` → `CursorConsumer`
//! → `CursorSink`
//!
//! **Redraw path:** frame damage → `DamageTracker` → buffer-age plan →
//! `ViewportTransform` → on-screen rectangles
//!
//! The consumer trusts nothing it reads: descriptors are snapshot-copied
//! out of the region and validated before any field is used, so a crashed
//! or hostile peer can cost frames but never memory safety.

#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// Modules
// =============================================================================

/// Consumer session: attach, handshake, channel subscriptions
pub mod client;

/// Configuration loading and validation
pub mod config;

/// Cursor channel: position slots, shape pool, version dedup
pub mod cursor;

/// Damage accumulation, buffer-age redraw plans and coordinate remapping
pub mod damage;

/// Error taxonomy shared by both sides
pub mod error;

/// Frame channel: slot ring, publication discipline, defensive validation
pub mod frame;

/// Producer session: region setup, header, housekeeping
pub mod host;

/// Region header, feature/status bits, layout math and the attach handshake
pub mod protocol;

/// The shared-memory message ring used by both channels
pub mod queue;

/// Raw region access, the only unsafe boundary
pub mod shm;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::RelayClient;
pub use config::RelayConfig;
pub use cursor::{
    CursorConsumer, CursorEvent, CursorKind, CursorPublisher, CursorShape, CursorShapeUpdate,
    CursorSink,
};
pub use damage::{
    DamageRect, DamageTracker, RedrawPlan, Rotation, Viewport, ViewportTransform,
};
pub use error::{RelayError, Result};
pub use frame::{
    FrameConsumer, FrameDescriptor, FrameMetadata, FramePublisher, PendingFrame, PixelFormat,
    RenderSink,
};
pub use host::RelayHost;
pub use protocol::{Feature, Status};
pub use shm::SharedRegion;
