//! Region Header, Layout and Handshake
//!
//! The shared region opens with a fixed header: magic, protocol version,
//! feature bits, a status word and the slot geometry. Everything after it is
//! derived deterministically from the geometry, so the consumer computes the
//! full layout from the header alone and never trusts its own configuration
//! for offsets.
//!
//! # Region layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ header (magic, version,      │
//! │ features, status, geometry)  │
//! ├──────────────────────────────┤ 64
//! │ frame queue ring             │
//! ├──────────────────────────────┤
//! │ frame slot 0 (desc + pixels) │
//! │ ...                          │
//! ├──────────────────────────────┤
//! │ cursor queue ring            │
//! ├──────────────────────────────┤
//! │ cursor position slots        │
//! ├──────────────────────────────┤
//! │ cursor shape slots           │
//! └──────────────────────────────┘
//! ```
//!
//! # Handshake
//!
//! The status word is the only cross-process synchronization primitive at
//! this level and is mutated exclusively with atomic bit operations. A
//! consumer attaches by validating magic and version, setting the RESTART
//! bit and polling (bounded) until the producer clears it; this works
//! whether the consumer arrives before or after the producer starts
//! publishing. The producer may raise PAUSED at any time to suspend
//! consumption without tearing the session down.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use enumflags2::{bitflags, BitFlags};
use tracing::{debug, trace};

use crate::error::{RelayError, Result};
use crate::shm::SharedRegion;
use crate::queue::Queue;

// =============================================================================
// Constants
// =============================================================================

/// Region magic, first bytes of the header
pub const MAGIC: [u8; 8] = *b"FRELAY--";

/// Protocol version; any mismatch is fatal for the consumer
pub const PROTOCOL_VERSION: u32 = 1;

/// Header size in bytes; the frame queue starts here
pub const HEADER_SIZE: usize = 64;

/// Queue identifier of the frame channel
pub const FRAME_QUEUE_ID: u32 = 1;

/// Queue identifier of the cursor channel
pub const CURSOR_QUEUE_ID: u32 = 2;

/// Bytes reserved at the start of each frame slot for the descriptor
pub const FRAME_SLOT_HEADER: usize = 384;

/// Bytes reserved at the start of each cursor slot for the descriptor
pub const CURSOR_SLOT_HEADER: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_FEATURES: usize = 12;
const OFF_STATUS: usize = 16;
const OFF_FRAME_SLOTS: usize = 20;
const OFF_FRAME_SLOT_SIZE: usize = 24;
const OFF_CURSOR_POS_SLOTS: usize = 28;
const OFF_CURSOR_SHAPE_SLOTS: usize = 32;
const OFF_CURSOR_SHAPE_SIZE: usize = 36;

// =============================================================================
// Flags
// =============================================================================

/// Process-wide status bits in the header status word
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Consumer requests (re)initialization; producer clears when ready
    Restart = 0b0001,
    /// Producer has suspended publication; consumer shows a notification
    Paused = 0b0010,
}

/// Capabilities advertised by the producer
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Frames carry per-publication damage rectangles
    PartialDamage = 0b0001,
    /// The cursor channel is populated
    CursorRelay = 0b0010,
    /// The producer accepts display-mode change requests out of band
    DisplayModeRequest = 0b0100,
}

// =============================================================================
// Geometry and layout
// =============================================================================

/// Slot counts and sizes, written to and read back from the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionGeometry {
    /// Number of frame slots (also the frame queue capacity)
    pub frame_slots: u32,
    /// Payload bytes per frame slot (worst-case frame)
    pub frame_slot_size: u32,
    /// Number of position-only cursor slots
    pub cursor_pos_slots: u32,
    /// Number of cursor shape slots
    pub cursor_shape_slots: u32,
    /// Payload bytes per cursor shape slot (worst-case cursor bitmap)
    pub cursor_shape_slot_size: u32,
}

impl RegionGeometry {
    fn validate(&self) -> Result<()> {
        if self.frame_slots == 0
            || self.frame_slot_size == 0
            || self.cursor_pos_slots == 0
            || self.cursor_shape_slots == 0
            || self.cursor_shape_slot_size == 0
        {
            return Err(RelayError::InvalidConfig(
                "region geometry fields must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Byte offsets of every structure in the region, derived from geometry
#[derive(Debug, Clone)]
pub struct RegionLayout {
    geometry: RegionGeometry,
    frame_queue: usize,
    frame_slots_base: usize,
    frame_slot_stride: usize,
    cursor_queue: usize,
    cursor_pos_base: usize,
    cursor_shape_base: usize,
    cursor_shape_stride: usize,
    total_size: usize,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

impl RegionLayout {
    /// Compute the layout for a geometry
    pub fn compute(geometry: RegionGeometry) -> Result<Self> {
        geometry.validate()?;

        let frame_queue = HEADER_SIZE;
        let mut at = align_up(frame_queue + Queue::size_for(geometry.frame_slots), 64);

        let frame_slots_base = at;
        let frame_slot_stride =
            align_up(FRAME_SLOT_HEADER + geometry.frame_slot_size as usize, 64);
        at += frame_slot_stride * geometry.frame_slots as usize;

        let cursor_queue = align_up(at, 8);
        let cursor_capacity = geometry.cursor_pos_slots + geometry.cursor_shape_slots;
        at = align_up(cursor_queue + Queue::size_for(cursor_capacity), 64);

        let cursor_pos_base = at;
        at += CURSOR_SLOT_HEADER * geometry.cursor_pos_slots as usize;

        let cursor_shape_base = align_up(at, 64);
        let cursor_shape_stride =
            align_up(CURSOR_SLOT_HEADER + geometry.cursor_shape_slot_size as usize, 64);
        let total_size =
            cursor_shape_base + cursor_shape_stride * geometry.cursor_shape_slots as usize;

        Ok(Self {
            geometry,
            frame_queue,
            frame_slots_base,
            frame_slot_stride,
            cursor_queue,
            cursor_pos_base,
            cursor_shape_base,
            cursor_shape_stride,
            total_size,
        })
    }

    /// Geometry this layout was derived from
    #[inline]
    pub fn geometry(&self) -> &RegionGeometry {
        &self.geometry
    }

    /// Total bytes the layout occupies
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Base offset of the frame queue ring
    #[inline]
    pub fn frame_queue(&self) -> usize {
        self.frame_queue
    }

    /// Base offset of the cursor queue ring
    #[inline]
    pub fn cursor_queue(&self) -> usize {
        self.cursor_queue
    }

    /// Descriptor offset of frame slot `index`
    pub fn frame_slot(&self, index: u32) -> usize {
        debug_assert!(index < self.geometry.frame_slots);
        self.frame_slots_base + self.frame_slot_stride * index as usize
    }

    /// Payload offset of frame slot `index`
    pub fn frame_payload(&self, index: u32) -> usize {
        self.frame_slot(index) + FRAME_SLOT_HEADER
    }

    /// Descriptor offset of position-only cursor slot `index`
    pub fn cursor_pos_slot(&self, index: u32) -> usize {
        debug_assert!(index < self.geometry.cursor_pos_slots);
        self.cursor_pos_base + CURSOR_SLOT_HEADER * index as usize
    }

    /// Descriptor offset of cursor shape slot `index`
    ///
    /// Shape slots are numbered after the position slots in queue messages.
    pub fn cursor_shape_slot(&self, index: u32) -> usize {
        debug_assert!(index < self.geometry.cursor_shape_slots);
        self.cursor_shape_base + self.cursor_shape_stride * index as usize
    }

    /// Payload offset of cursor shape slot `index`
    pub fn cursor_shape_payload(&self, index: u32) -> usize {
        self.cursor_shape_slot(index) + CURSOR_SLOT_HEADER
    }

    /// Descriptor offset for a cursor queue slot number (position slots
    /// first, then shape slots)
    pub fn cursor_slot(&self, slot: u32) -> Option<usize> {
        if slot < self.geometry.cursor_pos_slots {
            Some(self.cursor_pos_slot(slot))
        } else if slot < self.geometry.cursor_pos_slots + self.geometry.cursor_shape_slots {
            Some(self.cursor_shape_slot(slot - self.geometry.cursor_pos_slots))
        } else {
            None
        }
    }
}

// =============================================================================
// Header read/write
// =============================================================================

/// Write the header (producer side, once at region creation)
pub fn write_header(
    region: &SharedRegion,
    features: BitFlags<Feature>,
    layout: &RegionLayout,
) -> Result<()> {
    if layout.total_size() > region.len() {
        return Err(RelayError::RegionTooSmall {
            needed: layout.total_size(),
            available: region.len(),
        });
    }
    let g = layout.geometry();
    region.write_pod::<u32>(OFF_VERSION, PROTOCOL_VERSION)?;
    region.write_pod::<u32>(OFF_FEATURES, features.bits())?;
    status_word(region)?.store(0, Ordering::Release);
    region.write_pod::<u32>(OFF_FRAME_SLOTS, g.frame_slots)?;
    region.write_pod::<u32>(OFF_FRAME_SLOT_SIZE, g.frame_slot_size)?;
    region.write_pod::<u32>(OFF_CURSOR_POS_SLOTS, g.cursor_pos_slots)?;
    region.write_pod::<u32>(OFF_CURSOR_SHAPE_SLOTS, g.cursor_shape_slots)?;
    region.write_pod::<u32>(OFF_CURSOR_SHAPE_SIZE, g.cursor_shape_slot_size)?;
    // Magic last: a region is attachable only once fully described.
    region.write_bytes(OFF_MAGIC, &MAGIC)?;
    Ok(())
}

/// Read and validate the header (consumer side, on attach)
///
/// Fails fast with `ProtocolMismatch` on any magic/version disagreement:
/// a region whose version we do not recognize must never be interpreted.
pub fn read_header(region: &SharedRegion) -> Result<(BitFlags<Feature>, RegionLayout)> {
    let mut magic = [0u8; 8];
    region.read_bytes(OFF_MAGIC, &mut magic)?;
    let version = region.read_pod::<u32>(OFF_VERSION)?;
    if magic != MAGIC || version != PROTOCOL_VERSION {
        return Err(RelayError::ProtocolMismatch {
            expected: format!(
                "{} v{PROTOCOL_VERSION}",
                String::from_utf8_lossy(&MAGIC)
            ),
            found: format!("{} v{version}", String::from_utf8_lossy(&magic)),
        });
    }

    let features = BitFlags::<Feature>::from_bits_truncate(region.read_pod::<u32>(OFF_FEATURES)?);
    let geometry = RegionGeometry {
        frame_slots: region.read_pod::<u32>(OFF_FRAME_SLOTS)?,
        frame_slot_size: region.read_pod::<u32>(OFF_FRAME_SLOT_SIZE)?,
        cursor_pos_slots: region.read_pod::<u32>(OFF_CURSOR_POS_SLOTS)?,
        cursor_shape_slots: region.read_pod::<u32>(OFF_CURSOR_SHAPE_SLOTS)?,
        cursor_shape_slot_size: region.read_pod::<u32>(OFF_CURSOR_SHAPE_SIZE)?,
    };
    let layout = RegionLayout::compute(geometry).map_err(|_| RelayError::ProtocolMismatch {
        expected: "non-zero slot geometry".into(),
        found: format!("{geometry:?}"),
    })?;

    // A hostile header must not talk us into reading past the mapping.
    if layout.total_size() > region.len() {
        return Err(RelayError::RegionTooSmall {
            needed: layout.total_size(),
            available: region.len(),
        });
    }

    debug!(?features, ?geometry, "attached to region header");
    Ok((features, layout))
}

// =============================================================================
// Status word and handshake
// =============================================================================

fn status_word(region: &SharedRegion) -> Result<&AtomicU32> {
    region.atomic_u32(OFF_STATUS)
}

/// Set a status bit (atomic OR)
pub fn raise_status(region: &SharedRegion, status: Status) -> Result<()> {
    status_word(region)?.fetch_or(status as u32, Ordering::AcqRel);
    Ok(())
}

/// Clear a status bit (atomic AND-NOT)
pub fn clear_status(region: &SharedRegion, status: Status) -> Result<()> {
    status_word(region)?.fetch_and(!(status as u32), Ordering::AcqRel);
    Ok(())
}

/// Whether a status bit is currently set
pub fn status_set(region: &SharedRegion, status: Status) -> Result<bool> {
    Ok(status_word(region)?.load(Ordering::Acquire) & status as u32 != 0)
}

/// Consumer side: request a (re)start and wait for the producer to be ready
///
/// Sets the RESTART bit, then polls with a bounded interval until the
/// producer clears it. Works whether the consumer attached before or after
/// the producer started.
pub fn request_restart(
    region: &SharedRegion,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    raise_status(region, Status::Restart)?;
    let deadline = Instant::now() + timeout;
    while status_set(region, Status::Restart)? {
        if Instant::now() >= deadline {
            return Err(RelayError::HandshakeTimeout(timeout.as_millis() as u64));
        }
        trace!("waiting for producer to acknowledge restart");
        std::thread::sleep(poll_interval);
    }
    Ok(())
}

/// Producer side: consume a pending restart request, if any
///
/// Returns `true` when a consumer asked for a restart; the producer clears
/// the bit only after it is ready to publish, which is what releases the
/// consumer from its handshake wait.
pub fn take_restart_request(region: &SharedRegion) -> Result<bool> {
    Ok(status_word(region)?.fetch_and(!(Status::Restart as u32), Ordering::AcqRel)
        & Status::Restart as u32
        != 0)
}

// =============================================================================
// Tests
// =============================================================================
