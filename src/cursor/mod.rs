//! Cursor Channel Types
//!
//! Cursor traffic is far more frequent than frame traffic but tiny:
//! position updates outnumber shape changes by orders of magnitude. The
//! channel therefore has two slot classes, cheap position-only slots and
//! larger shape slots carrying the bitmap, multiplexed over one queue.
//! Message flags say which parts of a slot are meaningful.
//!
//! Shape slots are reused round-robin without explicit acknowledgment of
//! consumption; the pool is deep enough that a slot's previous occupant is
//! stale long before the slot comes around again, and the shape version lets
//! the consumer skip re-uploads of a bitmap it already has.

pub mod consumer;
pub mod publisher;

pub use consumer::{CursorConsumer, CursorConsumerStats, CursorPoll, CursorSink};
pub use publisher::{CursorPublisher, CursorPublisherStats, CursorShape};

use enumflags2::bitflags;

use crate::error::{RelayError, Result};
use crate::protocol::CURSOR_SLOT_HEADER;
use crate::shm::ShmPod;

// =============================================================================
// Wire types
// =============================================================================

/// Cursor bitmap encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// BGRA bitmap with alpha
    Color,
    /// 1bpp AND/XOR mask pair, XOR rows following AND rows
    Monochrome,
    /// BGRA bitmap where alpha selects between color and screen-invert
    MaskedColor,
}

impl CursorKind {
    /// Decode the wire tag, rejecting unknown values
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(CursorKind::Color),
            2 => Some(CursorKind::Monochrome),
            3 => Some(CursorKind::MaskedColor),
            _ => None,
        }
    }

    /// Encode for the wire (0 is reserved as invalid)
    pub fn to_wire(self) -> u32 {
        match self {
            CursorKind::Color => 1,
            CursorKind::Monochrome => 2,
            CursorKind::MaskedColor => 3,
        }
    }
}

/// Message flags on the cursor queue
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFlag {
    /// The slot's x/y fields are current
    Position = 0b001,
    /// The cursor is visible
    Visible = 0b010,
    /// The slot carries a (new) shape bitmap
    Shape = 0b100,
}

/// Cursor descriptor exactly as it sits in a slot
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawCursorDescriptor {
    pub kind: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub hot_x: i32,
    pub hot_y: i32,
    pub x: i32,
    pub y: i32,
    pub shape_version: u32,
    pub payload_offset: u64,
}

unsafe impl ShmPod for RawCursorDescriptor {}

const _: () = assert!(std::mem::size_of::<RawCursorDescriptor>() <= CURSOR_SLOT_HEADER);

// =============================================================================
// Validated views
// =============================================================================

/// A position/visibility update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorEvent {
    /// Whether the cursor should be drawn at all
    pub visible: bool,
    /// Position in desktop coordinates (top-left of the bitmap plus hotspot)
    pub x: i32,
    /// Position in desktop coordinates
    pub y: i32,
    /// Hotspot offset within the bitmap
    pub hot_x: i32,
    /// Hotspot offset within the bitmap
    pub hot_y: i32,
}

/// A validated shape change, payload delivered alongside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorShapeUpdate {
    /// Bitmap encoding
    pub kind: CursorKind,
    /// Bitmap width in pixels
    pub width: u32,
    /// Bitmap height in rows (twice the visual height for monochrome)
    pub height: u32,
    /// Row length in bytes
    pub pitch: u32,
    /// Hotspot offset within the bitmap
    pub hot_x: i32,
    /// Hotspot offset within the bitmap
    pub hot_y: i32,
    /// Producer-side version; equal versions are byte-identical bitmaps
    pub version: u32,
}

impl CursorShapeUpdate {
    /// Validate a snapshot's shape fields against the region size
    pub(crate) fn from_raw(raw: &RawCursorDescriptor, region_size: usize) -> Result<Self> {
        let kind = CursorKind::from_wire(raw.kind).ok_or_else(|| {
            RelayError::MalformedCursor(format!("unknown cursor kind {}", raw.kind))
        })?;
        if raw.width == 0 || raw.height == 0 || raw.pitch == 0 {
            return Err(RelayError::MalformedCursor(format!(
                "degenerate shape {}x{} pitch {}",
                raw.width, raw.height, raw.pitch
            )));
        }
        let size = raw.height as u64 * raw.pitch as u64;
        let end = raw
            .payload_offset
            .checked_add(size)
            .ok_or_else(|| RelayError::MalformedCursor("shape range overflows".into()))?;
        if end > region_size as u64 {
            return Err(RelayError::MalformedCursor(format!(
                "shape {}..{} exceeds region size {}",
                raw.payload_offset, end, region_size
            )));
        }
        Ok(Self {
            kind,
            width: raw.width,
            height: raw.height,
            pitch: raw.pitch,
            hot_x: raw.hot_x,
            hot_y: raw.hot_y,
            version: raw.shape_version,
        })
    }

    /// Bitmap size in bytes
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.height as usize * self.pitch as usize
    }
}

// =============================================================================
// Tests
// =============================================================================
