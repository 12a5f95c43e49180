//! Frame Channel Types
//!
//! The frame descriptor is the unit of trust transfer between the two
//! processes. The producer owns a slot's descriptor while writing it;
//! ownership passes to the consumer when the queue message lands. Because
//! the producer (or a hostile peer) can keep mutating the slot underneath
//! an inattentive reader, the consumer snapshots the raw descriptor into
//! local memory and validates the copy, never the shared bytes, before
//! any field is used for bounds math.
//!
//! Pixel formats are a closed enum with pure size formulas; there is no
//! dispatch beyond the match.

pub mod consumer;
pub mod publisher;

pub use consumer::{FrameConsumer, FramePoll, RenderSink};
pub use publisher::{FrameMetadata, FramePublisher, PendingFrame, PublisherStats};

use crate::damage::{DamageRect, Rotation, MAX_DAMAGE_RECTS};
use crate::error::{RelayError, Result};
use crate::protocol::FRAME_SLOT_HEADER;
use crate::shm::ShmPod;

// =============================================================================
// Pixel formats
// =============================================================================

/// Pixel format of a transmitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// B,G,R,A interleaved, 32bpp
    Bgra,
    /// R,G,B,A interleaved, 32bpp
    Rgba,
    /// R,G,B,A 10:10:10:2, 32bpp
    Rgba10,
    /// R,G,B,A half-float, 64bpp
    Rgba16F,
    /// Planar 4:2:0, luma plane plus two quarter-size chroma planes
    Yuv420,
}

impl PixelFormat {
    /// Decode the wire tag, rejecting unknown values
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(PixelFormat::Bgra),
            2 => Some(PixelFormat::Rgba),
            3 => Some(PixelFormat::Rgba10),
            4 => Some(PixelFormat::Rgba16F),
            5 => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Encode for the wire (0 is reserved as invalid)
    pub fn to_wire(self) -> u32 {
        match self {
            PixelFormat::Bgra => 1,
            PixelFormat::Rgba => 2,
            PixelFormat::Rgba10 => 3,
            PixelFormat::Rgba16F => 4,
            PixelFormat::Yuv420 => 5,
        }
    }

    /// Bits per pixel as presented
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Bgra | PixelFormat::Rgba | PixelFormat::Rgba10 => 32,
            PixelFormat::Rgba16F => 64,
            PixelFormat::Yuv420 => 12,
        }
    }

    /// Payload size in bytes, deterministic from format and geometry
    ///
    /// Packed formats are row-addressed through the pitch; the planar 4:2:0
    /// layout is tightly packed (luma plane then two quarter-size chroma
    /// planes).
    pub fn payload_size(self, width: u32, height: u32, pitch: u32) -> u64 {
        match self {
            PixelFormat::Bgra
            | PixelFormat::Rgba
            | PixelFormat::Rgba10
            | PixelFormat::Rgba16F => height as u64 * pitch as u64,
            PixelFormat::Yuv420 => {
                let luma = width as u64 * height as u64;
                luma + (luma / 4) * 2
            }
        }
    }
}

// =============================================================================
// Raw descriptor (wire layout)
// =============================================================================

/// Frame descriptor exactly as it sits in a slot
///
/// Snapshot-copied out of the region before validation; every field is
/// untrusted until `FrameDescriptor::from_raw` accepts it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawFrameDescriptor {
    pub format: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pitch: u32,
    pub rotation: u32,
    pub format_version: u32,
    pub damage_count: u32,
    pub serial: u64,
    pub payload_offset: u64,
    pub damage: [[u32; 4]; MAX_DAMAGE_RECTS],
}

unsafe impl ShmPod for RawFrameDescriptor {}

// The reserved slot header must hold the descriptor.
const _: () = assert!(std::mem::size_of::<RawFrameDescriptor>() <= FRAME_SLOT_HEADER);

// =============================================================================
// Validated descriptor
// =============================================================================

/// A validated frame descriptor, safe to use for bounds math
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Pixel format of the payload
    pub format: PixelFormat,
    /// Full desktop width in pixels
    pub screen_width: u32,
    /// Full desktop height in pixels
    pub screen_height: u32,
    /// Transmitted frame width in pixels
    pub width: u32,
    /// Transmitted frame height in pixels
    pub height: u32,
    /// Row length in pixels
    pub stride: u32,
    /// Row length in bytes
    pub pitch: u32,
    /// Display rotation at capture
    pub rotation: Rotation,
    /// Bumped whenever dimensions or format change
    pub format_version: u32,
    /// Monotonically increasing publication counter
    pub serial: u64,
    /// Absolute payload offset from the start of the region
    pub payload_offset: u64,
    /// Changed regions since the previous publication; empty means the
    /// whole frame changed
    pub damage: Vec<DamageRect>,
}

impl FrameDescriptor {
    /// Validate a snapshot against the region size
    ///
    /// Any failure here means the single frame is dropped (`MalformedFrame`),
    /// never that the connection is torn down.
    pub(crate) fn from_raw(raw: &RawFrameDescriptor, region_size: usize) -> Result<Self> {
        let format = PixelFormat::from_wire(raw.format)
            .ok_or_else(|| RelayError::MalformedFrame(format!("unknown format tag {}", raw.format)))?;
        let rotation = Rotation::from_wire(raw.rotation).ok_or_else(|| {
            RelayError::MalformedFrame(format!("unknown rotation tag {}", raw.rotation))
        })?;

        if raw.width == 0 || raw.height == 0 || raw.pitch == 0 {
            return Err(RelayError::MalformedFrame(format!(
                "degenerate geometry {}x{} pitch {}",
                raw.width, raw.height, raw.pitch
            )));
        }
        if raw.pitch < raw.width {
            return Err(RelayError::MalformedFrame(format!(
                "pitch {} smaller than width {}",
                raw.pitch, raw.width
            )));
        }

        let payload_size = format.payload_size(raw.width, raw.height, raw.pitch);
        let end = raw.payload_offset.checked_add(payload_size).ok_or_else(|| {
            RelayError::MalformedFrame("payload range overflows".into())
        })?;
        if end > region_size as u64 {
            return Err(RelayError::MalformedFrame(format!(
                "payload {}..{} exceeds region size {}",
                raw.payload_offset, end, region_size
            )));
        }

        if raw.damage_count as usize > MAX_DAMAGE_RECTS {
            return Err(RelayError::MalformedFrame(format!(
                "damage count {} exceeds limit {}",
                raw.damage_count, MAX_DAMAGE_RECTS
            )));
        }
        let mut damage = Vec::with_capacity(raw.damage_count as usize);
        for entry in raw.damage.iter().take(raw.damage_count as usize) {
            let rect = DamageRect::new(entry[0], entry[1], entry[2], entry[3]);
            let in_bounds = rect.x.checked_add(rect.width).map_or(false, |r| r <= raw.width)
                && rect.y.checked_add(rect.height).map_or(false, |b| b <= raw.height);
            if !in_bounds {
                return Err(RelayError::MalformedFrame(format!(
                    "damage rect {rect:?} outside {}x{} frame",
                    raw.width, raw.height
                )));
            }
            damage.push(rect);
        }

        Ok(Self {
            format,
            screen_width: raw.screen_width,
            screen_height: raw.screen_height,
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            pitch: raw.pitch,
            rotation,
            format_version: raw.format_version,
            serial: raw.serial,
            payload_offset: raw.payload_offset,
            damage,
        })
    }

    /// Payload size in bytes for this descriptor
    #[inline]
    pub fn payload_size(&self) -> u64 {
        self.format.payload_size(self.width, self.height, self.pitch)
    }
}

// =============================================================================
// Tests
// =============================================================================
