//! Cursor Publication
//!
//! Position updates cycle through the cheap position slots; shape changes
//! copy the bitmap into the next shape slot and bump the shape version.
//! Every shape message also carries the current position, so a single
//! message fully describes the cursor to a consumer that has nothing yet.
//!
//! The queue is shared with position traffic and sized for bursts; when it
//! still fills, updates are dropped after a bounded retry. A dropped
//! position is superseded by the next one, and a dropped shape is re-sent
//! by the new-subscriber path or the next change.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::TimingConfig;
use crate::error::{RelayError, Result};
use crate::protocol::RegionLayout;
use crate::queue::Queue;
use crate::shm::SharedRegion;

use super::{CursorFlag, CursorKind, RawCursorDescriptor};

use enumflags2::BitFlags;

/// A cursor bitmap with its metadata, owned by the producer
#[derive(Debug, Clone)]
pub struct CursorShape {
    /// Bitmap encoding
    pub kind: CursorKind,
    /// Bitmap width in pixels
    pub width: u32,
    /// Bitmap height in rows
    pub height: u32,
    /// Row length in bytes
    pub pitch: u32,
    /// Hotspot offset within the bitmap
    pub hot_x: i32,
    /// Hotspot offset within the bitmap
    pub hot_y: i32,
    /// Bitmap bytes, `height * pitch` of them
    pub data: Vec<u8>,
}

impl CursorShape {
    fn payload_size(&self) -> usize {
        self.height as usize * self.pitch as usize
    }
}

/// Publication counters
#[derive(Debug, Default, Clone)]
pub struct CursorPublisherStats {
    /// Position messages posted
    pub positions: u64,
    /// Shape messages posted
    pub shapes: u64,
    /// Updates dropped to backpressure
    pub dropped: u64,
    /// Full-state reposts for new subscribers
    pub reposted: u64,
}

/// Producer side of the cursor channel
pub struct CursorPublisher {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    queue: Queue,
    pos_index: u32,
    shape_index: u32,
    shape_version: u32,
    last_shape: Option<CursorShape>,
    x: i32,
    y: i32,
    visible: bool,
    retry_interval: Duration,
    retry_attempts: u32,
    stats: CursorPublisherStats,
}

impl CursorPublisher {
    /// Create the publisher over a freshly initialized cursor queue
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        layout: RegionLayout,
        queue: Queue,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            region,
            layout,
            queue,
            pos_index: 0,
            shape_index: 0,
            shape_version: 0,
            last_shape: None,
            x: 0,
            y: 0,
            visible: false,
            retry_interval: timing.post_retry(),
            retry_attempts: timing.post_retry_attempts,
            stats: CursorPublisherStats::default(),
        }
    }

    /// Publication counters
    pub fn stats(&self) -> &CursorPublisherStats {
        &self.stats
    }

    /// Publish a position/visibility update
    ///
    /// Cheap path: fills the next position slot and posts. `QueueFull` after
    /// the retry budget means the update was dropped; the caller sends the
    /// next one as usual.
    pub fn move_to(&mut self, x: i32, y: i32, visible: bool) -> Result<()> {
        self.x = x;
        self.y = y;
        self.visible = visible;

        let slot = self.pos_index;
        self.pos_index = (self.pos_index + 1) % self.layout.geometry().cursor_pos_slots;
        self.region.write_pod(
            self.layout.cursor_pos_slot(slot),
            self.position_descriptor(),
        )?;

        let mut flags = BitFlags::from(CursorFlag::Position);
        if visible {
            flags |= CursorFlag::Visible;
        }
        match self.post_with_retry(flags.bits(), slot) {
            Ok(()) => {
                trace!(x, y, visible, "cursor position posted");
                self.stats.positions += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.dropped += 1;
                Err(e)
            }
        }
    }

    /// Publish a new cursor shape together with the current position
    pub fn set_shape(&mut self, shape: CursorShape) -> Result<()> {
        self.shape_version = self.shape_version.wrapping_add(1);
        let version = self.shape_version;
        self.write_shape(&shape, version)?;
        self.last_shape = Some(shape);
        debug!(version, "cursor shape published");
        Ok(())
    }

    /// Re-send full cursor state if a new subscriber appeared
    ///
    /// The current shape (if any) goes out under its existing version; a
    /// consumer that already has it skips the upload by version match, and
    /// a fresh one gets everything from the single message.
    pub fn repost_for_new_subscriber(&mut self) -> Result<bool> {
        if !self.queue.has_new_subscriber() {
            return Ok(false);
        }
        if let Some(shape) = self.last_shape.take() {
            let version = self.shape_version;
            let result = self.write_shape(&shape, version);
            self.last_shape = Some(shape);
            result?;
        } else {
            self.move_to(self.x, self.y, self.visible)?;
        }
        self.stats.reposted += 1;
        debug!("re-sent cursor state for new subscriber");
        Ok(true)
    }

    fn write_shape(&mut self, shape: &CursorShape, version: u32) -> Result<()> {
        let size = shape.payload_size();
        let capacity = self.layout.geometry().cursor_shape_slot_size as usize;
        if size > capacity || size != shape.data.len() {
            return Err(RelayError::SlotOverflow { size, capacity });
        }

        let index = self.shape_index;
        self.shape_index = (self.shape_index + 1) % self.layout.geometry().cursor_shape_slots;
        let payload_offset = self.layout.cursor_shape_payload(index);
        self.region.write_bytes(payload_offset, &shape.data)?;

        let mut desc = self.position_descriptor();
        desc.kind = shape.kind.to_wire();
        desc.width = shape.width;
        desc.height = shape.height;
        desc.pitch = shape.pitch;
        desc.hot_x = shape.hot_x;
        desc.hot_y = shape.hot_y;
        desc.shape_version = version;
        desc.payload_offset = payload_offset as u64;
        self.region
            .write_pod(self.layout.cursor_shape_slot(index), desc)?;

        // Shape slots come after the position slots in queue numbering.
        let slot = self.layout.geometry().cursor_pos_slots + index;
        let mut flags = CursorFlag::Shape | CursorFlag::Position;
        if self.visible {
            flags |= CursorFlag::Visible;
        }
        match self.post_with_retry(flags.bits(), slot) {
            Ok(()) => {
                self.stats.shapes += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.dropped += 1;
                Err(e)
            }
        }
    }

    fn position_descriptor(&self) -> RawCursorDescriptor {
        RawCursorDescriptor {
            kind: 0,
            width: 0,
            height: 0,
            pitch: 0,
            hot_x: 0,
            hot_y: 0,
            x: self.x,
            y: self.y,
            shape_version: 0,
            payload_offset: 0,
        }
    }

    fn post_with_retry(&self, flags: u32, slot: u32) -> Result<()> {
        let mut tries = 0;
        loop {
            match self.queue.post(flags, slot) {
                Ok(()) => return Ok(()),
                Err(RelayError::QueueFull(id)) if tries < self.retry_attempts => {
                    tries += 1;
                    if tries == self.retry_attempts {
                        warn!(queue = id, "cursor queue full, dropping update");
                    }
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
