//! Cursor Consumption
//!
//! Same discipline as the frame side: snapshot the descriptor, acknowledge,
//! validate the copy, then dispatch. Shape payloads are re-validated against
//! the region bounds on every arrival; the shape version deduplicates
//! re-sends so an unchanged bitmap is never uploaded twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;
use tracing::{trace, warn};

use crate::config::TimingConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{RegionLayout, CURSOR_QUEUE_ID};
use crate::queue::Queue;
use crate::shm::SharedRegion;

use super::{CursorEvent, CursorFlag, CursorShapeUpdate, RawCursorDescriptor};

/// Receiver of validated cursor updates
pub trait CursorSink {
    /// A new shape bitmap arrived; return `false` to stop consuming
    fn on_cursor_shape(&mut self, update: &CursorShapeUpdate, payload: &[u8]) -> bool;

    /// Position or visibility changed; return `false` to stop consuming
    fn on_cursor_event(&mut self, event: &CursorEvent) -> bool;
}

/// Outcome of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPoll {
    /// Nothing pending
    Idle,
    /// One message was dispatched
    Delivered,
    /// The sink asked to stop
    SinkStop,
}

/// Consumption counters
#[derive(Debug, Default, Clone)]
pub struct CursorConsumerStats {
    /// Position/visibility events dispatched
    pub events: u64,
    /// Shape uploads dispatched
    pub shapes: u64,
    /// Messages dropped by validation
    pub malformed: u64,
}

/// Consumer side of the cursor channel
pub struct CursorConsumer {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    queue: Queue,
    poll_interval: Duration,
    last_version: Option<u32>,
    stats: CursorConsumerStats,
}

impl CursorConsumer {
    /// Attach to the cursor queue and announce this subscriber
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        layout: RegionLayout,
        timing: &TimingConfig,
    ) -> Result<Self> {
        let mut queue = Queue::attach(region.clone(), layout.cursor_queue(), CURSOR_QUEUE_ID)?;
        queue.subscribe();
        Ok(Self {
            region,
            layout,
            queue,
            poll_interval: timing.cursor_poll(),
            last_version: None,
            stats: CursorConsumerStats::default(),
        })
    }

    /// Consumption counters
    pub fn stats(&self) -> &CursorConsumerStats {
        &self.stats
    }

    /// Handle at most one pending message
    ///
    /// `MalformedCursor` drops that one message; the session continues.
    pub fn poll(&mut self, sink: &mut dyn CursorSink) -> Result<CursorPoll> {
        let Some(msg) = self.queue.read() else {
            return Ok(CursorPoll::Idle);
        };

        let Some(offset) = self.layout.cursor_slot(msg.slot) else {
            self.queue.ack();
            self.stats.malformed += 1;
            return Err(RelayError::MalformedCursor(format!(
                "slot index {} out of range",
                msg.slot
            )));
        };

        let raw: RawCursorDescriptor = self.region.read_pod(offset)?;
        self.queue.ack();

        let flags = BitFlags::<CursorFlag>::from_bits_truncate(msg.flags);

        if flags.contains(CursorFlag::Shape) && self.last_version != Some(raw.shape_version) {
            let update = match CursorShapeUpdate::from_raw(&raw, self.region.len()) {
                Ok(update) => update,
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(slot = msg.slot, error = %e, "dropping malformed cursor shape");
                    return Err(e);
                }
            };
            let payload = self
                .region
                .slice(raw.payload_offset as usize, update.payload_size())?;
            trace!(version = update.version, "cursor shape update");
            self.stats.shapes += 1;
            self.last_version = Some(update.version);
            if !sink.on_cursor_shape(&update, payload) {
                return Ok(CursorPoll::SinkStop);
            }
        }

        if flags.contains(CursorFlag::Position) || flags.contains(CursorFlag::Visible) {
            let event = CursorEvent {
                visible: flags.contains(CursorFlag::Visible),
                x: raw.x,
                y: raw.y,
                hot_x: raw.hot_x,
                hot_y: raw.hot_y,
            };
            self.stats.events += 1;
            if !sink.on_cursor_event(&event) {
                return Ok(CursorPoll::SinkStop);
            }
        }

        Ok(CursorPoll::Delivered)
    }

    /// Poll until stopped
    pub fn run(&mut self, sink: &mut dyn CursorSink, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            match self.poll(sink) {
                Ok(CursorPoll::Delivered) => {}
                Ok(CursorPoll::Idle) => std::thread::sleep(self.poll_interval),
                Ok(CursorPoll::SinkStop) => break,
                Err(e) if e.is_recoverable() => {
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
