//! Frame Consumption
//!
//! The consumer side of the frame channel: poll the queue, snapshot the
//! descriptor, acknowledge, validate, then hand the payload to a
//! [`RenderSink`].
//!
//! Acknowledgment happens right after the descriptor snapshot and before
//! validation or rendering. The slot the producer is waiting on is released
//! as early as possible; the payload bytes stay readable either way, and a
//! producer overwrite during a slow render at worst shows one torn frame
//! that the next publication repairs.
//!
//! A malformed descriptor drops that one frame. It never tears the session
//! down; the peer may be mid-restart or hostile, and both look the same
//! from here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::TimingConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{self, RegionLayout, Status, FRAME_QUEUE_ID};
use crate::queue::Queue;
use crate::shm::SharedRegion;

use super::{FrameDescriptor, RawFrameDescriptor};

// =============================================================================
// Sink
// =============================================================================

/// Receiver of validated frames
///
/// Implemented by the render backend. `on_frame` returning `false` stops
/// the poll loop; the other callbacks are notifications.
pub trait RenderSink {
    /// The frame shape or format changed; (re)allocate surfaces
    fn on_format_change(&mut self, desc: &FrameDescriptor) {
        let _ = desc;
    }

    /// A validated frame arrived; return `false` to stop consuming
    fn on_frame(&mut self, desc: &FrameDescriptor, payload: &[u8]) -> bool;

    /// The producer paused or resumed publication
    fn on_pause_change(&mut self, paused: bool) {
        let _ = paused;
    }
}

/// Outcome of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePoll {
    /// Nothing pending
    Idle,
    /// One frame was delivered to the sink
    Delivered,
    /// The sink asked to stop
    SinkStop,
}

/// Consumption counters
#[derive(Debug, Default, Clone)]
pub struct ConsumerStats {
    /// Frames delivered to the sink
    pub received: u64,
    /// Messages dropped by validation
    pub malformed: u64,
    /// Serial of the most recent delivered frame
    pub last_serial: u64,
}

// =============================================================================
// Consumer
// =============================================================================

/// Consumer side of the frame channel
pub struct FrameConsumer {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    queue: Queue,
    poll_interval: Duration,
    last_format_version: Option<u32>,
    paused: bool,
    stats: ConsumerStats,
}

impl FrameConsumer {
    /// Attach to the frame queue and announce this subscriber
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        layout: RegionLayout,
        timing: &TimingConfig,
    ) -> Result<Self> {
        let mut queue = Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID)?;
        queue.subscribe();
        Ok(Self {
            region,
            layout,
            queue,
            poll_interval: timing.frame_poll(),
            last_format_version: None,
            paused: false,
            stats: ConsumerStats::default(),
        })
    }

    /// Consumption counters
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Whether the producer currently has publication paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Handle at most one pending message
    ///
    /// A `MalformedFrame` error means one frame was dropped (and already
    /// acknowledged); the session is intact and polling should continue.
    pub fn poll(&mut self, sink: &mut dyn RenderSink) -> Result<FramePoll> {
        let paused = protocol::status_set(&self.region, Status::Paused)?;
        if paused != self.paused {
            self.paused = paused;
            debug!(paused, "producer pause state changed");
            sink.on_pause_change(paused);
        }
        if paused {
            return Ok(FramePoll::Idle);
        }

        let Some(msg) = self.queue.read() else {
            return Ok(FramePoll::Idle);
        };

        if msg.slot >= self.layout.geometry().frame_slots {
            self.queue.ack();
            self.stats.malformed += 1;
            return Err(RelayError::MalformedFrame(format!(
                "slot index {} out of range",
                msg.slot
            )));
        }

        // Snapshot, then release the slot before any validation or render
        // work. The copy is what we trust from here on.
        let raw: RawFrameDescriptor = self.region.read_pod(self.layout.frame_slot(msg.slot))?;
        self.queue.ack();

        let desc = match FrameDescriptor::from_raw(&raw, self.region.len()) {
            Ok(desc) => desc,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(slot = msg.slot, error = %e, "dropping malformed frame");
                return Err(e);
            }
        };

        if self.last_format_version != Some(desc.format_version) {
            self.last_format_version = Some(desc.format_version);
            debug!(
                format = ?desc.format,
                width = desc.width,
                height = desc.height,
                version = desc.format_version,
                "frame format changed"
            );
            sink.on_format_change(&desc);
        }

        let payload = self
            .region
            .slice(desc.payload_offset as usize, desc.payload_size() as usize)?;

        trace!(serial = desc.serial, slot = msg.slot, "delivering frame");
        self.stats.received += 1;
        self.stats.last_serial = desc.serial;
        if sink.on_frame(&desc, payload) {
            Ok(FramePoll::Delivered)
        } else {
            Ok(FramePoll::SinkStop)
        }
    }

    /// Poll until stopped
    ///
    /// Sleeps the configured interval when idle, keeps going past dropped
    /// frames, and returns on fatal errors, sink stop or `running` going
    /// false.
    pub fn run(&mut self, sink: &mut dyn RenderSink, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            match self.poll(sink) {
                Ok(FramePoll::Delivered) => {}
                Ok(FramePoll::Idle) => std::thread::sleep(self.poll_interval),
                Ok(FramePoll::SinkStop) => break,
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
