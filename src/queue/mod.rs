//! Shared-Memory Message Queue
//!
//! A fixed-capacity single-producer message ring living inside the shared
//! region. Used twice: once for the frame channel and once for the cursor
//! channel.
//!
//! A message is a (flags, slot) pair: the slot index names a payload slot
//! elsewhere in the region, so the ring itself stays tiny and the queue
//! never copies pixel data.
//!
//! # Protocol
//!
//! Two monotonically increasing positions live in the region:
//!
//! - `wpos`, advanced only by the producer when a message is posted,
//! - `rpos`, advanced only by the consumer when a message is acknowledged.
//!
//! `wpos - rpos` (wrapping) is the number of in-flight messages; the
//! producer must not post when it equals the capacity. A full queue is
//! backpressure, never permission to overwrite. The consumer additionally
//! keeps a process-local read cursor so a message is observed exactly once
//! even when acknowledgment is deferred.
//!
//! A subscriber word carries an edge-triggered "new subscriber" bit: set by
//! the consumer on (re)attach, cleared by the producer's poll. It is the
//! producer's cue to republish full state: a freshly joined consumer must
//! not be left waiting for a delta relative to state it never had.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::shm::SharedRegion;

// Header word offsets relative to the queue base.
const OFF_ID: usize = 0;
const OFF_CAPACITY: usize = 4;
const OFF_WPOS: usize = 8;
const OFF_RPOS: usize = 12;
const OFF_SUBS: usize = 16;
const HEADER_SIZE: usize = 24;
const ENTRY_SIZE: usize = 8;

const SUB_NEW: u32 = 0x1;

/// Largest supported ring capacity
///
/// Positions are wrapping u32s; a small bound keeps the in-flight window
/// unambiguous and the ring resident in a few cache lines.
pub const MAX_QUEUE_CAPACITY: u32 = 64;

/// One queue message: flags plus the index of the slot it describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Channel-specific flag bits (e.g. cursor POSITION/VISIBLE/SHAPE)
    pub flags: u32,
    /// Index of the payload slot this message refers to
    pub slot: u32,
}

/// A message ring mapped over the shared region
///
/// The producer side uses [`post`](Self::post), [`pending`](Self::pending)
/// and [`has_new_subscriber`](Self::has_new_subscriber); the consumer side
/// uses [`subscribe`](Self::subscribe), [`read`](Self::read) and
/// [`ack`](Self::ack). Both sides may hold a `Queue` over the same bytes.
pub struct Queue {
    region: Arc<SharedRegion>,
    base: usize,
    id: u32,
    capacity: u32,
    /// Consumer-local cursor: position of the next unobserved message
    next: u32,
}

impl Queue {
    /// Bytes a queue of `capacity` messages occupies in the region
    pub fn size_for(capacity: u32) -> usize {
        HEADER_SIZE + capacity as usize * ENTRY_SIZE
    }

    /// Initialize a queue at `base` (producer side)
    pub fn create(region: Arc<SharedRegion>, base: usize, id: u32, capacity: u32) -> Result<Self> {
        if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(RelayError::InvalidConfig(format!(
                "queue capacity {capacity} out of range 1..={MAX_QUEUE_CAPACITY}"
            )));
        }
        region.write_pod::<u32>(base + OFF_ID, id)?;
        region.write_pod::<u32>(base + OFF_CAPACITY, capacity)?;
        region.atomic_u32(base + OFF_WPOS)?.store(0, Ordering::Release);
        region.atomic_u32(base + OFF_RPOS)?.store(0, Ordering::Release);
        region.atomic_u32(base + OFF_SUBS)?.store(0, Ordering::Release);
        Ok(Self {
            region,
            base,
            id,
            capacity,
            next: 0,
        })
    }

    /// Attach to an existing queue at `base` (consumer side)
    ///
    /// The geometry is read back out of the region and checked against what
    /// this build expects; a disagreeing peer is a protocol mismatch, not
    /// something to limp along with.
    pub fn attach(region: Arc<SharedRegion>, base: usize, expect_id: u32) -> Result<Self> {
        let id = region.read_pod::<u32>(base + OFF_ID)?;
        let capacity = region.read_pod::<u32>(base + OFF_CAPACITY)?;
        if id != expect_id || capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(RelayError::ProtocolMismatch {
                expected: format!("queue id {expect_id}, capacity 1..={MAX_QUEUE_CAPACITY}"),
                found: format!("queue id {id}, capacity {capacity}"),
            });
        }
        // Fail early if the ring tail is out of bounds.
        region.check_range(base, Self::size_for(capacity))?;
        let next = region.atomic_u32(base + OFF_WPOS)?.load(Ordering::Acquire);
        Ok(Self {
            region,
            base,
            id,
            capacity,
            next,
        })
    }

    /// Queue identifier
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Fixed ring capacity
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn wpos(&self) -> &std::sync::atomic::AtomicU32 {
        // Bounds were validated at construction.
        self.region.atomic_u32(self.base + OFF_WPOS).expect("queue wpos")
    }

    fn rpos(&self) -> &std::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + OFF_RPOS).expect("queue rpos")
    }

    fn subs(&self) -> &std::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + OFF_SUBS).expect("queue subs")
    }

    fn entry_offset(&self, pos: u32) -> usize {
        self.base + HEADER_SIZE + (pos % self.capacity) as usize * ENTRY_SIZE
    }

    // -------------------------------------------------------------------------
    // Producer side
    // -------------------------------------------------------------------------

    /// Number of posted but not yet acknowledged messages
    pub fn pending(&self) -> u32 {
        let w = self.wpos().load(Ordering::Acquire);
        let r = self.rpos().load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Post a message; fails with `QueueFull` when no slot is free
    ///
    /// The caller retries after a short bounded sleep. A full ring means the
    /// consumer has unacknowledged messages; overwriting one is never an
    /// option.
    pub fn post(&self, flags: u32, slot: u32) -> Result<()> {
        if self.pending() >= self.capacity {
            return Err(RelayError::QueueFull(self.id));
        }
        let w = self.wpos().load(Ordering::Relaxed);
        let entry = self.entry_offset(w);
        self.region.write_pod::<u32>(entry, flags)?;
        self.region.write_pod::<u32>(entry + 4, slot)?;
        // Entry bytes land before the position advance makes them visible.
        self.wpos().store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consume the new-subscriber edge
    ///
    /// Returns `true` exactly once per (re)subscription; the producer polls
    /// this each cycle and republishes full state on `true`.
    pub fn has_new_subscriber(&self) -> bool {
        self.subs().fetch_and(!SUB_NEW, Ordering::AcqRel) & SUB_NEW != 0
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// Announce this consumer to the producer, skipping any backlog
    ///
    /// Messages posted before subscription describe state the producer is
    /// about to resend in full, so the cursor jumps straight to the write
    /// position.
    pub fn subscribe(&mut self) {
        let w = self.wpos().load(Ordering::Acquire);
        self.next = w;
        self.rpos().store(w, Ordering::Release);
        self.subs().fetch_or(SUB_NEW, Ordering::AcqRel);
    }

    /// Observe the oldest unobserved message, if any
    ///
    /// Never blocks; the poll loop above this supplies the bounded sleep.
    /// Each message is returned once; acknowledgment via [`ack`](Self::ack)
    /// is what frees the slot for producer reuse.
    pub fn read(&mut self) -> Option<Message> {
        let w = self.wpos().load(Ordering::Acquire);
        if self.next == w {
            return None;
        }
        let entry = self.entry_offset(self.next);
        let flags = self.region.read_pod::<u32>(entry).ok()?;
        let slot = self.region.read_pod::<u32>(entry + 4).ok()?;
        self.next = self.next.wrapping_add(1);
        Some(Message { flags, slot })
    }

    /// Acknowledge the oldest observed message, releasing its slot
    ///
    /// A no-op when nothing is pending: the read position must never pass
    /// the write position, or the in-flight count wraps and the producer
    /// wedges in `QueueFull` for the rest of the session.
    pub fn ack(&self) {
        let w = self.wpos().load(Ordering::Acquire);
        let r = self.rpos().load(Ordering::Acquire);
        if r == w {
            return;
        }
        self.rpos().store(r.wrapping_add(1), Ordering::Release);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
