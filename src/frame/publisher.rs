//! Frame Publication
//!
//! The producer side of the frame channel. Publication is claim-then-fill
//! shaped: a slot is claimed and described first, the pixel payload is
//! copied in (possibly on another thread), and only the finalize step posts
//! the queue message that makes the frame visible. A consumer therefore
//! never observes a slot that is not fully described.
//!
//! Backpressure is explicit. A slot stays pinned from claim to consumer
//! acknowledgment; when none is free the publisher retries with a bounded
//! sleep and then counts the frame as dropped rather than overwrite
//! in-flight data.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, trace, warn};

use crate::config::TimingConfig;
use crate::damage::{DamageRect, Rotation, MAX_DAMAGE_RECTS};
use crate::error::{RelayError, Result};
use crate::protocol::RegionLayout;
use crate::queue::Queue;
use crate::shm::SharedRegion;

use super::{PixelFormat, RawFrameDescriptor};

// =============================================================================
// Metadata and stats
// =============================================================================

/// Everything the producer knows about one captured frame
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Pixel format of the payload about to be copied
    pub format: PixelFormat,
    /// Full desktop width in pixels
    pub screen_width: u32,
    /// Full desktop height in pixels
    pub screen_height: u32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Row length in pixels
    pub stride: u32,
    /// Row length in bytes
    pub pitch: u32,
    /// Display rotation at capture
    pub rotation: Rotation,
    /// Regions changed since the previous capture; empty means everything
    pub damage: Vec<DamageRect>,
}

/// Publication counters, shared with in-flight [`PendingFrame`]s
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    dropped: AtomicU64,
    reposted: AtomicU64,
    copy_failures: AtomicU64,
}

impl PublisherStats {
    /// Frames successfully posted
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames dropped to backpressure or failed copies
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames re-posted for late subscribers
    pub fn reposted(&self) -> u64 {
        self.reposted.load(Ordering::Relaxed)
    }

    /// Payload copies that failed before finalize
    pub fn copy_failures(&self) -> u64 {
        self.copy_failures.load(Ordering::Relaxed)
    }
}

const NO_SLOT: u32 = u32::MAX;

#[derive(Debug)]
struct Shared {
    stats: PublisherStats,
    /// Most recent fully published slot, `NO_SLOT` before the first frame
    last_valid: AtomicU32,
    /// Claims handed out as [`PendingFrame`]s that have not finalized yet
    ///
    /// Counted alongside the posted-but-unacked queue messages so the slot
    /// ring can never cycle back onto a slot whose copy is still running.
    in_flight: AtomicU32,
}

// =============================================================================
// Publisher
// =============================================================================

/// Producer side of the frame channel
pub struct FramePublisher {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    queue: Arc<Queue>,
    shared: Arc<Shared>,
    slot_index: u32,
    serial: u64,
    format_version: u32,
    /// (format, width, height, stride, pitch) of the previous publication
    last_shape: Option<(PixelFormat, u32, u32, u32, u32)>,
    /// Publications left that must carry full damage after a format change
    force_full: u32,
    retry_interval: std::time::Duration,
    retry_attempts: u32,
}

impl FramePublisher {
    /// Create the publisher over a freshly initialized frame queue
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        layout: RegionLayout,
        queue: Queue,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            region,
            layout,
            queue: Arc::new(queue),
            shared: Arc::new(Shared {
                stats: PublisherStats::default(),
                last_valid: AtomicU32::new(NO_SLOT),
                in_flight: AtomicU32::new(0),
            }),
            slot_index: 0,
            serial: 0,
            format_version: 0,
            last_shape: None,
            force_full: 0,
            retry_interval: timing.post_retry(),
            retry_attempts: timing.post_retry_attempts,
        }
    }

    /// Publication counters
    pub fn stats(&self) -> &PublisherStats {
        &self.shared.stats
    }

    /// Claim the next slot and write its descriptor
    ///
    /// The returned handle exposes the slot's payload range; publication
    /// happens when [`PendingFrame::finish`] is called with a successful
    /// copy. Fails with `QueueFull` once the bounded retry budget is spent,
    /// counting the frame as dropped.
    pub fn begin(&mut self, meta: &FrameMetadata) -> Result<PendingFrame> {
        let payload_size = meta.format.payload_size(meta.width, meta.height, meta.pitch);
        let slot_size = self.layout.geometry().frame_slot_size as u64;
        if payload_size > slot_size {
            return Err(RelayError::SlotOverflow {
                size: payload_size as usize,
                capacity: slot_size as usize,
            });
        }

        self.wait_writable()?;

        let shape = (meta.format, meta.width, meta.height, meta.stride, meta.pitch);
        if self.last_shape != Some(shape) {
            if self.last_shape.is_some() {
                debug!(?shape, "frame shape changed, bumping format version");
            }
            self.last_shape = Some(shape);
            self.format_version = self.format_version.wrapping_add(1);
            // The next publications must not assume the consumer has any
            // usable previous contents in the new shape.
            self.force_full = 2;
        }

        let damage = if self.force_full > 0 {
            self.force_full -= 1;
            Vec::new()
        } else {
            clamp_damage(&meta.damage, meta.width, meta.height)
        };

        self.serial += 1;
        self.slot_index = (self.slot_index + 1) % self.layout.geometry().frame_slots;
        let slot = self.slot_index;
        self.write_descriptor(slot, meta, &damage)?;
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);

        trace!(slot, serial = self.serial, "frame slot claimed");
        Ok(PendingFrame {
            region: self.region.clone(),
            queue: self.queue.clone(),
            shared: self.shared.clone(),
            slot,
            payload_offset: self.layout.frame_payload(slot),
            payload_len: payload_size as usize,
            retry_interval: self.retry_interval,
            retry_attempts: self.retry_attempts,
            finished: false,
        })
    }

    /// Synchronous convenience: claim, copy and post in one call
    pub fn publish(&mut self, meta: &FrameMetadata, payload: &[u8]) -> Result<()> {
        let mut pending = self.begin(meta)?;
        let ok = pending.copy_from(payload);
        pending.finish(ok)
    }

    /// Re-post the last published frame if a new subscriber appeared
    ///
    /// A freshly attached consumer has no previous frame to apply deltas to,
    /// so the repost carries full damage. Returns `true` when a repost
    /// happened.
    pub fn repost_for_new_subscriber(&mut self) -> Result<bool> {
        if !self.queue.has_new_subscriber() {
            return Ok(false);
        }
        let slot = self.shared.last_valid.load(Ordering::Acquire);
        if slot == NO_SLOT {
            // Nothing published yet; the first real frame serves.
            return Ok(false);
        }

        let mut raw: RawFrameDescriptor = self.region.read_pod(self.layout.frame_slot(slot))?;
        self.serial += 1;
        raw.serial = self.serial;
        raw.damage_count = 0;
        self.region.write_pod(self.layout.frame_slot(slot), raw)?;

        post_with_retry(&self.queue, 0, slot, self.retry_interval, self.retry_attempts)?;
        self.shared.stats.reposted.fetch_add(1, Ordering::Relaxed);
        debug!(slot, "re-posted last frame for new subscriber");
        Ok(true)
    }

    /// Block until a slot is free for a new claim
    ///
    /// Posted-but-unacked messages and claimed-but-unfinalized frames both
    /// pin their slot; only when the two together leave room may the ring
    /// advance.
    fn wait_writable(&self) -> Result<()> {
        let mut attempts = 0;
        loop {
            let outstanding =
                self.queue.pending() + self.shared.in_flight.load(Ordering::Acquire);
            if outstanding < self.queue.capacity() {
                return Ok(());
            }
            attempts += 1;
            if attempts > self.retry_attempts {
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("frame queue full, dropping frame");
                return Err(RelayError::QueueFull(self.queue.id()));
            }
            std::thread::sleep(self.retry_interval);
        }
    }

    fn write_descriptor(
        &self,
        slot: u32,
        meta: &FrameMetadata,
        damage: &[DamageRect],
    ) -> Result<()> {
        let mut rects = [[0u32; 4]; MAX_DAMAGE_RECTS];
        for (dst, rect) in rects.iter_mut().zip(damage) {
            *dst = [rect.x, rect.y, rect.width, rect.height];
        }
        let raw = RawFrameDescriptor {
            format: meta.format.to_wire(),
            screen_width: meta.screen_width,
            screen_height: meta.screen_height,
            width: meta.width,
            height: meta.height,
            stride: meta.stride,
            pitch: meta.pitch,
            rotation: meta.rotation.to_wire(),
            format_version: self.format_version,
            damage_count: damage.len() as u32,
            serial: self.serial,
            payload_offset: self.layout.frame_payload(slot) as u64,
            damage: rects,
        };
        self.region.write_pod(self.layout.frame_slot(slot), raw)
    }
}

/// Clamp damage to the frame and fall back to full on anything unusable
fn clamp_damage(damage: &[DamageRect], width: u32, height: u32) -> Vec<DamageRect> {
    if damage.is_empty() || damage.len() > MAX_DAMAGE_RECTS {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(damage.len());
    for rect in damage {
        if rect.x >= width || rect.y >= height {
            continue;
        }
        let clamped = DamageRect {
            x: rect.x,
            y: rect.y,
            width: rect.width.min(width - rect.x),
            height: rect.height.min(height - rect.y),
        };
        if !clamped.is_degenerate() {
            out.push(clamped);
        }
    }
    if out.is_empty() {
        // Every rect was degenerate; treat as a full update.
        return Vec::new();
    }
    out
}

fn post_with_retry(
    queue: &Queue,
    flags: u32,
    slot: u32,
    interval: std::time::Duration,
    attempts: u32,
) -> Result<()> {
    let mut tries = 0;
    loop {
        match queue.post(flags, slot) {
            Ok(()) => return Ok(()),
            Err(RelayError::QueueFull(_)) if tries < attempts => {
                tries += 1;
                std::thread::sleep(interval);
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Pending frame
// =============================================================================

/// A claimed slot whose payload is still being filled
///
/// Dropping the handle without calling [`finish`](Self::finish) counts as a
/// failed copy; the slot simply returns to rotation on the next claim.
pub struct PendingFrame {
    region: Arc<SharedRegion>,
    queue: Arc<Queue>,
    shared: Arc<Shared>,
    slot: u32,
    payload_offset: usize,
    payload_len: usize,
    retry_interval: std::time::Duration,
    retry_attempts: u32,
    finished: bool,
}

impl PendingFrame {
    /// Slot index this frame occupies
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Expected payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// The slot's payload range, for direct capture writes
    pub fn payload_mut(&mut self) -> Result<&mut [u8]> {
        self.region.slice_mut(self.payload_offset, self.payload_len)
    }

    /// Copy a complete payload in; returns whether the copy succeeded
    pub fn copy_from(&mut self, payload: &[u8]) -> bool {
        if payload.len() != self.payload_len {
            warn!(
                got = payload.len(),
                want = self.payload_len,
                "payload length mismatch"
            );
            return false;
        }
        match self.payload_mut() {
            Ok(dst) => {
                dst.copy_from_slice(payload);
                true
            }
            Err(e) => {
                warn!(error = %e, "payload copy failed");
                false
            }
        }
    }

    /// Finalize the publication
    ///
    /// With `copy_ok` the frame is posted to the queue (bounded retry on a
    /// full ring). Without it the publication is abandoned and the slot is
    /// immediately reusable; nothing was ever visible to the consumer.
    pub fn finish(mut self, copy_ok: bool) -> Result<()> {
        self.finished = true;
        self.finalize(copy_ok)
    }

    fn finalize(&mut self, copy_ok: bool) -> Result<()> {
        let result = if !copy_ok {
            self.shared.stats.copy_failures.fetch_add(1, Ordering::Relaxed);
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            match post_with_retry(
                &self.queue,
                0,
                self.slot,
                self.retry_interval,
                self.retry_attempts,
            ) {
                Ok(()) => {
                    self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
                    self.shared.last_valid.store(self.slot, Ordering::Release);
                    Ok(())
                }
                Err(e) => {
                    self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        };
        // Release the claim only after a successful post is counted as
        // pending, so the slot stays pinned throughout.
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

impl Drop for PendingFrame {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finalize(false);
        }
    }
}

// =============================================================================
// Copy worker
// =============================================================================

struct CopyJob {
    frame: PendingFrame,
    data: Vec<u8>,
}

/// Background payload-copy thread
///
/// Decouples capture from the memcpy into the region: the capture path
/// claims a slot, hands the pending frame plus its bytes over a channel and
/// goes back to capturing while the worker copies and finalizes.
pub struct CopyWorker {
    tx: Option<Sender<CopyJob>>,
    handle: Option<JoinHandle<()>>,
}

impl CopyWorker {
    /// Spawn the worker thread
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<CopyJob>();
        let handle = std::thread::Builder::new()
            .name("frame-copy".into())
            .spawn(move || {
                for mut job in rx {
                    let ok = job.frame.copy_from(&job.data);
                    if let Err(e) = job.frame.finish(ok) {
                        warn!(error = %e, "frame finalize failed");
                    }
                }
            })
            .ok();
        Self {
            tx: Some(tx),
            handle,
        }
    }

    /// Queue a pending frame and its payload for copy and finalize
    pub fn submit(&self, frame: PendingFrame, data: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            RelayError::InvalidConfig("copy worker already shut down".into())
        })?;
        tx.send(CopyJob { frame, data }).map_err(|_| {
            RelayError::InvalidConfig("copy worker thread exited".into())
        })
    }
}

impl Drop for CopyWorker {
    fn drop(&mut self) {
        // Close the channel so the worker drains and exits.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RegionGeometry, FRAME_QUEUE_ID};

    fn small_setup() -> (Arc<SharedRegion>, RegionLayout, FramePublisher) {
        let layout = RegionLayout::compute(RegionGeometry {
            frame_slots: 2,
            frame_slot_size: 64 * 1024,
            cursor_pos_slots: 4,
            cursor_shape_slots: 2,
            cursor_shape_slot_size: 1024,
        })
        .unwrap();
        let region = Arc::new(SharedRegion::anon(layout.total_size()));
        let queue = Queue::create(
            region.clone(),
            layout.frame_queue(),
            FRAME_QUEUE_ID,
            layout.geometry().frame_slots,
        )
        .unwrap();
        let timing = TimingConfig {
            post_retry_us: 10,
            post_retry_attempts: 2,
            ..TimingConfig::default()
        };
        let publisher = FramePublisher::new(region.clone(), layout.clone(), queue, &timing);
        (region, layout, publisher)
    }

    fn meta(width: u32, height: u32) -> FrameMetadata {
        FrameMetadata {
            format: PixelFormat::Bgra,
            screen_width: width,
            screen_height: height,
            width,
            height,
            stride: width,
            pitch: width * 4,
            rotation: Rotation::Rot0,
            damage: vec![],
        }
    }

    #[test]
    fn test_publish_posts_message() {
        let (region, layout, mut publisher) = small_setup();
        let payload = vec![0xaau8; 64 * 64 * 4];
        publisher.publish(&meta(64, 64), &payload).unwrap();

        let mut consumer = Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID).unwrap();
        // Attach after the post still sees it via the initial cursor.
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(1)).unwrap();
        assert_eq!(raw.serial, 1);
        assert_eq!(raw.width, 64);
        assert_eq!(consumer.read(), None); // cursor starts at wpos
        assert_eq!(publisher.stats().published(), 1);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (_region, _layout, mut publisher) = small_setup();
        let result = publisher.begin(&meta(1024, 1024));
        assert!(matches!(result, Err(RelayError::SlotOverflow { .. })));
    }

    #[test]
    fn test_backpressure_drops_after_retries() {
        let (_region, _layout, mut publisher) = small_setup();
        let payload = vec![0u8; 64 * 64 * 4];
        publisher.publish(&meta(64, 64), &payload).unwrap();
        publisher.publish(&meta(64, 64), &payload).unwrap();
        // No consumer acking; the ring (capacity 2) is now full.
        assert!(matches!(
            publisher.publish(&meta(64, 64), &payload),
            Err(RelayError::QueueFull(_))
        ));
        assert_eq!(publisher.stats().dropped(), 1);
    }

    #[test]
    fn test_format_change_forces_full_damage() {
        let (region, layout, mut publisher) = small_setup();
        let payload = vec![0u8; 64 * 64 * 4];
        let mut m = meta(64, 64);
        m.damage = vec![DamageRect::new(0, 0, 8, 8)];
        publisher.publish(&m, &payload).unwrap();
        // First ever publication also counts as a shape change: full damage.
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(1)).unwrap();
        assert_eq!(raw.damage_count, 0);

        // Second after the change is still forced full.
        publisher.publish(&m, &payload).unwrap();
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(0)).unwrap();
        assert_eq!(raw.damage_count, 0);

        // Drain so the queue stays writable.
        let mut consumer = Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID).unwrap();
        consumer.ack();
        consumer.ack();

        // Third publication carries the real rects again.
        publisher.publish(&m, &payload).unwrap();
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(1)).unwrap();
        assert_eq!(raw.damage_count, 1);
        assert_eq!(raw.format_version, 1);
    }

    #[test]
    fn test_inflight_claims_pin_their_slots() {
        let (region, layout, mut publisher) = small_setup();
        let mut consumer =
            Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID).unwrap();

        let mut first = publisher.begin(&meta(64, 64)).unwrap();
        let second = publisher.begin(&meta(64, 64)).unwrap();
        assert_eq!(first.slot(), 1);
        assert_eq!(second.slot(), 0);

        // Both slots are claimed and unposted; a third claim must not cycle
        // back over the first one and rewrite its descriptor.
        assert!(matches!(
            publisher.begin(&meta(64, 64)),
            Err(RelayError::QueueFull(_))
        ));
        assert_eq!(publisher.stats().dropped(), 1);

        assert!(first.copy_from(&vec![1u8; 64 * 64 * 4]));
        first.finish(true).unwrap();
        // The posted message still refers to the first claim's descriptor.
        let msg = consumer.read().unwrap();
        assert_eq!(msg.slot, 1);
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(1)).unwrap();
        assert_eq!(raw.serial, 1);

        // Acking the post and releasing the other claim frees the ring.
        consumer.ack();
        drop(second);
        publisher.begin(&meta(64, 64)).unwrap();
    }

    #[test]
    fn test_abandoned_pending_frame_is_not_visible() {
        let (_region, _layout, mut publisher) = small_setup();
        {
            let pending = publisher.begin(&meta(64, 64)).unwrap();
            drop(pending);
        }
        assert_eq!(publisher.stats().published(), 0);
        assert_eq!(publisher.stats().copy_failures(), 1);
        // The slot was never posted, so the ring is still empty.
        assert_eq!(publisher.queue.pending(), 0);
    }

    #[test]
    fn test_repost_for_new_subscriber() {
        let (region, layout, mut publisher) = small_setup();
        let payload = vec![7u8; 64 * 64 * 4];
        let mut m = meta(64, 64);
        publisher.publish(&m, &payload).unwrap();
        publisher.publish(&m, &payload).unwrap();

        let mut consumer = Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID).unwrap();
        consumer.subscribe();
        // Damage on the wire would normally be partial by now.
        m.damage = vec![DamageRect::new(1, 1, 2, 2)];

        assert!(publisher.repost_for_new_subscriber().unwrap());
        assert!(!publisher.repost_for_new_subscriber().unwrap());
        assert_eq!(publisher.stats().reposted(), 1);

        let msg = consumer.read().unwrap();
        let raw: RawFrameDescriptor = region.read_pod(layout.frame_slot(msg.slot)).unwrap();
        assert_eq!(raw.damage_count, 0);
        assert_eq!(raw.serial, 3);
    }

    #[test]
    fn test_copy_worker_publishes() {
        let (region, layout, mut publisher) = small_setup();
        let worker = CopyWorker::spawn();
        let pending = publisher.begin(&meta(64, 64)).unwrap();
        worker.submit(pending, vec![3u8; 64 * 64 * 4]).unwrap();
        drop(worker); // joins the thread

        assert_eq!(publisher.stats().published(), 1);
        let payload = region.slice(layout.frame_payload(1), 8).unwrap();
        assert_eq!(payload, &[3u8; 8]);
    }

    #[test]
    fn test_damage_clamped_to_frame() {
        let rects = vec![
            DamageRect::new(60, 60, 20, 20),
            DamageRect::new(100, 0, 5, 5),
        ];
        let clamped = clamp_damage(&rects, 64, 64);
        assert_eq!(clamped, vec![DamageRect::new(60, 60, 4, 4)]);
    }
}
