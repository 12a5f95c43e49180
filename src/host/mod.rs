//! Producer Session
//!
//! [`RelayHost`] owns the producer side end to end: it sizes and initializes
//! the region, writes the header, creates both queues and hands out the two
//! publishers. The capture loop drives it with one [`service`](RelayHost::service)
//! call per cycle, which answers consumer restart requests and re-sends full
//! state to new subscribers.
//!
//! The frame publisher stays with the capture thread; the cursor publisher
//! sits behind a mutex because cursor callbacks typically arrive on a
//! different thread than the frame clock.

use std::path::Path;
use std::sync::Arc;

use enumflags2::BitFlags;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::cursor::CursorPublisher;
use crate::error::{RelayError, Result};
use crate::frame::FramePublisher;
use crate::protocol::{
    self, Feature, RegionLayout, Status, CURSOR_QUEUE_ID, FRAME_QUEUE_ID,
};
use crate::queue::Queue;
use crate::shm::SharedRegion;

/// Producer side of a relay session
pub struct RelayHost {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    frame: FramePublisher,
    cursor: Mutex<CursorPublisher>,
    paused: bool,
}

impl RelayHost {
    /// Initialize a relay session over an existing region
    ///
    /// Writes the header last, so a consumer can never attach to a region
    /// whose queues are not yet in place.
    pub fn create(
        region: Arc<SharedRegion>,
        config: &RelayConfig,
        features: BitFlags<Feature>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = RegionLayout::compute(config.geometry())?;

        let frame_queue = Queue::create(
            region.clone(),
            layout.frame_queue(),
            FRAME_QUEUE_ID,
            layout.geometry().frame_slots,
        )?;
        let cursor_capacity =
            layout.geometry().cursor_pos_slots + layout.geometry().cursor_shape_slots;
        let cursor_queue = Queue::create(
            region.clone(),
            layout.cursor_queue(),
            CURSOR_QUEUE_ID,
            cursor_capacity,
        )?;
        protocol::write_header(&region, features, &layout)?;

        info!(
            size = layout.total_size(),
            frame_slots = layout.geometry().frame_slots,
            ?features,
            "relay region initialized"
        );
        Ok(Self {
            frame: FramePublisher::new(region.clone(), layout.clone(), frame_queue, &config.timing),
            cursor: Mutex::new(CursorPublisher::new(
                region.clone(),
                layout.clone(),
                cursor_queue,
                &config.timing,
            )),
            region,
            layout,
            paused: false,
        })
    }

    /// Create a region file sized for the configuration and start a session
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        config: &RelayConfig,
        features: BitFlags<Feature>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = RegionLayout::compute(config.geometry())?;
        let region = Arc::new(SharedRegion::create_file(path, layout.total_size())?);
        Self::create(region, config, features)
    }

    /// The shared region
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// The computed region layout
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Frame publisher, used from the capture loop
    pub fn frame(&mut self) -> &mut FramePublisher {
        &mut self.frame
    }

    /// Cursor publisher, locked per update
    pub fn cursor(&self) -> MutexGuard<'_, CursorPublisher> {
        self.cursor.lock()
    }

    /// One housekeeping tick, called once per capture cycle
    ///
    /// Consumes a pending restart request (releasing the consumer from its
    /// attach handshake) and re-sends full state on either channel if a new
    /// subscriber announced itself. A repost against a full queue is skipped
    /// for this tick, not treated as fatal; the subscriber's next frame
    /// covers it. Returns `true` when anything happened.
    pub fn service(&mut self) -> Result<bool> {
        let restarted = protocol::take_restart_request(&self.region)?;
        if restarted {
            debug!("acknowledged consumer restart request");
        }
        let frame = match self.frame.repost_for_new_subscriber() {
            Ok(did) => did,
            Err(RelayError::QueueFull(id)) => {
                warn!(queue = id, "frame repost skipped, queue full");
                false
            }
            Err(e) => return Err(e),
        };
        let cursor = match self.cursor.lock().repost_for_new_subscriber() {
            Ok(did) => did,
            Err(RelayError::QueueFull(id)) => {
                warn!(queue = id, "cursor repost skipped, queue full");
                false
            }
            Err(e) => return Err(e),
        };
        Ok(restarted || frame || cursor)
    }

    /// Suspend or resume publication
    ///
    /// While paused the consumer idles on the status bit; frames published
    /// anyway would queue up against a reader that is not acking.
    pub fn set_paused(&mut self, paused: bool) -> Result<()> {
        if paused == self.paused {
            return Ok(());
        }
        self.paused = paused;
        if paused {
            protocol::raise_status(&self.region, Status::Paused)?;
        } else {
            protocol::clear_status(&self.region, Status::Paused)?;
        }
        info!(paused, "publication pause state changed");
        Ok(())
    }

    /// Whether publication is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::Rotation;
    use crate::frame::{FrameMetadata, PixelFormat};
    use crate::protocol::read_header;

    fn small_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.frame.slots = 2;
        config.frame.max_frame_size = 64 * 1024;
        config.cursor.max_shape_size = 4096;
        config.timing.post_retry_us = 10;
        config.timing.post_retry_attempts = 2;
        config
    }

    #[test]
    fn test_create_writes_attachable_header() {
        let config = small_config();
        let layout = RegionLayout::compute(config.geometry()).unwrap();
        let region = Arc::new(SharedRegion::anon(layout.total_size()));
        let features = Feature::PartialDamage | Feature::CursorRelay;
        let _host = RelayHost::create(region.clone(), &config, features).unwrap();

        let (read_features, read_layout) = read_header(&region).unwrap();
        assert_eq!(read_features, features);
        assert_eq!(read_layout.geometry(), layout.geometry());
    }

    #[test]
    fn test_region_too_small_rejected() {
        let config = small_config();
        let region = Arc::new(SharedRegion::anon(1024));
        assert!(RelayHost::create(region, &config, BitFlags::empty()).is_err());
    }

    #[test]
    fn test_service_answers_restart() {
        let config = small_config();
        let layout = RegionLayout::compute(config.geometry()).unwrap();
        let region = Arc::new(SharedRegion::anon(layout.total_size()));
        let mut host = RelayHost::create(region.clone(), &config, BitFlags::empty()).unwrap();

        assert!(!host.service().unwrap());
        protocol::raise_status(&region, Status::Restart).unwrap();
        assert!(host.service().unwrap());
        assert!(!protocol::status_set(&region, Status::Restart).unwrap());
    }

    #[test]
    fn test_service_tolerates_full_queue_on_repost() {
        let config = small_config();
        let layout = RegionLayout::compute(config.geometry()).unwrap();
        let region = Arc::new(SharedRegion::anon(layout.total_size()));
        let mut host = RelayHost::create(region.clone(), &config, BitFlags::empty()).unwrap();

        let m = FrameMetadata {
            format: PixelFormat::Bgra,
            screen_width: 32,
            screen_height: 32,
            width: 32,
            height: 32,
            stride: 32,
            pitch: 32 * 4,
            rotation: Rotation::Rot0,
            damage: vec![],
        };
        let payload = vec![0u8; 32 * 32 * 4];
        let mut consumer =
            Queue::attach(region.clone(), layout.frame_queue(), FRAME_QUEUE_ID).unwrap();
        consumer.subscribe();
        host.frame().publish(&m, &payload).unwrap();
        host.frame().publish(&m, &payload).unwrap();

        // The ring is full and nobody is acking; a new subscriber's repost
        // cannot post, but the tick must survive it.
        assert!(!host.service().unwrap());
        assert_eq!(host.frame().stats().reposted(), 0);
    }

    #[test]
    fn test_pause_toggles_status_bit() {
        let config = small_config();
        let layout = RegionLayout::compute(config.geometry()).unwrap();
        let region = Arc::new(SharedRegion::anon(layout.total_size()));
        let mut host = RelayHost::create(region.clone(), &config, BitFlags::empty()).unwrap();

        host.set_paused(true).unwrap();
        assert!(protocol::status_set(&region, Status::Paused).unwrap());
        // Idempotent.
        host.set_paused(true).unwrap();
        host.set_paused(false).unwrap();
        assert!(!protocol::status_set(&region, Status::Paused).unwrap());
    }

    #[test]
    fn test_file_backed_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.shm");
        let config = small_config();
        let host = RelayHost::create_file(&path, &config, BitFlags::empty()).unwrap();

        let expected = RegionLayout::compute(config.geometry()).unwrap().total_size();
        assert_eq!(host.region().len(), expected);
        assert!(path.exists());
    }
}
