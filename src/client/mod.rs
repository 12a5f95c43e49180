//! Consumer Session
//!
//! [`RelayClient`] performs the attach sequence: map the region, validate
//! the header, then run the restart handshake so the producer knows to
//! re-send full state. Only after the handshake succeeds does it hand out
//! channel consumers; everything spatial comes from the header, never from
//! local configuration.

use std::path::Path;
use std::sync::Arc;

use enumflags2::BitFlags;
use tracing::info;

use crate::config::TimingConfig;
use crate::cursor::CursorConsumer;
use crate::error::Result;
use crate::frame::FrameConsumer;
use crate::protocol::{self, Feature, RegionLayout, Status};
use crate::shm::SharedRegion;

/// Consumer side of a relay session
pub struct RelayClient {
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    features: BitFlags<Feature>,
    timing: TimingConfig,
}

impl RelayClient {
    /// Attach to an initialized region and complete the restart handshake
    ///
    /// Blocks (bounded by the handshake timeout) until the producer
    /// acknowledges; fails fast on magic or version disagreement.
    pub fn attach(region: Arc<SharedRegion>, timing: &TimingConfig) -> Result<Self> {
        let (features, layout) = protocol::read_header(&region)?;
        protocol::request_restart(&region, timing.handshake_timeout(), timing.handshake_poll())?;
        info!(?features, "attached to relay session");
        Ok(Self {
            region,
            layout,
            features,
            timing: timing.clone(),
        })
    }

    /// Map a region file and attach
    pub fn open_file<P: AsRef<Path>>(path: P, timing: &TimingConfig) -> Result<Self> {
        let region = Arc::new(SharedRegion::open_file(path)?);
        Self::attach(region, timing)
    }

    /// Capabilities the producer advertised
    pub fn features(&self) -> BitFlags<Feature> {
        self.features
    }

    /// The region layout derived from the header
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// The shared region
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Subscribe to the frame channel
    pub fn frame_consumer(&self) -> Result<FrameConsumer> {
        FrameConsumer::new(self.region.clone(), self.layout.clone(), &self.timing)
    }

    /// Subscribe to the cursor channel
    pub fn cursor_consumer(&self) -> Result<CursorConsumer> {
        CursorConsumer::new(self.region.clone(), self.layout.clone(), &self.timing)
    }

    /// Whether the producer currently has publication paused
    pub fn is_paused(&self) -> Result<bool> {
        protocol::status_set(&self.region, Status::Paused)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("features", &self.features)
            .field("region_len", &self.region.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
