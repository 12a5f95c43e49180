//! Relay Configuration
//!
//! All tunables live in one TOML file with sane defaults, so a bare
//! `RelayConfig::default()` is a working configuration. The producer is the
//! only side that consumes the geometry sections; the consumer derives
//! everything spatial from the region header and only uses the timing knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RelayError, Result};
use crate::protocol::RegionGeometry;
use crate::queue::MAX_QUEUE_CAPACITY;

// =============================================================================
// Sections
// =============================================================================

/// Frame channel geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameChannelConfig {
    /// Number of frame slots; bounds how many frames can be in flight
    pub slots: u32,
    /// Worst-case frame payload in bytes; slot size in the region
    pub max_frame_size: u32,
}

impl Default for FrameChannelConfig {
    fn default() -> Self {
        Self {
            slots: 3,
            // 4K BGRA with some pitch slack.
            max_frame_size: 34 * 1024 * 1024,
        }
    }
}

/// Cursor channel geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorChannelConfig {
    /// Position-only slots; cheap, so plenty of them
    pub position_slots: u32,
    /// Shape slots, cycled round-robin as the cursor image changes
    pub shape_slots: u32,
    /// Worst-case cursor bitmap in bytes
    pub max_shape_size: u32,
}

impl Default for CursorChannelConfig {
    fn default() -> Self {
        Self {
            position_slots: 16,
            shape_slots: 4,
            // 256x256 BGRA.
            max_shape_size: 256 * 1024 + 64,
        }
    }
}

/// Poll intervals, retry bounds and the handshake deadline
///
/// Every wait in the crate is a bounded poll governed by one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Consumer sleep between empty frame-queue polls, microseconds
    pub frame_poll_us: u64,
    /// Consumer sleep between empty cursor-queue polls, microseconds
    pub cursor_poll_us: u64,
    /// Producer sleep between post retries on a full queue, microseconds
    pub post_retry_us: u64,
    /// Post retries before the publication is counted as dropped
    pub post_retry_attempts: u32,
    /// Consumer attach handshake deadline, milliseconds
    pub handshake_timeout_ms: u64,
    /// Handshake poll interval, milliseconds
    pub handshake_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_poll_us: 1000,
            cursor_poll_us: 1000,
            post_retry_us: 500,
            post_retry_attempts: 200,
            handshake_timeout_ms: 10_000,
            handshake_poll_ms: 10,
        }
    }
}

impl TimingConfig {
    /// Frame poll interval as a duration
    pub fn frame_poll(&self) -> Duration {
        Duration::from_micros(self.frame_poll_us)
    }

    /// Cursor poll interval as a duration
    pub fn cursor_poll(&self) -> Duration {
        Duration::from_micros(self.cursor_poll_us)
    }

    /// Post retry interval as a duration
    pub fn post_retry(&self) -> Duration {
        Duration::from_micros(self.post_retry_us)
    }

    /// Handshake deadline as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Handshake poll interval as a duration
    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }
}

/// Damage accumulation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DamageConfig {
    /// Publications of damage history retained for buffer-age redraw plans
    pub history_length: usize,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self { history_length: 4 }
    }
}

// =============================================================================
// Top level
// =============================================================================

/// Complete relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Frame channel geometry
    pub frame: FrameChannelConfig,
    /// Cursor channel geometry
    pub cursor: CursorChannelConfig,
    /// Poll and retry timing
    pub timing: TimingConfig,
    /// Damage accumulation tuning
    pub damage: DamageConfig,
}

impl RelayConfig {
    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| RelayError::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        info!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.frame.slots == 0 || self.frame.slots > MAX_QUEUE_CAPACITY {
            return Err(RelayError::InvalidConfig(format!(
                "frame.slots must be 1..={MAX_QUEUE_CAPACITY}"
            )));
        }
        if self.frame.max_frame_size == 0 {
            return Err(RelayError::InvalidConfig(
                "frame.max_frame_size must be non-zero".into(),
            ));
        }
        let cursor_slots = self.cursor.position_slots + self.cursor.shape_slots;
        if self.cursor.position_slots == 0
            || self.cursor.shape_slots == 0
            || cursor_slots > MAX_QUEUE_CAPACITY
        {
            return Err(RelayError::InvalidConfig(format!(
                "cursor slots must be non-zero and total at most {MAX_QUEUE_CAPACITY}"
            )));
        }
        if self.cursor.max_shape_size == 0 {
            return Err(RelayError::InvalidConfig(
                "cursor.max_shape_size must be non-zero".into(),
            ));
        }
        if self.timing.post_retry_attempts == 0 || self.timing.handshake_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "timing retry and timeout values must be non-zero".into(),
            ));
        }
        if self.damage.history_length == 0 || self.damage.history_length > 16 {
            return Err(RelayError::InvalidConfig(
                "damage.history_length must be 1..=16".into(),
            ));
        }
        Ok(())
    }

    /// Region geometry the producer publishes in the header
    pub fn geometry(&self) -> RegionGeometry {
        RegionGeometry {
            frame_slots: self.frame.slots,
            frame_slot_size: self.frame.max_frame_size,
            cursor_pos_slots: self.cursor.position_slots,
            cursor_shape_slots: self.cursor.shape_slots,
            cursor_shape_slot_size: self.cursor.max_shape_size,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
