//! Relay Error Types
//!
//! Error taxonomy for the shared-memory transport. The split follows the
//! recovery strategy: `ProtocolMismatch` is fatal on attach, `QueueFull` is
//! retried by the publisher, and the `Malformed*` variants discard a single
//! message while the consumer loop keeps running.

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Shared-memory relay error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Region magic or protocol version does not match
    ///
    /// Fatal: the consumer must never interpret a region whose version it
    /// does not recognize.
    #[error("protocol mismatch: expected {expected}, found {found}")]
    ProtocolMismatch {
        /// What this build speaks
        expected: String,
        /// What the region header carries
        found: String,
    },

    /// The producer never cleared our restart request
    #[error("handshake timed out after {0}ms waiting for the producer")]
    HandshakeTimeout(u64),

    /// The message ring has no free slot
    ///
    /// Recoverable: the publisher retries with a bounded sleep. Sustained
    /// occurrence shows up in the dropped-frame counter, not as a failure.
    #[error("queue {0} is full")]
    QueueFull(u32),

    /// Frame descriptor failed validation after snapshot
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Cursor descriptor failed validation after snapshot
    #[error("malformed cursor: {0}")]
    MalformedCursor(String),

    /// The shared region cannot hold the configured layout
    #[error("region too small: need {needed} bytes, have {available}")]
    RegionTooSmall {
        /// Bytes the layout requires
        needed: usize,
        /// Bytes the region provides
        available: usize,
    },

    /// A payload does not fit the configured slot size
    #[error("payload of {size} bytes exceeds slot capacity {capacity}")]
    SlotOverflow {
        /// Payload size requested
        size: usize,
        /// Fixed slot capacity
        capacity: usize,
    },

    /// Out-of-bounds access into the shared region
    #[error("region access out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfBounds {
        /// Start offset of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Region size
        size: usize,
    },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O failure (region file mapping)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the consumer loop may continue after this error
    ///
    /// Malformed messages are dropped and polling resumes; everything else
    /// ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::QueueFull(_)
                | RelayError::MalformedFrame(_)
                | RelayError::MalformedCursor(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RelayError::QueueFull(2).is_recoverable());
        assert!(RelayError::MalformedFrame("pitch < width".into()).is_recoverable());
        assert!(RelayError::MalformedCursor("bad kind".into()).is_recoverable());
        assert!(!RelayError::ProtocolMismatch {
            expected: "FRELAY-- v1".into(),
            found: "???????? v9".into(),
        }
        .is_recoverable());
        assert!(!RelayError::HandshakeTimeout(1000).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::OutOfBounds {
            offset: 4096,
            len: 128,
            size: 4100,
        };
        assert_eq!(
            err.to_string(),
            "region access out of bounds: offset 4096 + len 128 > size 4100"
        );
    }
}
