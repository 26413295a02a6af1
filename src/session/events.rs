//! Asynchronous session notifications.

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;

use serde_json::Value;

use crate::error::Error;
use crate::protocol::{BlockAddress, Status};

use super::state::SessionState;

// ============================================================================
// ReceivedImage
// ============================================================================

/// A fully assembled image, ready for the consumer.
///
/// The file belongs to the consumer, who deletes it once consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedImage {
    /// Assembled file, named `<sheet>-<image>-<part>.pdf`.
    pub path: PathBuf,
    /// Metadata of the first block of the image.
    pub metadata: Value,
    /// Address of the first block.
    pub address: BlockAddress,
    /// First block number in the image.
    pub first_block: u32,
    /// Last block number in the image.
    pub last_block: u32,
}

// ============================================================================
// SessionEvent
// ============================================================================

/// Something that happened outside a lifecycle call.
#[derive(Debug)]
pub enum SessionEvent {
    /// An image was assembled.
    ImageReceived(ReceivedImage),

    /// The session moved to a new state.
    StateChanged(SessionState),

    /// The scanner reported a device condition. Not fatal.
    StatusChanged(Status),

    /// Capture is finished and every image has been delivered.
    DoneCapturing,

    /// The session failed and was torn down to `noSession`.
    ConnectionError(Error),
}

impl SessionEvent {
    /// Returns `true` for events after which no further events follow.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DoneCapturing | Self::ConnectionError(_))
    }
}
