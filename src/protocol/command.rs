//! Session command definitions.
//!
//! Each command serializes to the `method` / `params` pair of a session
//! request body.
//!
//! | Method | Params | Valid in |
//! |--------|--------|----------|
//! | `createSession` | none | `noSession` |
//! | `sendTask` | `sessionId`, `task` | `ready` |
//! | `startCapturing` | `sessionId` | `ready` |
//! | `stopCapturing` | `sessionId` | `capturing` |
//! | `closeSession` | `sessionId` | any open state |
//! | `waitForEvents` | `sessionId`, `sessionRevision` | any open state |
//! | `readImageBlock` | `sessionId`, `imageBlockNum`, `withMetadata` | `capturing`, `draining` |
//! | `releaseImageBlocks` | `sessionId`, `imageBlockNum`, `lastImageBlockNum` | `capturing`, `draining` |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::SessionId;

// ============================================================================
// Command
// ============================================================================

/// A TWAIN Direct session command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    /// Open a new session.
    CreateSession {},

    /// Send the task document describing the scan.
    SendTask {
        /// Session to configure.
        session_id: SessionId,
        /// Task document, passed through untouched.
        task: Value,
    },

    /// Start capturing.
    StartCapturing {
        /// Session to start.
        session_id: SessionId,
    },

    /// Ask the scanner to stop after the current sheet.
    StopCapturing {
        /// Session to stop.
        session_id: SessionId,
    },

    /// Close the session once its blocks are released.
    CloseSession {
        /// Session to close.
        session_id: SessionId,
    },

    /// Long-poll for session changes newer than `session_revision`.
    WaitForEvents {
        /// Session to watch.
        session_id: SessionId,
        /// Highest revision already seen.
        session_revision: u64,
    },

    /// Read one image block.
    ReadImageBlock {
        /// Session holding the block.
        session_id: SessionId,
        /// Block to read.
        image_block_num: u32,
        /// Include the block metadata in the response.
        with_metadata: bool,
    },

    /// Release a range of image blocks on the scanner.
    ReleaseImageBlocks {
        /// Session holding the blocks.
        session_id: SessionId,
        /// First block to release.
        image_block_num: u32,
        /// Last block to release (inclusive).
        last_image_block_num: u32,
    },
}

impl Command {
    /// Returns the wire method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreateSession {} => "createSession",
            Self::SendTask { .. } => "sendTask",
            Self::StartCapturing { .. } => "startCapturing",
            Self::StopCapturing { .. } => "stopCapturing",
            Self::CloseSession { .. } => "closeSession",
            Self::WaitForEvents { .. } => "waitForEvents",
            Self::ReadImageBlock { .. } => "readImageBlock",
            Self::ReleaseImageBlocks { .. } => "releaseImageBlocks",
        }
    }

    /// Returns the session this command targets, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::CreateSession {} => None,
            Self::SendTask { session_id, .. }
            | Self::StartCapturing { session_id }
            | Self::StopCapturing { session_id }
            | Self::CloseSession { session_id }
            | Self::WaitForEvents { session_id, .. }
            | Self::ReadImageBlock { session_id, .. }
            | Self::ReleaseImageBlocks { session_id, .. } => Some(session_id),
        }
    }

    /// Creates a command releasing a single block.
    #[inline]
    #[must_use]
    pub fn release_block(session_id: SessionId, block: u32) -> Self {
        Self::ReleaseImageBlocks {
            session_id,
            image_block_num: block,
            last_image_block_num: block,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_create_session_has_empty_params() {
        let value = serde_json::to_value(Command::CreateSession {}).expect("serialize");
        assert_eq!(value, json!({"method": "createSession", "params": {}}));
    }

    #[test]
    fn test_wait_for_events_params() {
        let command = Command::WaitForEvents {
            session_id: SessionId::new("s1"),
            session_revision: 4,
        };
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(
            value,
            json!({
                "method": "waitForEvents",
                "params": {"sessionId": "s1", "sessionRevision": 4}
            })
        );
    }

    #[test]
    fn test_read_image_block_params() {
        let command = Command::ReadImageBlock {
            session_id: SessionId::new("s1"),
            image_block_num: 7,
            with_metadata: true,
        };
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(value["params"]["imageBlockNum"], 7);
        assert_eq!(value["params"]["withMetadata"], true);
        assert_eq!(command.method(), "readImageBlock");
    }

    #[test]
    fn test_release_block() {
        let command = Command::release_block(SessionId::new("s1"), 3);
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(value["params"]["imageBlockNum"], 3);
        assert_eq!(value["params"]["lastImageBlockNum"], 3);
    }

    #[test]
    fn test_session_id_accessor() {
        assert!(Command::CreateSession {}.session_id().is_none());
        let command = Command::StartCapturing {
            session_id: SessionId::new("abc"),
        };
        assert_eq!(command.session_id().map(SessionId::as_str), Some("abc"));
    }
}
