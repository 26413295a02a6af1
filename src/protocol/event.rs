//! Session snapshots and scanner events.
//!
//! Every successful session response carries a `session` object describing
//! the scanner's view of the session. `waitForEvents` additionally returns
//! a list of events, each with its own snapshot.
//!
//! # Event Types
//!
//! | Event | Meaning | Fatal |
//! |-------|---------|-------|
//! | `imageBlocks` | New blocks are ready to read | no |
//! | `sessionTimedOut` | The scanner dropped the session | yes |
//! | `critical` | Unrecoverable scanner failure | yes |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::SessionId;
use crate::session::SessionState;

// ============================================================================
// SessionInfo
// ============================================================================

/// The scanner's view of a session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Scanner-assigned session ID.
    pub session_id: SessionId,

    /// Revision counter, bumped on every change.
    #[serde(default)]
    pub revision: u64,

    /// Session state.
    pub state: SessionState,

    /// Blocks currently available to read.
    #[serde(default)]
    pub image_blocks: Vec<u32>,

    /// Every captured block has been released.
    #[serde(default)]
    pub image_blocks_drained: bool,

    /// The scanner will produce no more blocks.
    #[serde(default)]
    pub done_capturing: bool,

    /// Device status.
    #[serde(default)]
    pub status: Option<Status>,

    /// Task reply, echoed after `sendTask`.
    #[serde(default)]
    pub task: Option<Value>,
}

impl SessionInfo {
    /// Returns `true` if the scanner has finished and nothing is left to read.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done_capturing && self.image_blocks_drained
    }
}

// ============================================================================
// Status
// ============================================================================

/// Device status reported alongside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// `false` when the device needs attention.
    pub success: bool,

    /// What the device detected.
    #[serde(default)]
    pub detected: StatusDetected,
}

/// Condition detected by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusDetected {
    /// Nothing to report.
    #[default]
    Nominal,
    /// The cover is open.
    CoverOpen,
    /// A folded corner was detected.
    FoldedCorner,
    /// The image could not be captured.
    ImageError,
    /// A sheet failed to feed.
    Misfeed,
    /// More than one sheet fed at once.
    Multifeed,
    /// Paper jam.
    PaperJam,
    /// The feeder is empty.
    NoMedia,
    /// A staple was detected.
    Staple,
    /// A value this client does not know.
    Unknown(String),
}

impl StatusDetected {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Nominal => "nominal",
            Self::CoverOpen => "coverOpen",
            Self::FoldedCorner => "foldedCorner",
            Self::ImageError => "imageError",
            Self::Misfeed => "misfeed",
            Self::Multifeed => "multifeed",
            Self::PaperJam => "paperJam",
            Self::NoMedia => "noMedia",
            Self::Staple => "staple",
            Self::Unknown(value) => value,
        }
    }
}

impl From<String> for StatusDetected {
    fn from(value: String) -> Self {
        match value.as_str() {
            "nominal" => Self::Nominal,
            "coverOpen" => Self::CoverOpen,
            "foldedCorner" => Self::FoldedCorner,
            "imageError" => Self::ImageError,
            "misfeed" => Self::Misfeed,
            "multifeed" => Self::Multifeed,
            "paperJam" => Self::PaperJam,
            "noMedia" => Self::NoMedia,
            "staple" => Self::Staple,
            _ => Self::Unknown(value),
        }
    }
}

impl From<StatusDetected> for String {
    fn from(value: StatusDetected) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StatusDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ScannerEvent
// ============================================================================

/// One entry of a `waitForEvents` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScannerEvent {
    /// Event name.
    pub event: EventKind,

    /// Session snapshot at the time of the event.
    #[serde(default)]
    pub session: Option<SessionInfo>,
}

/// Event name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum EventKind {
    /// New image blocks are available.
    ImageBlocks,
    /// The scanner timed the session out.
    SessionTimedOut,
    /// Unrecoverable scanner failure.
    Critical,
    /// Any other event name.
    Other(String),
}

impl EventKind {
    /// Returns `true` if the event ends the session.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionTimedOut | Self::Critical)
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "imageBlocks" => Self::ImageBlocks,
            "sessionTimedOut" => Self::SessionTimedOut,
            "critical" => Self::Critical,
            _ => Self::Other(value),
        }
    }
}

// ============================================================================
// InfoEx
// ============================================================================

/// Reply to `privet/infoex`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InfoEx {
    /// Token to send as `X-Privet-Token` on session requests.
    #[serde(rename = "x-privet-token")]
    pub privet_token: String,

    /// Friendly name.
    #[serde(default)]
    pub name: Option<String>,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Manufacturer name.
    #[serde(default)]
    pub manufacturer: Option<String>,

    /// Model name.
    #[serde(default)]
    pub model: Option<String>,

    /// Supported API endpoints.
    #[serde(default)]
    pub api: Vec<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_session_info_defaults() {
        let info: SessionInfo = serde_json::from_value(json!({
            "sessionId": "abc",
            "state": "ready"
        }))
        .expect("parse");

        assert_eq!(info.session_id.as_str(), "abc");
        assert_eq!(info.state, SessionState::Ready);
        assert_eq!(info.revision, 0);
        assert!(info.image_blocks.is_empty());
        assert!(!info.is_finished());
    }

    #[test]
    fn test_session_info_finished() {
        let info: SessionInfo = serde_json::from_value(json!({
            "sessionId": "abc",
            "revision": 12,
            "state": "capturing",
            "imageBlocks": [],
            "imageBlocksDrained": true,
            "doneCapturing": true,
            "status": {"success": true, "detected": "nominal"}
        }))
        .expect("parse");

        assert!(info.is_finished());
        assert_eq!(info.revision, 12);
    }

    #[test]
    fn test_status_detected_unknown_value() {
        let status: Status =
            serde_json::from_value(json!({"success": false, "detected": "lampFailure"}))
                .expect("parse");
        assert_eq!(
            status.detected,
            StatusDetected::Unknown("lampFailure".to_string())
        );
        assert_eq!(status.detected.to_string(), "lampFailure");
    }

    #[test]
    fn test_status_detected_known_value() {
        let status: Status =
            serde_json::from_value(json!({"success": false, "detected": "paperJam"}))
                .expect("parse");
        assert_eq!(status.detected, StatusDetected::PaperJam);
        assert_eq!(
            serde_json::to_value(&status).expect("serialize")["detected"],
            "paperJam"
        );
    }

    #[test]
    fn test_event_kinds() {
        let event: ScannerEvent = serde_json::from_value(json!({
            "event": "imageBlocks",
            "session": {"sessionId": "abc", "state": "capturing", "imageBlocks": [1, 2]}
        }))
        .expect("parse");

        assert_eq!(event.event, EventKind::ImageBlocks);
        assert!(!event.event.is_fatal());
        assert_eq!(event.session.expect("session").image_blocks, vec![1, 2]);

        let timed_out: ScannerEvent =
            serde_json::from_value(json!({"event": "sessionTimedOut"})).expect("parse");
        assert!(timed_out.event.is_fatal());
    }

    #[test]
    fn test_info_ex_token() {
        let info: InfoEx = serde_json::from_value(json!({
            "x-privet-token": "tok==",
            "name": "Office Scanner",
            "api": ["/privet/twaindirect/session"]
        }))
        .expect("parse");

        assert_eq!(info.privet_token, "tok==");
        assert_eq!(info.name.as_deref(), Some("Office Scanner"));
    }
}
