//! Session lifecycle states.
//!
//! The same names are used on the wire (`session.state`) and locally.
//!
//! ```text
//! noSession ──open──► ready ──startCapturing──► capturing ──stop──► draining
//!     ▲                                             │                  │
//!     │                                             └──── done ────────┴──► closed
//!     └──────────────── connection failure (from any state) ─────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// SessionState
// ============================================================================

/// State of a scanning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No session is open.
    #[default]
    NoSession,
    /// Session open, accepting a task.
    Ready,
    /// The scanner is capturing.
    Capturing,
    /// Capture stopped; outstanding blocks are still transferring.
    Draining,
    /// Capture finished and every block was delivered.
    Closed,
}

impl SessionState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoSession => "noSession",
            Self::Ready => "ready",
            Self::Capturing => "capturing",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    /// Returns `true` if the session has a live scanner-side session.
    #[inline]
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Ready | Self::Capturing | Self::Draining)
    }

    /// Returns `true` once capture is in progress or winding down.
    #[inline]
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing | Self::Draining)
    }

    /// Returns `true` for states no further transition leaves.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
