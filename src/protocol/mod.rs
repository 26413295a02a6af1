//! TWAIN Direct wire types.
//!
//! This module defines the JSON bodies exchanged with a scanner, whether
//! directly or through the cloud relay, plus the multipart reader used for
//! local block reads.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Client → Scanner | Session command |
//! | `Response` | Scanner → Client | Command outcome and session snapshot |
//! | `ScannerEvent` | Scanner → Client | Long-poll notification |
//! | `InfoEx` | Scanner → Client | Device info and privet token |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Session commands (`method` / `params`) |
//! | `event` | Session snapshots, status and events |
//! | `metadata` | Image block address |
//! | `multipart` | MIME multipart reader |
//! | `request` | Request and Response envelopes |

// ============================================================================
// Submodules
// ============================================================================

/// Session command definitions.
pub mod command;

/// Session snapshots and scanner events.
pub mod event;

/// Image block metadata.
pub mod metadata;

/// MIME multipart reader.
pub mod multipart;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::Command;
pub use event::{EventKind, InfoEx, ScannerEvent, SessionInfo, Status, StatusDetected};
pub use metadata::{BlockAddress, MoreParts};
pub use request::{REQUEST_KIND, Request, Response, Results};
