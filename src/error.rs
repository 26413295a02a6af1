//! Error types for the TWAIN Direct client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use twain_direct::{Result, Session};
//!
//! async fn example(session: &Session) -> Result<()> {
//!     session.open().await?;
//!     session.start_capturing().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::HttpStatus`] |
//! | Protocol | [`Error::Protocol`], [`Error::Scanner`], [`Error::SessionTimedOut`] |
//! | State | [`Error::InvalidState`] |
//! | Assembly | [`Error::Assembly`] |
//! | Authorization | [`Error::Unauthorized`], [`Error::TokenRefresh`] |
//! | Execution | [`Error::RequestTimeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Http`], [`Error::WebSocket`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::CommandId;
use crate::session::SessionState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a scanner descriptor or session option is unusable.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Connection to the scanner or cloud service failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out establishing a connection.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The event broker link closed while a response was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The server answered with a non-200 status.
    #[error("HTTP response {status}: {reason}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Canonical reason or response excerpt.
        reason: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed message or missing expected field.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// The scanner reported `success: false`.
    #[error("Scanner rejected {method}: {code}")]
    Scanner {
        /// Method that was rejected.
        method: String,
        /// Scanner failure code (e.g. `invalidSessionId`, `busy`).
        code: String,
    },

    /// The scanner timed the session out.
    #[error("Session timed out on the scanner")]
    SessionTimedOut,

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Operation is not valid in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    // ========================================================================
    // Assembly Errors
    // ========================================================================
    /// A block body could not be turned into image content.
    #[error("Assembly error for block {block}: {message}")]
    Assembly {
        /// Block number involved.
        block: u32,
        /// What was wrong with the block.
        message: String,
    },

    // ========================================================================
    // Authorization Errors
    // ========================================================================
    /// The cloud service rejected the access token.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of the rejection.
        message: String,
    },

    /// Refreshing the access token failed.
    #[error("Token refresh failed: {message}")]
    TokenRefresh {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// No correlated response arrived in time.
    #[error("Command {command_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Command that timed out.
        command_id: CommandId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an HTTP status error.
    #[inline]
    pub fn http_status(status: u16, reason: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            reason: reason.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a scanner failure error.
    #[inline]
    pub fn scanner(method: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Scanner {
            method: method.into(),
            code: code.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates an assembly error.
    #[inline]
    pub fn assembly(block: u32, message: impl Into<String>) -> Self {
        Self::Assembly {
            block,
            message: message.into(),
        }
    }

    /// Creates an unauthorized error.
    #[inline]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a token refresh error.
    #[inline]
    pub fn token_refresh(message: impl Into<String>) -> Self {
        Self::TokenRefresh {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(command_id: CommandId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            command_id,
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::SessionTimedOut
        )
    }

    /// Returns `true` if this is a transport-level connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::HttpStatus { .. }
                | Self::Http(_)
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the operation was refused because of session state.
    ///
    /// State errors leave the session untouched.
    #[inline]
    #[must_use]
    pub fn is_state_error(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns `true` if the access token was rejected.
    #[inline]
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::TokenRefresh { .. })
            || matches!(self, Self::HttpStatus { status: 401, .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::InvalidState { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
