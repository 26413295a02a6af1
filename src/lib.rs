//! TWAIN Direct client: scanning sessions over the local network or a
//! cloud relay.
//!
//! This library drives a TWAIN Direct scanner through one scan job: open a
//! session, send a task, capture, and receive the resulting images as
//! files, in order.
//!
//! # Architecture
//!
//! The client speaks the same JSON protocol over two transports:
//!
//! - **Local**: HTTPS requests straight to the scanner; each response body
//!   is the reply.
//! - **Cloud**: HTTPS requests to the cloud API acknowledge a command; the
//!   reply arrives later on an MQTT topic and is matched by `commandId`.
//!
//! Key design principles:
//!
//! - Each [`Session`] is driven by one task that owns its state
//! - Lifecycle calls return typed results; everything else is a [`SessionEvent`]
//! - Image blocks download concurrently within a window but are delivered
//!   strictly in block order
//! - One [`TokenBroker`] per cloud account serializes token refreshes
//!
//! # Quick Start
//!
//! ```no_run
//! use twain_direct::{Result, ScannerDescriptor, Session, SessionEvent, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let url = "https://scanner.local:34034/".parse()?;
//!     let scanner = ScannerDescriptor::local(url, None);
//!     let (session, mut events) = Session::local(&scanner, SessionOptions::new())?;
//!
//!     session.open().await?;
//!     session.send_task(serde_json::json!({"actions": []})).await?;
//!     session.start_capturing().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::ImageReceived(image) => println!("{}", image.path.display()),
//!             SessionEvent::DoneCapturing => break,
//!             SessionEvent::ConnectionError(e) => return Err(e),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cloud`] | Cloud account API, token refresh, MQTT link, reply routing |
//! | [`discovery`] | Scanner descriptors and their persistence |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | TWAIN Direct wire types |
//! | [`session`] | Sessions, block download and assembly |
//! | [`transport`] | HTTP transport layer |

// ============================================================================
// Modules
// ============================================================================

/// Cloud relay: account API, tokens, event link.
pub mod cloud;

/// Scanner descriptors.
pub mod discovery;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// TWAIN Direct message types.
pub mod protocol;

/// Scanning sessions.
///
/// Use [`Session::local`] or [`CloudSession::connect`] to create one.
pub mod session;

/// HTTP transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Session types
pub use session::{ReceivedImage, Session, SessionEvent, SessionOptions, SessionState};

// Cloud types
pub use cloud::{CloudApi, CloudScanner, CloudSession, TokenBroker, TokenPair};

// Discovery types
pub use discovery::{Reachability, ScannerDescriptor, TxtRecord};

// Transport types
pub use transport::TransportOptions;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CommandId, SessionId};
