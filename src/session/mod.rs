//! Scanning sessions.
//!
//! A [`Session`] drives one scan job from `createSession` to the last
//! delivered image. It talks to the scanner through a [`ScannerChannel`]
//! and reads image blocks through a [`BlockFetcher`]; both are chosen once,
//! when the session is created, depending on whether the scanner is on the
//! local network or behind the cloud relay.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `state` | Lifecycle states |
//! | `channel` | Command submission over HTTP or the relay |
//! | `fetcher` | Block retrieval, multipart or two-step |
//! | `blocks` | Download window and ordered assembly bookkeeping |
//! | `downloader` | Concurrent block download tasks and image assembly |
//! | `events` | Notifications delivered to the consumer |
//! | `options` | Session configuration |
//! | `core` | The `Session` handle and its driver task |
//!
//! # Example
//!
//! ```ignore
//! use twain_direct::{ScannerDescriptor, Session, SessionEvent, SessionOptions};
//!
//! let scanner = ScannerDescriptor::local("https://scanner.local:34034".parse()?, None);
//! let (session, mut events) = Session::local(&scanner, SessionOptions::new())?;
//!
//! session.open().await?;
//! session.send_task(task).await?;
//! session.start_capturing().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::ImageReceived(image) => println!("{}", image.path.display()),
//!         SessionEvent::DoneCapturing => break,
//!         SessionEvent::ConnectionError(e) => return Err(e),
//!         _ => {}
//!     }
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Download window and ordered assembly bookkeeping.
pub mod blocks;

/// Command submission over either transport.
pub mod channel;

/// Session handle and driver.
pub mod core;

/// Concurrent block downloads.
pub mod downloader;

/// Consumer notifications.
pub mod events;

/// Block retrieval over either transport.
pub mod fetcher;

/// Session configuration.
pub mod options;

/// Lifecycle states.
pub mod state;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use blocks::{BlockState, DEFAULT_WINDOW_SIZE, DownloadState, DownloadedBlock};
pub use channel::{CloudChannel, LocalChannel, PRIVET_TOKEN_HEADER, ScannerChannel};
pub use core::Session;
pub use downloader::{BlockDownloader, DownloadProgress};
pub use events::{ReceivedImage, SessionEvent};
pub use fetcher::{BlockFetcher, CloudBlockFetcher, FetchedBlock, LocalBlockFetcher};
pub use options::SessionOptions;
pub use state::SessionState;
