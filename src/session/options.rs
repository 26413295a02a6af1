//! Session configuration.
//!
//! # Example
//!
//! ```ignore
//! use twain_direct::SessionOptions;
//!
//! let options = SessionOptions::new()
//!     .with_window_size(4)
//!     .with_temp_dir("/var/tmp/scans");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;

use crate::transport::TransportOptions;

use super::blocks::DEFAULT_WINDOW_SIZE;

// ============================================================================
// SessionOptions
// ============================================================================

/// Per-session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Maximum concurrent block downloads.
    pub window_size: usize,

    /// Where part files and assembled images are written.
    ///
    /// When `None`, a private temporary directory is created for the
    /// session and removed when the session ends.
    pub temp_dir: Option<PathBuf>,

    /// Timeouts and TLS behavior.
    pub transport: TransportOptions,
}

// ============================================================================
// Constructors
// ============================================================================

impl SessionOptions {
    /// Options for a directly reachable scanner.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            temp_dir: None,
            transport: TransportOptions::local(),
        }
    }

    /// Options for a scanner reached through the cloud relay.
    #[inline]
    #[must_use]
    pub fn cloud() -> Self {
        Self {
            transport: TransportOptions::cloud(),
            ..Self::new()
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl SessionOptions {
    /// Sets the download window size.
    #[inline]
    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets the directory for part files and assembled images.
    #[inline]
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets the transport options.
    #[inline]
    #[must_use]
    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns an error message if the window is empty, the temp directory
    /// does not exist, or a timeout is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window size must be at least 1".to_string());
        }

        if let Some(dir) = &self.temp_dir
            && !dir.is_dir()
        {
            return Err(format!("temp dir {} is not a directory", dir.display()));
        }

        self.transport.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.window_size, 3);
        assert!(options.temp_dir.is_none());
        assert_eq!(options.transport, TransportOptions::local());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_cloud_uses_cloud_transport() {
        assert_eq!(SessionOptions::cloud().transport, TransportOptions::cloud());
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let options = SessionOptions::new().with_window_size(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");

        assert!(SessionOptions::new().with_temp_dir(&missing).validate().is_err());
        assert!(SessionOptions::new().with_temp_dir(dir.path()).validate().is_ok());
    }
}
