//! HTTP transport configuration.
//!
//! Provides a type-safe interface for the timeouts and TLS behavior used
//! when talking to a scanner or the cloud relay.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use twain_direct::TransportOptions;
//!
//! let options = TransportOptions::local()
//!     .with_connect_timeout(Duration::from_secs(20))
//!     .with_read_timeout(Duration::from_secs(45));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default read timeout for JSON requests.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Block reads through the cloud relay are slow.
const CLOUD_BLOCK_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Scanners hold `waitForEvents` open until something happens.
const DEFAULT_EVENTS_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// TransportOptions
// ============================================================================

/// Timeouts and TLS behavior for scanner and cloud requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Maximum time to establish a TCP/TLS connection.
    pub connect_timeout: Duration,

    /// Total time allowed for a JSON request.
    pub read_timeout: Duration,

    /// Total time allowed for an image block read.
    pub block_read_timeout: Duration,

    /// Total time allowed for a `waitForEvents` long poll.
    pub events_timeout: Duration,

    /// Accept self-signed device certificates.
    pub accept_invalid_certs: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl TransportOptions {
    /// Options for a scanner reached directly on the local network.
    #[inline]
    #[must_use]
    pub const fn local() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            block_read_timeout: DEFAULT_READ_TIMEOUT,
            events_timeout: DEFAULT_EVENTS_TIMEOUT,
            accept_invalid_certs: true,
        }
    }

    /// Options for a scanner reached through the cloud relay.
    #[inline]
    #[must_use]
    pub const fn cloud() -> Self {
        Self {
            block_read_timeout: CLOUD_BLOCK_READ_TIMEOUT,
            ..Self::local()
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::local()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TransportOptions {
    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the JSON request timeout.
    #[inline]
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the image block read timeout.
    #[inline]
    #[must_use]
    pub fn with_block_read_timeout(mut self, timeout: Duration) -> Self {
        self.block_read_timeout = timeout;
        self
    }

    /// Sets the long-poll timeout.
    #[inline]
    #[must_use]
    pub fn with_events_timeout(mut self, timeout: Duration) -> Self {
        self.events_timeout = timeout;
        self
    }

    /// Requires a certificate chain that validates against the system roots.
    #[inline]
    #[must_use]
    pub fn with_strict_tls(mut self) -> Self {
        self.accept_invalid_certs = false;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns an error message if any timeout is zero.
    pub fn validate(&self) -> Result<(), String> {
        let timeouts = [
            ("connect", self.connect_timeout),
            ("read", self.read_timeout),
            ("block read", self.block_read_timeout),
            ("events", self.events_timeout),
        ];

        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(format!("{name} timeout must be greater than zero"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_defaults() {
        let options = TransportOptions::local();
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.read_timeout, Duration::from_secs(30));
        assert_eq!(options.block_read_timeout, Duration::from_secs(30));
        assert!(options.accept_invalid_certs);
    }

    #[test]
    fn test_cloud_extends_block_timeout() {
        let options = TransportOptions::cloud();
        assert_eq!(options.block_read_timeout, Duration::from_secs(120));
        assert_eq!(options.read_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_chain() {
        let options = TransportOptions::local()
            .with_connect_timeout(Duration::from_secs(20))
            .with_events_timeout(Duration::from_secs(90))
            .with_strict_tls();

        assert_eq!(options.connect_timeout, Duration::from_secs(20));
        assert_eq!(options.events_timeout, Duration::from_secs(90));
        assert!(!options.accept_invalid_certs);
    }

    #[test]
    fn test_validate_zero_timeout() {
        let options = TransportOptions::local().with_read_timeout(Duration::ZERO);
        let err = options.validate().unwrap_err();
        assert!(err.contains("read"));
    }
}
