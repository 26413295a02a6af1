//! Cloud relay support.
//!
//! A cloud-registered scanner is reached through the account's API root.
//! Commands are submitted over HTTPS and acknowledged immediately; the
//! scanner's reply is published later to the account's MQTT topic and
//! matched to its request by `commandId`.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `api` | Account API and relayed session bootstrap |
//! | `mqtt` | MQTT-over-WebSocket subscriber link |
//! | `router` | Reply correlation |
//! | `token` | Access token refresh |

// ============================================================================
// Submodules
// ============================================================================

/// Account API and relayed sessions.
pub mod api;

/// MQTT subscriber link.
pub mod mqtt;

/// Reply correlation.
pub mod router;

/// Access token refresh.
pub mod token;

// ============================================================================
// Re-exports
// ============================================================================

pub use api::{CloudApi, CloudScanner, CloudSession};
pub use mqtt::{EventBrokerInfo, MqttLink};
pub use router::{CommandRouter, ConnectionLostHandler, Registration};
pub use token::{
    HttpTokenEndpoint, RefreshHandler, TokenBroker, TokenEndpoint, TokenLease, TokenPair,
    send_authorized,
};
