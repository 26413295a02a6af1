//! HTTP transport layer.
//!
//! This module executes single HTTP exchanges against a scanner or the
//! cloud relay. Everything above it (session requests, block reads, cloud
//! API calls, token refresh) goes through the [`HttpClient`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Session (Rust) │          HTTPS               │  Scanner        │
//! │                 │─────────────────────────────►│  (privet)       │
//! │  HttpClient     │   self-signed cert, pinned   │                 │
//! │  → Reqwest      │   to discovered IP           │  or cloud API   │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `http` | Request/response types, client trait and reqwest backend |
//! | `options` | Timeouts and TLS settings |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP request execution.
pub mod http;

/// Transport configuration.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, JSON_CONTENT_TYPE, ReqwestClient,
    append_path,
};
pub use options::TransportOptions;
