//! Scanner descriptors produced by discovery.
//!
//! Network discovery itself (mDNS, cloud listing UI) lives outside this
//! crate; this module defines the descriptor it produces and how that
//! descriptor is persisted.

// ============================================================================
// Submodules
// ============================================================================

/// Descriptor, TXT record and reachability types.
pub mod scanner;

// ============================================================================
// Re-exports
// ============================================================================

pub use scanner::{CloudTarget, Reachability, ScannerDescriptor, TxtRecord};
