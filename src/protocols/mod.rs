//! Stream protocol analyzers
//!
//! # Architecture
//!
//! Each protocol module implements the `Protocol` trait and exposes a
//! `registration()` describing its conntrack needs:
//!
//! ```ignore
//! pub trait Protocol: Send + Sync {
//!     fn name(&self) -> &'static str;
//!     fn process(&self, ctx: &ProcessContext, segment: &StreamSegment) -> Result<ProcessStatus>;
//!     fn cleanup(&self, events: &EventRegistry) -> Result<()>;
//! }
//! ```
//!
//! # Feature Flags
//!
//! Each protocol is gated behind a feature flag (all on by default):
//! - `proto-imap`

// Core infrastructure
pub mod traits;
pub mod registry;

// Re-export core types
pub use traits::{ProcessContext, ProcessStatus, Protocol, ProtocolInit};
pub use registry::{ProtocolRegistration, ProtocolRegistry, RegisteredProtocol};

// ═══════════════════════════════════════════════════════════════════════════════
// Protocol modules - feature-gated at declaration
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "proto-imap")]
pub mod imap;

/// Registrations of every protocol compiled in
pub fn builtin_protocols() -> Vec<ProtocolRegistration> {
    #[allow(unused_mut)]
    let mut protocols = Vec::new();

    #[cfg(feature = "proto-imap")]
    protocols.push(imap::registration());

    protocols
}
