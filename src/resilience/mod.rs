//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Contended submission (nonce stale / underpriced):
//!     → protocol::transaction resyncs nonce or bumps gas price
//!     → backoff.rs (delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Only contention is retried; every other failure surfaces to the caller
//! - Jittered backoff keeps identities sharing a node from retrying in lockstep

pub mod backoff;

pub use backoff::Backoff;
