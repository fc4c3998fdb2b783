//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → every child token cancelled
//!         → subscriptions unsubscribe, reassemblies cancelled,
//!           retry loops abort, sink writers stop
//!     → tracker waits for background tasks to exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
