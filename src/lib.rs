//! Remote shell over an append-only ledger.
//!
//! A controller writes a command as chunked contract calls addressed to a
//! registered server; the server reassembles it, runs it under a local shell
//! and streams stdout and stderr back the same way.

// Core protocol
pub mod protocol;

// Ledger and process boundaries
pub mod blockchain;
pub mod exec;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ShellConfig;
pub use lifecycle::Shutdown;
pub use protocol::{CommandDispatcher, CommandListener, TransactionSubmitter};
