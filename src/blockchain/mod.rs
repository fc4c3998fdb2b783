//! Ledger integration subsystem.
//!
//! # Data Flow
//! ```text
//! TANSHELL_PRIVATE_KEY / ledger.private_key
//!     → wallet.rs (key loading, signing wallet)
//!     → client.rs (RPC reads with failover and timeouts)
//!     → contract.rs (Tanshell calls, log polling, LedgerTransport impl)
//! ```
//!
//! # Security Constraints
//! - Private keys are never logged or serialized
//! - All RPC calls have configurable timeouts
//! - A chain id mismatch is reported at startup but does not stop the node

pub mod client;
pub mod contract;
pub mod types;
pub mod wallet;

pub use client::LedgerClient;
pub use contract::TanshellTransport;
pub use types::{classify_submit_error, ChainId, LedgerConfig, LedgerResult};
pub use wallet::Wallet;
