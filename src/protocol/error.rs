//! Error taxonomy for the ledger transport and the chunked-stream protocol.

use thiserror::Error;

use crate::protocol::types::{MessageId, StreamKey};

/// Errors raised by ledger reads, registry lookups, and subscriptions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// RPC connection or request failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// Invalid private key format or signer error.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// The signing identity has no entry in the contract's client registry.
    #[error("Identity {0} is not registered with the contract")]
    NotRegistered(String),

    /// An emitted event could not be decoded.
    #[error("Event decode error: {0}")]
    Decode(String),

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// The subscription source went away.
    #[error("Subscription closed")]
    SubscriptionClosed,
}

/// Outcome of a rejected transaction submission, classified by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The ledger expected a higher nonce than the one submitted.
    #[error("nonce too low")]
    NonceStale,

    /// A competing transaction with the same nonce carries an equal or higher price.
    #[error("replacement transaction underpriced")]
    Underpriced,

    /// The ledger refused the transaction for any other reason.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The submission never reached the ledger.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SubmitError {
    /// Whether the submitter recovers from this error locally.
    pub fn is_contention(&self) -> bool {
        matches!(self, SubmitError::NonceStale | SubmitError::Underpriced)
    }
}

/// Errors surfaced by the protocol core to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Submission failed: {0}")]
    Submit(#[from] SubmitError),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Contention retries hit the configured attempt limit.
    #[error("Submission abandoned after {0} contended attempts")]
    RetriesExhausted(u32),

    /// The owning context was torn down.
    #[error("Operation cancelled")]
    Cancelled,

    /// A stream did not observe its terminal chunk before the deadline.
    #[error("Stream {key} did not complete within {secs} seconds")]
    StreamTimeout { key: StreamKey, secs: u64 },

    /// A chunk for a different stream reached a reassembler.
    #[error("Unexpected chunk for {actual} while reassembling {expected}")]
    UnexpectedChunk { expected: StreamKey, actual: StreamKey },

    /// An output sink can no longer deliver bytes.
    #[error("Output sink for message {0} is closed")]
    SinkClosed(MessageId),

    /// The command consumer went away.
    #[error("Command listener stopped")]
    ListenerClosed,
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::StreamKind;

    #[test]
    fn test_contention_classification() {
        assert!(SubmitError::NonceStale.is_contention());
        assert!(SubmitError::Underpriced.is_contention());
        assert!(!SubmitError::Rejected("out of gas".into()).is_contention());
        assert!(!SubmitError::Transport("connection refused".into()).is_contention());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::from(LedgerError::Timeout(10));
        assert_eq!(err.to_string(), "RPC timeout after 10 seconds");

        let err = ProtocolError::StreamTimeout {
            key: StreamKey::new(MessageId(4), StreamKind::Stdout),
            secs: 30,
        };
        assert_eq!(err.to_string(), "Stream 4/stdout did not complete within 30 seconds");
    }
}
