//! Chain-specific types and RPC error classification.

use crate::protocol::error::{LedgerError, SubmitError};

// Re-export LedgerConfig from config module to avoid duplication
pub use crate::config::schema::LedgerConfig;

/// Chain ID type for strong typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

/// Result type for ledger reads.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Map a node's rejection message onto the submitter's contention taxonomy.
///
/// Nodes only report these conditions as free text, so matching is on the
/// lowercase message.
pub fn classify_submit_error(message: &str) -> SubmitError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("nonce too low") {
        SubmitError::NonceStale
    } else if lower.contains("replacement transaction underpriced")
        || lower.contains("transaction underpriced")
    {
        SubmitError::Underpriced
    } else {
        SubmitError::Rejected(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_conversion() {
        let chain_id = ChainId::from(1u64);
        assert_eq!(chain_id.0, 1);
        assert_eq!(u64::from(chain_id), 1);
    }

    #[test]
    fn test_classify_contention() {
        assert_eq!(
            classify_submit_error("server returned an error response: error code -32000: nonce too low"),
            SubmitError::NonceStale
        );
        assert_eq!(
            classify_submit_error("replacement transaction underpriced"),
            SubmitError::Underpriced
        );
        assert_eq!(
            classify_submit_error("Transaction Underpriced"),
            SubmitError::Underpriced
        );
    }

    #[test]
    fn test_classify_other_rejections() {
        let err = classify_submit_error("execution reverted: unknown client");
        assert_eq!(
            err,
            SubmitError::Rejected("execution reverted: unknown client".to_string())
        );
        assert!(!err.is_contention());
    }
}
