//! Chunked stream writer.
//!
//! Splits a payload into chunks of at most `max_chunk_size` bytes and drives
//! them, in order, through the identity's [`TransactionSubmitter`]. A stream
//! always ends with exactly one terminal chunk carrying an empty payload.
//!
//! A failed submission aborts the remaining chunks. Chunks already accepted by
//! the ledger stay there; the reader sees an unterminated stream.

use bytes::Bytes;
use std::sync::Arc;

use crate::observability::metrics;
use crate::protocol::error::ProtocolResult;
use crate::protocol::transaction::TransactionSubmitter;
use crate::protocol::types::{ChunkTarget, LedgerCall};

#[derive(Debug, Clone)]
pub struct ChunkedStreamWriter {
    submitter: Arc<TransactionSubmitter>,
    max_chunk_size: usize,
}

impl ChunkedStreamWriter {
    pub fn new(submitter: Arc<TransactionSubmitter>, max_chunk_size: usize) -> Self {
        Self {
            submitter,
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    /// Write a whole stream: data chunks followed by the terminal chunk.
    ///
    /// Returns the number of transactions submitted.
    pub async fn write(&self, target: ChunkTarget, payload: Bytes) -> ProtocolResult<usize> {
        let submitted = self.write_data(target, payload).await?;
        self.finish(target).await?;
        Ok(submitted + 1)
    }

    /// Submit `payload` as non-final chunks only. An empty payload submits nothing.
    pub async fn write_data(&self, target: ChunkTarget, payload: Bytes) -> ProtocolResult<usize> {
        let mut submitted = 0;
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + self.max_chunk_size).min(payload.len());
            self.submit(target, payload.slice(offset..end), false).await?;
            submitted += 1;
            offset = end;
        }
        Ok(submitted)
    }

    /// Submit the terminal chunk.
    pub async fn finish(&self, target: ChunkTarget) -> ProtocolResult<()> {
        self.submit(target, Bytes::new(), true).await
    }

    async fn submit(&self, target: ChunkTarget, payload: Bytes, is_final: bool) -> ProtocolResult<()> {
        let len = payload.len();
        let call = LedgerCall {
            target,
            payload,
            is_final,
        };
        let params = self
            .submitter
            .submit(|params| params.transaction(call.clone()))
            .await?;

        let key = target.key();
        metrics::record_chunk(key.kind.as_str());
        tracing::debug!(
            message_id = %key.message_id,
            kind = %key.kind,
            nonce = params.nonce,
            bytes = len,
            is_final = is_final,
            "Chunk submitted"
        );
        Ok(())
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error::{ProtocolError, SubmitError};
    use crate::protocol::memory::MemoryLedger;
    use crate::protocol::transaction::SubmitPolicy;
    use crate::protocol::types::{ClientId, MessageId, OutputKind};
    use crate::resilience::Backoff;
    use tokio_util::sync::CancellationToken;

    async fn writer(ledger: &MemoryLedger, max_chunk_size: usize) -> ChunkedStreamWriter {
        let policy = SubmitPolicy {
            backoff: Backoff::immediate(),
            ..SubmitPolicy::default()
        };
        let submitter = TransactionSubmitter::new(
            Arc::new(ledger.transport("controller")),
            policy,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        ChunkedStreamWriter::new(Arc::new(submitter), max_chunk_size)
    }

    fn input() -> ChunkTarget {
        ChunkTarget::Input {
            client_id: ClientId(3),
            message_id: MessageId(1),
        }
    }

    #[tokio::test]
    async fn test_split_into_bounded_chunks() {
        let ledger = MemoryLedger::new();
        let writer = writer(&ledger, 3).await;

        let count = writer.write(input(), Bytes::from_static(b"echo hi")).await.unwrap();
        assert_eq!(count, 4);

        let chunks: Vec<_> = ledger.history().into_iter().map(|e| e.chunk).collect();
        let payloads: Vec<&[u8]> = chunks.iter().map(|c| c.payload.as_ref()).collect();
        assert_eq!(payloads, vec![&b"ech"[..], b"o h", b"i", b""]);
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn test_even_split_still_terminates() {
        let ledger = MemoryLedger::new();
        let writer = writer(&ledger, 2).await;

        writer.write(input(), Bytes::from_static(b"abcd")).await.unwrap();
        let chunks: Vec<_> = ledger.history().into_iter().map(|e| e.chunk).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_final && chunks[2].payload.is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_is_terminal_only() {
        let ledger = MemoryLedger::new();
        let writer = writer(&ledger, 16).await;

        let count = writer.write(input(), Bytes::new()).await.unwrap();
        assert_eq!(count, 1);

        let history = ledger.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].chunk.is_final);
        assert!(history[0].chunk.payload.is_empty());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_chunks() {
        let ledger = MemoryLedger::new();
        ledger.register("controller");
        let writer = writer(&ledger, 2).await;
        let target = ChunkTarget::Output {
            message_id: MessageId(5),
            kind: OutputKind::Stdout,
        };

        writer.write_data(target, Bytes::from_static(b"ab")).await.unwrap();
        ledger.inject_failure("controller", SubmitError::Rejected("reverted".into()));

        let err = writer
            .write(target, Bytes::from_static(b"cdef"))
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::Submit(SubmitError::Rejected("reverted".into())));
        // Partial data is not rolled back and no terminal chunk follows.
        let history = ledger.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].chunk.is_final);
    }
}
