//! Stream reassembly.
//!
//! A [`Reassembler`] accumulates the chunks of one stream in delivery order
//! until the terminal chunk seals it. Delivery order is trusted: the ledger
//! preserves per-sender order and submission is serialized per sender, so
//! nothing here reorders.
//!
//! ```text
//! Empty ──chunk──▶ Accumulating ──final──▶ Complete
//!   │                   │
//!   └──────cancel───────┴──────────────▶ Cancelled
//! ```
//!
//! Streaming consumers call [`Reassembler::drain`] after each push; consumers
//! that want the whole payload wait for [`Progress::Complete`] and call
//! [`Reassembler::into_payload`].

use bytes::{Bytes, BytesMut};

use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::{Chunk, StreamKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Empty,
    Accumulating,
    Complete,
    Cancelled,
}

impl ReassemblyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReassemblyState::Complete | ReassemblyState::Cancelled)
    }
}

/// Result of applying one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More chunks are expected.
    Pending,
    /// The terminal chunk was observed; the buffer is sealed.
    Complete,
    /// The reassembler had already finished; the chunk was discarded.
    Ignored,
}

#[derive(Debug)]
pub struct Reassembler {
    key: StreamKey,
    state: ReassemblyState,
    buffer: BytesMut,
    chunks: usize,
}

impl Reassembler {
    pub fn new(key: StreamKey) -> Self {
        Self {
            key,
            state: ReassemblyState::Empty,
            buffer: BytesMut::new(),
            chunks: 0,
        }
    }

    /// Apply the next delivered chunk.
    pub fn push(&mut self, chunk: &Chunk) -> ProtocolResult<Progress> {
        if chunk.key != self.key {
            return Err(ProtocolError::UnexpectedChunk {
                expected: self.key,
                actual: chunk.key,
            });
        }
        if self.state.is_terminal() {
            tracing::debug!(stream = %self.key, state = ?self.state, "Discarding chunk after stream end");
            return Ok(Progress::Ignored);
        }

        self.buffer.extend_from_slice(&chunk.payload);
        self.chunks += 1;

        if chunk.is_final {
            self.state = ReassemblyState::Complete;
            Ok(Progress::Complete)
        } else {
            self.state = ReassemblyState::Accumulating;
            Ok(Progress::Pending)
        }
    }

    /// Take the bytes buffered since the last drain.
    pub fn drain(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Tear down: discard the buffer and refuse further chunks.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.buffer.clear();
        self.state = ReassemblyState::Cancelled;
    }

    /// The sealed payload. `None` unless the stream completed.
    pub fn into_payload(self) -> Option<Bytes> {
        match self.state {
            ReassemblyState::Complete => Some(self.buffer.freeze()),
            _ => None,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Chunks applied so far, terminal chunk included.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{MessageId, StreamKind};

    fn key(id: u64) -> StreamKey {
        StreamKey::new(MessageId(id), StreamKind::Stdin)
    }

    fn chunks_for(key: StreamKey, payload: &[u8], size: usize) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = payload
            .chunks(size)
            .map(|part| Chunk::data(key, Bytes::copy_from_slice(part)))
            .collect();
        chunks.push(Chunk::terminal(key));
        chunks
    }

    #[test]
    fn test_round_trip_across_chunk_sizes() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for size in [1, 7, 64, 999, 1000, 4096] {
            let mut reassembler = Reassembler::new(key(1));
            let chunks = chunks_for(key(1), &payload, size);
            let (last, data) = chunks.split_last().unwrap();

            for chunk in data {
                assert_eq!(reassembler.push(chunk).unwrap(), Progress::Pending);
            }
            assert_eq!(reassembler.state(), ReassemblyState::Accumulating);
            assert_eq!(reassembler.push(last).unwrap(), Progress::Complete);
            assert_eq!(reassembler.into_payload().unwrap(), Bytes::from(payload.clone()));
        }
    }

    #[test]
    fn test_empty_stream_completes_immediately() {
        let mut reassembler = Reassembler::new(key(1));
        assert_eq!(reassembler.state(), ReassemblyState::Empty);
        assert_eq!(reassembler.push(&Chunk::terminal(key(1))).unwrap(), Progress::Complete);
        assert_eq!(reassembler.into_payload().unwrap(), Bytes::new());
    }

    #[test]
    fn test_incomplete_stream_has_no_payload() {
        let mut reassembler = Reassembler::new(key(1));
        reassembler
            .push(&Chunk::data(key(1), Bytes::from_static(b"partial")))
            .unwrap();
        assert!(reassembler.into_payload().is_none());
    }

    #[test]
    fn test_interleaved_message_ids() {
        let a = chunks_for(key(1), b"first command payload", 4);
        let b = chunks_for(key(2), b"second", 2);

        let mut ra = Reassembler::new(key(1));
        let mut rb = Reassembler::new(key(2));
        let mut ia = a.iter();
        let mut ib = b.iter();
        // Alternate unevenly while keeping each id's internal order.
        loop {
            let mut progressed = false;
            for chunk in ia.by_ref().take(2) {
                ra.push(chunk).unwrap();
                progressed = true;
            }
            if let Some(chunk) = ib.next() {
                rb.push(chunk).unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        assert_eq!(ra.into_payload().unwrap(), Bytes::from_static(b"first command payload"));
        assert_eq!(rb.into_payload().unwrap(), Bytes::from_static(b"second"));
    }

    #[test]
    fn test_drain_streams_incrementally() {
        let mut reassembler = Reassembler::new(key(1));
        reassembler.push(&Chunk::data(key(1), Bytes::from_static(b"hi"))).unwrap();
        assert_eq!(reassembler.drain(), Bytes::from_static(b"hi"));
        assert_eq!(reassembler.buffered(), 0);

        reassembler.push(&Chunk::data(key(1), Bytes::from_static(b"\n"))).unwrap();
        reassembler.push(&Chunk::terminal(key(1))).unwrap();
        assert_eq!(reassembler.drain(), Bytes::from_static(b"\n"));
        assert_eq!(reassembler.chunk_count(), 3);
    }

    #[test]
    fn test_cancel_discards_and_ignores_later_chunks() {
        let mut reassembler = Reassembler::new(key(1));
        reassembler.push(&Chunk::data(key(1), Bytes::from_static(b"abc"))).unwrap();
        reassembler.cancel();

        assert_eq!(reassembler.state(), ReassemblyState::Cancelled);
        assert_eq!(reassembler.buffered(), 0);
        assert_eq!(
            reassembler.push(&Chunk::terminal(key(1))).unwrap(),
            Progress::Ignored
        );
        assert!(reassembler.into_payload().is_none());
    }

    #[test]
    fn test_complete_is_reported_once() {
        let mut reassembler = Reassembler::new(key(1));
        assert_eq!(reassembler.push(&Chunk::terminal(key(1))).unwrap(), Progress::Complete);
        assert_eq!(reassembler.push(&Chunk::terminal(key(1))).unwrap(), Progress::Ignored);
    }

    #[test]
    fn test_foreign_chunk_rejected() {
        let mut reassembler = Reassembler::new(key(1));
        let err = reassembler.push(&Chunk::terminal(key(2))).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedChunk { .. }));
        assert_eq!(reassembler.state(), ReassemblyState::Empty);
    }
}
