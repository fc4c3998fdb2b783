//! Protocol data model.
//!
//! Every command owns one [`MessageId`] shared by its three logical streams
//! (stdin, stdout, stderr). Chunks travel through the ledger tagged with that
//! id, the stream kind, and an end-of-stream flag.

use bytes::Bytes;
use std::fmt;

/// Identifier of one command's lifecycle, scoped per controller identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<MessageId> for u64 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry-assigned identifier of a server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ClientId> for u64 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three logical streams of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output stream selector for [`ChunkTarget::Output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl From<OutputKind> for StreamKind {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Stdout => StreamKind::Stdout,
            OutputKind::Stderr => StreamKind::Stderr,
        }
    }
}

/// Identity of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub message_id: MessageId,
    pub kind: StreamKind,
}

impl StreamKey {
    pub fn new(message_id: MessageId, kind: StreamKind) -> Self {
        Self { message_id, kind }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message_id, self.kind)
    }
}

/// A bounded fragment of a logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub key: StreamKey,
    pub payload: Bytes,
    pub is_final: bool,
}

impl Chunk {
    pub fn data(key: StreamKey, payload: Bytes) -> Self {
        Self {
            key,
            payload,
            is_final: false,
        }
    }

    /// The end-of-stream marker. Always carries an empty payload.
    pub fn terminal(key: StreamKey) -> Self {
        Self {
            key,
            payload: Bytes::new(),
            is_final: true,
        }
    }
}

/// Destination of an outgoing chunk.
///
/// Input chunks are addressed to a server's client id; output chunks are
/// scoped by the ledger to whichever registered identity sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkTarget {
    Input {
        client_id: ClientId,
        message_id: MessageId,
    },
    Output {
        message_id: MessageId,
        kind: OutputKind,
    },
}

impl ChunkTarget {
    pub fn key(&self) -> StreamKey {
        match *self {
            ChunkTarget::Input { message_id, .. } => StreamKey::new(message_id, StreamKind::Stdin),
            ChunkTarget::Output { message_id, kind } => StreamKey::new(message_id, kind.into()),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.key().message_id
    }
}

/// One logical contract call: `SubmitInput` or `SubmitOutput`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub target: ChunkTarget,
    pub payload: Bytes,
    pub is_final: bool,
}

impl LedgerCall {
    pub fn chunk(&self) -> Chunk {
        Chunk {
            key: self.target.key(),
            payload: self.payload.clone(),
            is_final: self.is_final,
        }
    }
}

/// Per-transaction parameters handed to a transaction builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub nonce: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    pub gas_limit: u64,
}

impl TxParams {
    pub fn transaction(self, call: LedgerCall) -> LedgerTransaction {
        LedgerTransaction { call, params: self }
    }
}

/// A fully parameterised call, ready for signing and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub call: LedgerCall,
    pub params: TxParams,
}

/// An event emitted by the ledger for one submitted chunk.
///
/// For stdin the scope is the recipient's client id; for stdout and stderr it
/// is the client id of the server that sent the chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEvent {
    pub scope: ClientId,
    pub chunk: Chunk,
}

/// Subscription filter over emitted chunk events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFilter {
    pub kind: StreamKind,
    pub scope: Option<ClientId>,
    pub message_id: Option<MessageId>,
    /// Ledger checkpoint to start from. `None` means live events only.
    pub from: Option<u64>,
}

impl ChunkFilter {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            scope: None,
            message_id: None,
            from: None,
        }
    }

    pub fn scope(mut self, scope: ClientId) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn from_checkpoint(mut self, checkpoint: u64) -> Self {
        self.from = Some(checkpoint);
        self
    }

    /// Whether an event passes this filter. The checkpoint is not considered.
    pub fn matches(&self, event: &ChunkEvent) -> bool {
        event.chunk.key.kind == self.kind
            && self.scope.map_or(true, |scope| scope == event.scope)
            && self
                .message_id
                .map_or(true, |id| id == event.chunk.key.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_keys() {
        let input = ChunkTarget::Input {
            client_id: ClientId(3),
            message_id: MessageId(7),
        };
        assert_eq!(input.key(), StreamKey::new(MessageId(7), StreamKind::Stdin));

        let output = ChunkTarget::Output {
            message_id: MessageId(7),
            kind: OutputKind::Stderr,
        };
        assert_eq!(output.key().kind, StreamKind::Stderr);
        assert_eq!(output.message_id(), MessageId(7));
    }

    #[test]
    fn test_filter_matching() {
        let event = ChunkEvent {
            scope: ClientId(3),
            chunk: Chunk::terminal(StreamKey::new(MessageId(9), StreamKind::Stdout)),
        };

        assert!(ChunkFilter::new(StreamKind::Stdout).matches(&event));
        assert!(ChunkFilter::new(StreamKind::Stdout)
            .scope(ClientId(3))
            .message_id(MessageId(9))
            .matches(&event));
        assert!(!ChunkFilter::new(StreamKind::Stderr).matches(&event));
        assert!(!ChunkFilter::new(StreamKind::Stdout)
            .scope(ClientId(4))
            .matches(&event));
        assert!(!ChunkFilter::new(StreamKind::Stdout)
            .message_id(MessageId(8))
            .matches(&event));
    }

    #[test]
    fn test_terminal_chunk_is_empty() {
        let chunk = Chunk::terminal(StreamKey::new(MessageId(1), StreamKind::Stdin));
        assert!(chunk.is_final);
        assert!(chunk.payload.is_empty());
    }
}
