//! Remote shell protocol over an append-only ledger.
//!
//! # Data Flow
//! ```text
//! Controller                                   Server (registered client id)
//! CommandDispatcher::write(client, "echo hi")
//!     → ChunkedStreamWriter ─stdin chunks─▶ ledger ─▶ CommandListener
//!                                                      → Reassembler → Command
//!                                                      → executor writes OutputSink
//! OutputStream ◀─ Reassembler ◀── ledger ◀─stdout/stderr chunks─ ChunkedStreamWriter
//! ```
//!
//! Every write from one identity goes through its single
//! [`TransactionSubmitter`], which owns the account nonce.
//!
//! # Design Decisions
//! - The transport is a trait so the protocol runs against [`MemoryLedger`] in tests
//!   and against the Tanshell contract in production
//! - A stream ends with exactly one terminal chunk whose payload is empty
//! - Output subscriptions replay from a checkpoint taken before the input is written,
//!   so fast replies are never missed

pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod memory;
pub mod reassembler;
pub mod transaction;
pub mod transport;
pub mod types;
pub mod writer;

pub use dispatcher::{CommandDispatcher, CommandOutput, DispatcherOptions, OutputStream};
pub use error::{LedgerError, ProtocolError, ProtocolResult, SubmitError};
pub use listener::{Command, CommandListener, ListenerOptions, OutputSink};
pub use memory::{MemoryLedger, MemoryTransport};
pub use reassembler::{Progress, ReassemblyState, Reassembler};
pub use transaction::{SubmitPolicy, TransactionSubmitter};
pub use transport::{ChunkSubscription, LedgerTransport};
pub use types::{
    Chunk, ChunkEvent, ChunkFilter, ChunkTarget, ClientId, LedgerCall, LedgerTransaction,
    MessageId, OutputKind, StreamKey, StreamKind, TxParams,
};
pub use writer::ChunkedStreamWriter;
