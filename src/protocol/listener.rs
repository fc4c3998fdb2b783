//! Server side: reassemble inbound commands and ship their output back.
//!
//! # Data Flow
//! ```text
//! registry lookup → ClientId
//! stdin subscription (scope = ClientId)
//!     → one Reassembler per open message id
//!     → on Complete: Command { input, stdout sink, stderr sink }
//!
//! sink.write(bytes) → sink task → ChunkedStreamWriter::write_data
//! sink close / drop → sink task → ChunkedStreamWriter::finish
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::schema::ProtocolConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::protocol::error::{LedgerError, ProtocolError, ProtocolResult};
use crate::protocol::reassembler::{Progress, Reassembler};
use crate::protocol::transaction::TransactionSubmitter;
use crate::protocol::transport::ChunkSubscription;
use crate::protocol::types::{
    ChunkEvent, ChunkFilter, ChunkTarget, ClientId, MessageId, OutputKind, StreamKind,
};
use crate::protocol::writer::ChunkedStreamWriter;

/// Listener tuning, usually derived from [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub max_chunk_size: usize,
    pub command_buffer: usize,
    pub sink_buffer: usize,
    /// Inbound reassemblies older than this are discarded.
    pub stream_timeout: Option<Duration>,
}

impl From<&ProtocolConfig> for ListenerOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            command_buffer: config.command_buffer,
            sink_buffer: config.stream_buffer,
            stream_timeout: config.stream_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// A fully received command awaiting execution.
#[derive(Debug)]
pub struct Command {
    pub id: MessageId,
    pub input: Bytes,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

enum SinkMessage {
    Data(Bytes),
    Close {
        reason: Option<String>,
        ack: oneshot::Sender<ProtocolResult<()>>,
    },
}

/// Write-only channel feeding one output stream back to the controller.
///
/// Every non-empty write becomes one or more data chunks. Closing, cleanly or
/// with an error, emits the terminal chunk; so does dropping the sink. Once a
/// data chunk fails to submit, later writes are dropped and `close` reports
/// that failure after the terminal chunk is sent.
#[derive(Debug, Clone)]
pub struct OutputSink {
    message_id: MessageId,
    kind: OutputKind,
    tx: mpsc::Sender<SinkMessage>,
}

impl OutputSink {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> ProtocolResult<()> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(SinkMessage::Data(data))
            .await
            .map_err(|_| ProtocolError::SinkClosed(self.message_id))
    }

    /// Close the stream and wait until its terminal chunk is submitted.
    pub async fn close(self) -> ProtocolResult<()> {
        self.finish(None).await
    }

    /// Close the stream after a failure upstream. The terminal chunk is still sent.
    pub async fn close_with_error(self, reason: impl Into<String>) -> ProtocolResult<()> {
        self.finish(Some(reason.into())).await
    }

    async fn finish(self, reason: Option<String>) -> ProtocolResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SinkMessage::Close { reason, ack })
            .await
            .map_err(|_| ProtocolError::SinkClosed(self.message_id))?;
        done.await
            .map_err(|_| ProtocolError::SinkClosed(self.message_id))?
    }
}

impl std::fmt::Debug for SinkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkMessage::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            SinkMessage::Close { reason, .. } => {
                f.debug_struct("Close").field("reason", reason).finish()
            }
        }
    }
}

/// Drain one sink into the ledger until it closes.
///
/// After a failed data submission the remaining data is discarded, but the
/// terminal chunk is still sent once the sink closes. The close is then
/// acknowledged with the data failure.
async fn drive_sink(
    writer: ChunkedStreamWriter,
    target: ChunkTarget,
    mut rx: mpsc::Receiver<SinkMessage>,
    cancel: CancellationToken,
) {
    let key = target.key();
    let mut failure: Option<ProtocolError> = None;
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(stream = %key, "Sink writer cancelled");
                metrics::record_stream(key.kind.as_str(), "cancelled");
                return;
            }
            message = rx.recv() => message,
        };

        match message {
            Some(SinkMessage::Data(data)) if failure.is_some() => {
                tracing::debug!(stream = %key, bytes = data.len(), "Discarding output after delivery failure");
            }
            Some(SinkMessage::Data(data)) => {
                if let Err(e) = writer.write_data(target, data).await {
                    tracing::error!(stream = %key, error = %e, "Output delivery failed, discarding further data");
                    metrics::record_stream(key.kind.as_str(), "failed");
                    failure = Some(e);
                }
            }
            Some(SinkMessage::Close { reason, ack }) => {
                if let Some(reason) = reason {
                    tracing::warn!(stream = %key, reason = %reason, "Sink closed with error");
                }
                let result = finish_stream(&writer, target).await;
                let _ = ack.send(match failure {
                    Some(e) => Err(e),
                    None => result,
                });
                return;
            }
            None => {
                let _ = finish_stream(&writer, target).await;
                return;
            }
        }
    }
}

async fn finish_stream(writer: &ChunkedStreamWriter, target: ChunkTarget) -> ProtocolResult<()> {
    let key = target.key();
    match writer.finish(target).await {
        Ok(()) => {
            metrics::record_stream(key.kind.as_str(), "complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(stream = %key, error = %e, "Failed to submit terminal chunk");
            metrics::record_stream(key.kind.as_str(), "failed");
            Err(e)
        }
    }
}

struct PendingReassembly {
    reassembler: Reassembler,
    opened_at: Instant,
}

struct ListenerTask {
    subscription: ChunkSubscription,
    pending: HashMap<MessageId, PendingReassembly>,
    writer: ChunkedStreamWriter,
    commands: mpsc::Sender<ProtocolResult<Command>>,
    options: ListenerOptions,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ListenerTask {
    async fn run(mut self) {
        let sweep_every = self.options.stream_timeout.unwrap_or(Duration::from_secs(60));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("Command listener cancelled");
                    break;
                }
                _ = sweep.tick(), if self.options.stream_timeout.is_some() => {
                    self.collect_stale();
                }
                event = self.subscription.recv() => match event {
                    Some(Ok(event)) => {
                        if self.apply(event).await.is_err() {
                            tracing::info!("Command consumer gone, stopping listener");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Inbound subscription failed");
                        let _ = self.commands.send(Err(e.into())).await;
                        break;
                    }
                    None => {
                        tracing::error!("Inbound subscription closed");
                        let _ = self
                            .commands
                            .send(Err(LedgerError::SubscriptionClosed.into()))
                            .await;
                        break;
                    }
                },
            }
        }

        for (_, mut pending) in self.pending.drain() {
            pending.reassembler.cancel();
        }
        metrics::record_pending_reassemblies(0);
    }

    /// Apply one inbound chunk. Errs only when the command consumer is gone.
    async fn apply(&mut self, event: ChunkEvent) -> ProtocolResult<()> {
        let key = event.chunk.key;
        if key.kind != StreamKind::Stdin {
            tracing::warn!(stream = %key, "Ignoring non-input chunk on inbound subscription");
            return Ok(());
        }

        let pending = self
            .pending
            .entry(key.message_id)
            .or_insert_with(|| PendingReassembly {
                reassembler: Reassembler::new(key),
                opened_at: Instant::now(),
            });

        match pending.reassembler.push(&event.chunk) {
            Ok(Progress::Complete) => {}
            Ok(Progress::Pending) | Ok(Progress::Ignored) => {
                metrics::record_pending_reassemblies(self.pending.len());
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(stream = %key, error = %e, "Dropping malformed chunk");
                return Ok(());
            }
        }

        let input = self
            .pending
            .remove(&key.message_id)
            .and_then(|pending| pending.reassembler.into_payload())
            .unwrap_or_default();
        metrics::record_pending_reassemblies(self.pending.len());
        tracing::info!(message_id = %key.message_id, bytes = input.len(), "Command received");

        let command = self.open_command(key.message_id, input);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            sent = self.commands.send(Ok(command)) => sent.map_err(|_| ProtocolError::ListenerClosed),
        }
    }

    fn open_command(&self, id: MessageId, input: Bytes) -> Command {
        Command {
            id,
            input,
            stdout: self.open_sink(id, OutputKind::Stdout),
            stderr: self.open_sink(id, OutputKind::Stderr),
        }
    }

    fn open_sink(&self, message_id: MessageId, kind: OutputKind) -> OutputSink {
        let (tx, rx) = mpsc::channel(self.options.sink_buffer.max(1));
        let target = ChunkTarget::Output { message_id, kind };
        self.tracker.spawn(drive_sink(
            self.writer.clone(),
            target,
            rx,
            self.cancel.child_token(),
        ));
        OutputSink {
            message_id,
            kind,
            tx,
        }
    }

    fn collect_stale(&mut self) {
        let Some(timeout) = self.options.stream_timeout else {
            return;
        };
        self.pending.retain(|id, pending| {
            if pending.opened_at.elapsed() < timeout {
                return true;
            }
            tracing::warn!(
                message_id = %id,
                buffered = pending.reassembler.buffered(),
                "Discarding unterminated command"
            );
            pending.reassembler.cancel();
            metrics::record_stream(StreamKind::Stdin.as_str(), "timeout");
            false
        });
        metrics::record_pending_reassemblies(self.pending.len());
    }
}

/// Receives commands addressed to this server identity.
#[derive(Debug)]
pub struct CommandListener {
    client_id: ClientId,
    commands: mpsc::Receiver<ProtocolResult<Command>>,
}

impl CommandListener {
    /// Resolve this identity's client id and start listening for new commands.
    pub async fn start(
        submitter: Arc<TransactionSubmitter>,
        options: ListenerOptions,
        shutdown: &Shutdown,
    ) -> ProtocolResult<Self> {
        let transport = submitter.transport().clone();
        let client_id = transport.client_id().await?;
        let checkpoint = transport.checkpoint().await?;
        let subscription = transport
            .subscribe(
                ChunkFilter::new(StreamKind::Stdin)
                    .scope(client_id)
                    .from_checkpoint(checkpoint),
            )
            .await?;

        let (tx, rx) = mpsc::channel(options.command_buffer.max(1));
        let task = ListenerTask {
            subscription,
            pending: HashMap::new(),
            writer: ChunkedStreamWriter::new(submitter, options.max_chunk_size),
            commands: tx,
            options,
            cancel: shutdown.child_token(),
            tracker: shutdown.tracker(),
        };
        shutdown.tracker().spawn(task.run());

        tracing::info!(client_id = %client_id, checkpoint = checkpoint, "Listening for commands");
        Ok(Self {
            client_id,
            commands: rx,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Next complete command. `None` once the listener has stopped.
    pub async fn next_command(&mut self) -> Option<ProtocolResult<Command>> {
        self.commands.recv().await
    }
}
