//! Controller side: send a command, stream back its output.
//!
//! # Data Flow
//! ```text
//! write(client, payload)
//!     → allocate message id
//!     → checkpoint ledger head
//!     → ChunkedStreamWriter (stdin chunks → TransactionSubmitter)
//!     → subscribe stdout + stderr from the checkpoint
//!     → one pump task per stream: subscription → Reassembler → OutputStream
//! ```

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::config::schema::ProtocolConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::protocol::error::{LedgerError, ProtocolError, ProtocolResult};
use crate::protocol::reassembler::{Progress, Reassembler};
use crate::protocol::transaction::TransactionSubmitter;
use crate::protocol::transport::{ChunkSubscription, LedgerTransport};
use crate::protocol::types::{ChunkFilter, ChunkTarget, ClientId, MessageId, StreamKey, StreamKind};
use crate::protocol::writer::ChunkedStreamWriter;

/// Dispatcher tuning, usually derived from [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub max_chunk_size: usize,
    pub stream_buffer: usize,
    pub stream_timeout: Option<Duration>,
    /// Ids are allocated starting at `message_id_seed + 1`.
    pub message_id_seed: u64,
}

impl From<&ProtocolConfig> for DispatcherOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            stream_buffer: config.stream_buffer,
            stream_timeout: config.stream_timeout_secs.map(Duration::from_secs),
            message_id_seed: config.message_id_seed.unwrap_or_else(clock_seed),
        }
    }
}

/// Seed ids from the wall clock so a restarted controller does not reuse them.
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The two live output streams of one dispatched command.
#[derive(Debug)]
pub struct CommandOutput {
    pub message_id: MessageId,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

/// Sends commands for one controller identity.
pub struct CommandDispatcher {
    transport: Arc<dyn LedgerTransport>,
    writer: ChunkedStreamWriter,
    next_id: AtomicU64,
    options: DispatcherOptions,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl CommandDispatcher {
    pub fn new(
        submitter: Arc<TransactionSubmitter>,
        options: DispatcherOptions,
        shutdown: &Shutdown,
    ) -> Self {
        let transport = submitter.transport().clone();
        let writer = ChunkedStreamWriter::new(submitter, options.max_chunk_size);
        Self {
            transport,
            writer,
            next_id: AtomicU64::new(options.message_id_seed),
            options,
            cancel: shutdown.child_token(),
            tracker: shutdown.tracker(),
        }
    }

    fn allocate(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Send `payload` to `client_id` and open its stdout and stderr streams.
    ///
    /// A failed input write returns before any subscription exists. A failed
    /// subscription tears down the other one before returning.
    pub async fn write(
        &self,
        client_id: ClientId,
        payload: impl Into<Bytes>,
    ) -> ProtocolResult<CommandOutput> {
        let message_id = self.allocate();
        let payload = payload.into();
        tracing::info!(
            message_id = %message_id,
            client_id = %client_id,
            bytes = payload.len(),
            "Dispatching command"
        );

        let checkpoint = self.transport.checkpoint().await?;
        self.writer
            .write(
                ChunkTarget::Input {
                    client_id,
                    message_id,
                },
                payload,
            )
            .await?;

        let stdout_sub = self
            .subscribe(client_id, message_id, StreamKind::Stdout, checkpoint)
            .await?;
        // On failure the stdout subscription is dropped, which unsubscribes it.
        let stderr_sub = self
            .subscribe(client_id, message_id, StreamKind::Stderr, checkpoint)
            .await?;

        Ok(CommandOutput {
            message_id,
            stdout: self.spawn_stream(StreamKey::new(message_id, StreamKind::Stdout), stdout_sub),
            stderr: self.spawn_stream(StreamKey::new(message_id, StreamKind::Stderr), stderr_sub),
        })
    }

    async fn subscribe(
        &self,
        client_id: ClientId,
        message_id: MessageId,
        kind: StreamKind,
        checkpoint: u64,
    ) -> ProtocolResult<ChunkSubscription> {
        let filter = ChunkFilter::new(kind)
            .scope(client_id)
            .message_id(message_id)
            .from_checkpoint(checkpoint);
        self.transport.subscribe(filter).await.map_err(|e| {
            tracing::warn!(message_id = %message_id, kind = %kind, error = %e, "Subscription failed");
            ProtocolError::from(e)
        })
    }

    fn spawn_stream(&self, key: StreamKey, subscription: ChunkSubscription) -> OutputStream {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer.max(1));
        let cancel = self.cancel.child_token();
        self.tracker.spawn(pump(
            subscription,
            Reassembler::new(key),
            tx,
            cancel.clone(),
            self.options.stream_timeout,
        ));
        OutputStream {
            key,
            rx,
            finished: false,
            _guard: cancel.drop_guard(),
        }
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("next_id", &self.next_id)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug)]
enum StreamItem {
    Data(Bytes),
    End,
    Failed(ProtocolError),
}

/// Feed one stream's subscription through its reassembler into the consumer channel.
async fn pump(
    mut subscription: ChunkSubscription,
    mut reassembler: Reassembler,
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) {
    let key = reassembler.key();
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let outcome: ProtocolResult<()> = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(ProtocolError::Cancelled),
            _ = &mut deadline => break Err(ProtocolError::StreamTimeout {
                key,
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            event = subscription.recv() => event,
        };

        let chunk = match event {
            Some(Ok(event)) => event.chunk,
            Some(Err(e)) => break Err(e.into()),
            None => break Err(LedgerError::SubscriptionClosed.into()),
        };

        let progress = match reassembler.push(&chunk) {
            Ok(progress) => progress,
            Err(e) => break Err(e),
        };

        let data = reassembler.drain();
        if !data.is_empty() {
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ProtocolError::Cancelled),
                sent = tx.send(StreamItem::Data(data)) => sent.is_ok(),
            };
            if !delivered {
                tracing::debug!(stream = %key, "Output stream dropped by consumer");
                reassembler.cancel();
                return;
            }
        }

        if progress == Progress::Complete {
            break Ok(());
        }
    };
    subscription.unsubscribe();

    match outcome {
        Ok(()) => {
            metrics::record_stream(key.kind.as_str(), "complete");
            tracing::debug!(stream = %key, chunks = reassembler.chunk_count(), "Output stream complete");
            let _ = tx.send(StreamItem::End).await;
        }
        Err(e) => {
            reassembler.cancel();
            let outcome = match e {
                ProtocolError::Cancelled => "cancelled",
                ProtocolError::StreamTimeout { .. } => "timeout",
                _ => "failed",
            };
            metrics::record_stream(key.kind.as_str(), outcome);
            tracing::debug!(stream = %key, error = %e, "Output stream ended early");
            let _ = tx.send(StreamItem::Failed(e)).await;
        }
    }
}

/// A live output stream of a dispatched command.
///
/// Yields data as chunks arrive and ends after the terminal chunk. A broken
/// subscription, timeout, or cancellation is yielded once as an error.
/// Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct OutputStream {
    key: StreamKey,
    rx: mpsc::Receiver<StreamItem>,
    finished: bool,
    _guard: DropGuard,
}

impl OutputStream {
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Next block of output. `None` once the stream has ended.
    pub async fn next_chunk(&mut self) -> Option<ProtocolResult<Bytes>> {
        self.next().await
    }

    /// Collect the stream until its terminal chunk.
    pub async fn read_to_end(mut self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for OutputStream {
    type Item = ProtocolResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamItem::Data(data))) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Some(StreamItem::End)) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            // The pump vanished without a verdict: only happens on runtime teardown.
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(Err(ProtocolError::Cancelled)))
            }
        }
    }
}
