//! The ledger capability the protocol runs on.
//!
//! Implementations sign and submit contract calls for one identity and expose
//! filtered, continuous subscriptions to emitted chunk events.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::protocol::error::{LedgerError, SubmitError};
use crate::protocol::types::{ChunkEvent, ChunkFilter, ClientId, LedgerTransaction};

/// Ledger access for one signing identity.
#[async_trait]
pub trait LedgerTransport: Send + Sync + 'static {
    /// Sign and submit a transaction. Succeeds or fails atomically per call.
    async fn submit(&self, tx: LedgerTransaction) -> Result<(), SubmitError>;

    /// Authoritative next nonce of this identity's account.
    async fn account_nonce(&self) -> Result<u64, LedgerError>;

    /// Current gas price suggestion in wei.
    async fn suggested_gas_price(&self) -> Result<u128, LedgerError>;

    /// Registry lookup of this identity's client id.
    async fn client_id(&self) -> Result<ClientId, LedgerError>;

    /// Current head position, usable as [`ChunkFilter::from`].
    async fn checkpoint(&self) -> Result<u64, LedgerError>;

    /// Open a subscription to events matching `filter`.
    async fn subscribe(&self, filter: ChunkFilter) -> Result<ChunkSubscription, LedgerError>;
}

/// Receiving end of a chunk event subscription.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct ChunkSubscription {
    rx: mpsc::Receiver<Result<ChunkEvent, LedgerError>>,
    feeder: Option<AbortHandle>,
}

impl ChunkSubscription {
    /// Wrap a channel fed by the transport itself.
    pub fn new(rx: mpsc::Receiver<Result<ChunkEvent, LedgerError>>) -> Self {
        Self { rx, feeder: None }
    }

    /// Wrap a channel fed by a background task that is aborted on drop.
    pub fn with_feeder(
        rx: mpsc::Receiver<Result<ChunkEvent, LedgerError>>,
        feeder: AbortHandle,
    ) -> Self {
        Self {
            rx,
            feeder: Some(feeder),
        }
    }

    /// Wait for the next event. `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<Result<ChunkEvent, LedgerError>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ChunkSubscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}
