//! In-process ledger.
//!
//! Shared by any number of identities. Enforces exact-nonce acceptance per
//! identity, keeps the full event history so checkpointed subscriptions can
//! replay it, and offers failure injection plus in-flight accounting for tests
//! and local dry runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::error::{LedgerError, SubmitError};
use crate::protocol::transport::{ChunkSubscription, LedgerTransport};
use crate::protocol::types::{
    ChunkEvent, ChunkFilter, ChunkTarget, ClientId, LedgerTransaction,
};

/// Buffered events per subscriber before it is considered lagging and dropped.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Default gas price suggestion: 1 gwei.
const DEFAULT_GAS_PRICE: u128 = 1_000_000_000;

#[derive(Debug, Default)]
struct Account {
    nonce: u64,
    in_flight: usize,
    max_in_flight: usize,
    gas_price: Option<u128>,
    injected: VecDeque<SubmitError>,
    subscribe_failure: Option<usize>,
    accepted: Vec<LedgerTransaction>,
}

struct Subscriber {
    filter: ChunkFilter,
    tx: mpsc::Sender<Result<ChunkEvent, LedgerError>>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, Account>,
    registry: HashMap<String, ClientId>,
    next_client_id: u64,
    history: Vec<ChunkEvent>,
    subscribers: Vec<Subscriber>,
    latency: Duration,
}

impl LedgerState {
    fn account(&mut self, identity: &str) -> &mut Account {
        self.accounts.entry(identity.to_string()).or_default()
    }

    fn publish(&mut self, event: ChunkEvent) {
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(Ok(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(kind = %event.chunk.key.kind, "Dropping lagging subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        self.history.push(event);
    }
}

/// A ledger living entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport handle signing as `identity`.
    pub fn transport(&self, identity: &str) -> MemoryTransport {
        self.state().account(identity);
        MemoryTransport {
            ledger: self.clone(),
            identity: identity.to_string(),
        }
    }

    /// Register `identity` in the client registry, returning its client id.
    pub fn register(&self, identity: &str) -> ClientId {
        let mut state = self.state();
        if let Some(id) = state.registry.get(identity) {
            return *id;
        }
        state.next_client_id += 1;
        let id = ClientId(state.next_client_id);
        state.registry.insert(identity.to_string(), id);
        id
    }

    /// Delay applied to every submission while it is in flight.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn set_gas_price(&self, identity: &str, gas_price: u128) {
        self.state().account(identity).gas_price = Some(gas_price);
    }

    /// Make the next submission from `identity` fail with `error`.
    pub fn inject_failure(&self, identity: &str, error: SubmitError) {
        self.state().account(identity).injected.push_back(error);
    }

    /// Make the subscribe call from `identity` after `skip` successful ones fail.
    pub fn fail_subscription(&self, identity: &str, skip: usize) {
        self.state().account(identity).subscribe_failure = Some(skip);
    }

    /// Consume a nonce of `identity` outside of any local submitter.
    pub fn advance_nonce(&self, identity: &str) {
        self.state().account(identity).nonce += 1;
    }

    pub fn account_nonce(&self, identity: &str) -> u64 {
        self.state().account(identity).nonce
    }

    /// Transactions accepted from `identity`, in acceptance order.
    pub fn accepted(&self, identity: &str) -> Vec<LedgerTransaction> {
        self.state().account(identity).accepted.clone()
    }

    /// Highest number of simultaneously in-flight submissions seen for `identity`.
    pub fn max_in_flight(&self, identity: &str) -> usize {
        self.state().account(identity).max_in_flight
    }

    /// All emitted events in ledger order.
    pub fn history(&self) -> Vec<ChunkEvent> {
        self.state().history.clone()
    }

    /// Live subscriptions whose receivers are still held.
    pub fn active_subscriptions(&self) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|sub| !sub.tx.is_closed())
            .count()
    }

    /// Emit an event directly, bypassing submission.
    pub fn emit(&self, event: ChunkEvent) {
        self.state().publish(event);
    }

    /// Fail every live subscription with `error` and drop it.
    pub fn break_subscriptions(&self, error: LedgerError) {
        let subscribers = std::mem::take(&mut self.state().subscribers);
        for sub in subscribers {
            let _ = sub.tx.try_send(Err(error.clone()));
        }
    }

    fn accept(&self, identity: &str, tx: LedgerTransaction) -> Result<(), SubmitError> {
        let mut state = self.state();
        let sender_scope = state.registry.get(identity).copied();

        let account = state.account(identity);
        if let Some(error) = account.injected.pop_front() {
            return Err(error);
        }
        if tx.params.nonce < account.nonce {
            return Err(SubmitError::NonceStale);
        }
        if tx.params.nonce > account.nonce {
            return Err(SubmitError::Rejected(format!(
                "nonce gap: expected {}, got {}",
                account.nonce, tx.params.nonce
            )));
        }

        let scope = match tx.call.target {
            ChunkTarget::Input { client_id, .. } => client_id,
            ChunkTarget::Output { .. } => sender_scope.ok_or_else(|| {
                SubmitError::Rejected(format!("sender {identity} is not a registered client"))
            })?,
        };

        account.nonce += 1;
        let event = ChunkEvent {
            scope,
            chunk: tx.call.chunk(),
        };
        account.accepted.push(tx);
        state.publish(event);
        Ok(())
    }
}

/// [`LedgerTransport`] over a [`MemoryLedger`] for one identity.
#[derive(Clone)]
pub struct MemoryTransport {
    ledger: MemoryLedger,
    identity: String,
}

impl MemoryTransport {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }
}

/// Counts a submission as in flight until dropped, including when the
/// submitting future is abandoned mid-flight.
struct InFlight<'a>(&'a MemoryTransport);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let transport = self.0;
        transport.ledger.state().account(&transport.identity).in_flight -= 1;
    }
}

#[async_trait]
impl LedgerTransport for MemoryTransport {
    async fn submit(&self, tx: LedgerTransaction) -> Result<(), SubmitError> {
        let latency = {
            let mut state = self.ledger.state();
            let latency = state.latency;
            let account = state.account(&self.identity);
            account.in_flight += 1;
            account.max_in_flight = account.max_in_flight.max(account.in_flight);
            latency
        };
        let _in_flight = InFlight(self);

        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        self.ledger.accept(&self.identity, tx)
    }

    async fn account_nonce(&self) -> Result<u64, LedgerError> {
        Ok(self.ledger.account_nonce(&self.identity))
    }

    async fn suggested_gas_price(&self) -> Result<u128, LedgerError> {
        let mut state = self.ledger.state();
        Ok(state
            .account(&self.identity)
            .gas_price
            .unwrap_or(DEFAULT_GAS_PRICE))
    }

    async fn client_id(&self) -> Result<ClientId, LedgerError> {
        self.ledger
            .state()
            .registry
            .get(&self.identity)
            .copied()
            .ok_or_else(|| LedgerError::NotRegistered(self.identity.clone()))
    }

    async fn checkpoint(&self) -> Result<u64, LedgerError> {
        Ok(self.ledger.state().history.len() as u64)
    }

    async fn subscribe(&self, filter: ChunkFilter) -> Result<ChunkSubscription, LedgerError> {
        let mut state = self.ledger.state();
        let account = state.account(&self.identity);
        match account.subscribe_failure {
            Some(0) => {
                account.subscribe_failure = None;
                return Err(LedgerError::Rpc("subscription refused".to_string()));
            }
            Some(skip) => account.subscribe_failure = Some(skip - 1),
            None => {}
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        if let Some(from) = filter.from {
            let start = (from as usize).min(state.history.len());
            for event in state.history[start..].iter().filter(|e| filter.matches(e)) {
                if tx.try_send(Ok(event.clone())).is_err() {
                    return Err(LedgerError::Rpc("replay exceeds subscription capacity".into()));
                }
            }
        }
        state.subscribers.push(Subscriber { filter, tx });
        Ok(ChunkSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{LedgerCall, MessageId, OutputKind, StreamKind, TxParams};
    use bytes::Bytes;

    fn input_tx(nonce: u64, client_id: ClientId, payload: &'static [u8]) -> LedgerTransaction {
        TxParams {
            nonce,
            gas_price: 1,
            gas_limit: 100_000,
        }
        .transaction(LedgerCall {
            target: ChunkTarget::Input {
                client_id,
                message_id: MessageId(1),
            },
            payload: Bytes::from_static(payload),
            is_final: false,
        })
    }

    #[tokio::test]
    async fn test_exact_nonce_acceptance() {
        let ledger = MemoryLedger::new();
        let transport = ledger.transport("controller");

        transport.submit(input_tx(0, ClientId(1), b"a")).await.unwrap();
        assert_eq!(
            transport.submit(input_tx(0, ClientId(1), b"b")).await,
            Err(SubmitError::NonceStale)
        );
        assert!(matches!(
            transport.submit(input_tx(5, ClientId(1), b"c")).await,
            Err(SubmitError::Rejected(_))
        ));
        assert_eq!(transport.account_nonce().await.unwrap(), 1);
        assert_eq!(ledger.accepted("controller").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_submission_is_no_longer_in_flight() {
        let ledger = MemoryLedger::new();
        ledger.set_latency(Duration::from_secs(60));
        let transport = ledger.transport("controller");

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            transport.submit(input_tx(0, ClientId(1), b"a")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(ledger.state().account("controller").in_flight, 0);

        transport.submit(input_tx(0, ClientId(1), b"b")).await.unwrap();
        assert_eq!(ledger.max_in_flight("controller"), 1);
        assert_eq!(ledger.state().account("controller").in_flight, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_replay() {
        let ledger = MemoryLedger::new();
        let transport = ledger.transport("controller");
        transport.submit(input_tx(0, ClientId(1), b"old")).await.unwrap();

        let checkpoint = transport.checkpoint().await.unwrap();
        transport.submit(input_tx(1, ClientId(1), b"new")).await.unwrap();

        let mut sub = transport
            .subscribe(ChunkFilter::new(StreamKind::Stdin).from_checkpoint(checkpoint))
            .await
            .unwrap();
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.chunk.payload, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_output_requires_registration() {
        let ledger = MemoryLedger::new();
        let transport = ledger.transport("server");
        let tx = TxParams {
            nonce: 0,
            gas_price: 1,
            gas_limit: 100_000,
        }
        .transaction(LedgerCall {
            target: ChunkTarget::Output {
                message_id: MessageId(1),
                kind: OutputKind::Stdout,
            },
            payload: Bytes::new(),
            is_final: true,
        });

        assert!(matches!(
            transport.submit(tx.clone()).await,
            Err(SubmitError::Rejected(_))
        ));
        assert_eq!(
            transport.client_id().await,
            Err(LedgerError::NotRegistered("server".into()))
        );

        let id = ledger.register("server");
        transport.submit(tx).await.unwrap();
        assert_eq!(ledger.history()[0].scope, id);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let ledger = MemoryLedger::new();
        let transport = ledger.transport("controller");
        let sub = transport
            .subscribe(ChunkFilter::new(StreamKind::Stdout))
            .await
            .unwrap();
        assert_eq!(ledger.active_subscriptions(), 1);
        drop(sub);
        assert_eq!(ledger.active_subscriptions(), 0);
    }
}
