//! Tanshell contract bindings and the alloy-backed [`LedgerTransport`].
//!
//! Writes are contract calls signed by the local wallet with the nonce, gas
//! price and gas limit chosen by the submitter. Subscriptions poll
//! `eth_getLogs` over a moving block cursor on a spawned task; dropping the
//! subscription aborts the task.

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::RpcError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::blockchain::client::LedgerClient;
use crate::blockchain::types::{classify_submit_error, LedgerConfig, LedgerResult};
use crate::blockchain::wallet::Wallet;
use crate::protocol::error::{LedgerError, SubmitError};
use crate::protocol::transport::{ChunkSubscription, LedgerTransport};
use crate::protocol::types::{
    Chunk, ChunkEvent, ChunkFilter, ChunkTarget, ClientId, LedgerTransaction, MessageId,
    OutputKind, StreamKey, StreamKind,
};

sol! {
    #[sol(rpc)]
    interface Tanshell {
        function clientID(address owner) external view returns (uint256);

        function stdin(uint256 clientId, uint256 msgId, bytes calldata stream, bool eof) external;
        function stdout(uint256 msgId, bytes calldata stream, bool eof) external;
        function stderr(uint256 msgId, bytes calldata stream, bool eof) external;

        #[derive(Debug)]
        event Stdin(uint256 indexed clientId, uint256 indexed msgId, bytes stream, bool eof);
        #[derive(Debug)]
        event Stdout(uint256 indexed clientId, uint256 indexed msgId, bytes stream, bool eof);
        #[derive(Debug)]
        event Stderr(uint256 indexed clientId, uint256 indexed msgId, bytes stream, bool eof);
    }
}

/// Consecutive failed polls tolerated before a subscription reports an error.
const MAX_POLL_FAILURES: u32 = 10;

const SUBSCRIPTION_CAPACITY: usize = 256;

/// Ledger transport over the Tanshell contract.
pub struct TanshellTransport {
    client: LedgerClient,
    contract: Tanshell::TanshellInstance<DynProvider>,
    contract_address: Address,
    address: Address,
    poll_interval: Duration,
}

impl TanshellTransport {
    /// Connect the read client and a signing provider for `wallet`.
    pub async fn connect(config: &LedgerConfig, wallet: &Wallet) -> LedgerResult<Self> {
        let contract_address: Address = config.contract_address.parse().map_err(|e| {
            LedgerError::Rpc(format!(
                "Invalid contract address '{}': {}",
                config.contract_address, e
            ))
        })?;
        let rpc_url: url::Url = config.rpc_url.parse().map_err(|e| {
            LedgerError::Rpc(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;

        let client = LedgerClient::new(config.clone()).await?;
        let sender = ProviderBuilder::new()
            .wallet(wallet.network_wallet())
            .connect_http(rpc_url)
            .erased();

        tracing::info!(
            contract = %contract_address,
            address = %wallet.address(),
            "Tanshell transport ready"
        );
        Ok(Self {
            client,
            contract: Tanshell::new(contract_address, sender),
            contract_address,
            address: wallet.address(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.client.config().rpc_timeout_secs)
    }
}

impl std::fmt::Debug for TanshellTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TanshellTransport")
            .field("contract", &self.contract_address)
            .field("address", &self.address)
            .field("client", &self.client)
            .finish()
    }
}

#[async_trait]
impl LedgerTransport for TanshellTransport {
    async fn submit(&self, tx: LedgerTransaction) -> Result<(), SubmitError> {
        let LedgerTransaction { call, params } = tx;
        let stream = alloy::primitives::Bytes::from(call.payload);

        let send = async {
            match call.target {
                ChunkTarget::Input {
                    client_id,
                    message_id,
                } => {
                    self.contract
                        .stdin(to_word(client_id.0), to_word(message_id.0), stream, call.is_final)
                        .nonce(params.nonce)
                        .gas_price(params.gas_price)
                        .gas(params.gas_limit)
                        .send()
                        .await
                }
                ChunkTarget::Output {
                    message_id,
                    kind: OutputKind::Stdout,
                } => {
                    self.contract
                        .stdout(to_word(message_id.0), stream, call.is_final)
                        .nonce(params.nonce)
                        .gas_price(params.gas_price)
                        .gas(params.gas_limit)
                        .send()
                        .await
                }
                ChunkTarget::Output {
                    message_id,
                    kind: OutputKind::Stderr,
                } => {
                    self.contract
                        .stderr(to_word(message_id.0), stream, call.is_final)
                        .nonce(params.nonce)
                        .gas_price(params.gas_price)
                        .gas(params.gas_limit)
                        .send()
                        .await
                }
            }
        };

        let pending = timeout(self.rpc_timeout(), send)
            .await
            .map_err(|_| SubmitError::Transport("send timed out".to_string()))?
            .map_err(classify_contract_error)?;
        tracing::trace!(tx_hash = %pending.tx_hash(), nonce = params.nonce, "Transaction broadcast");
        Ok(())
    }

    async fn account_nonce(&self) -> Result<u64, LedgerError> {
        self.client.get_transaction_count(self.address).await
    }

    async fn suggested_gas_price(&self) -> Result<u128, LedgerError> {
        self.client.get_gas_price().await
    }

    async fn client_id(&self) -> Result<ClientId, LedgerError> {
        let registry = Tanshell::new(self.contract_address, self.client.provider().clone());
        let id = timeout(self.rpc_timeout(), registry.clientID(self.address).call())
            .await
            .map_err(|_| LedgerError::Timeout(self.client.config().rpc_timeout_secs))?
            .map_err(|e| LedgerError::Rpc(format!("clientID: {e}")))?;

        if id.is_zero() {
            return Err(LedgerError::NotRegistered(self.address.to_string()));
        }
        u64::try_from(id)
            .map(ClientId)
            .map_err(|_| LedgerError::Decode(format!("client id {id} exceeds 64 bits")))
    }

    /// Positions are block heights; the checkpoint is the next block to be mined.
    async fn checkpoint(&self) -> Result<u64, LedgerError> {
        Ok(self.client.get_block_number().await? + 1)
    }

    async fn subscribe(&self, filter: ChunkFilter) -> Result<ChunkSubscription, LedgerError> {
        let cursor = match filter.from {
            Some(from) => from,
            None => self.checkpoint().await?,
        };
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let poller = LogPoller {
            client: self.client.clone(),
            contract: self.contract_address,
            filter,
            cursor,
            interval: self.poll_interval,
            tx,
        };
        let handle = tokio::spawn(poller.run());
        tracing::debug!(kind = %filter.kind, from_block = cursor, "Log subscription opened");
        Ok(ChunkSubscription::with_feeder(rx, handle.abort_handle()))
    }
}

fn classify_contract_error(err: alloy::contract::Error) -> SubmitError {
    match err {
        alloy::contract::Error::TransportError(RpcError::ErrorResp(payload)) => {
            classify_submit_error(&payload.message)
        }
        alloy::contract::Error::TransportError(other) => SubmitError::Transport(other.to_string()),
        other => SubmitError::Rejected(other.to_string()),
    }
}

fn to_word(value: u64) -> U256 {
    U256::from(value)
}

/// Indexed uint256 topic for `value`.
fn topic(value: u64) -> B256 {
    B256::from(to_word(value).to_be_bytes::<32>())
}

fn event_signature(kind: StreamKind) -> B256 {
    match kind {
        StreamKind::Stdin => Tanshell::Stdin::SIGNATURE_HASH,
        StreamKind::Stdout => Tanshell::Stdout::SIGNATURE_HASH,
        StreamKind::Stderr => Tanshell::Stderr::SIGNATURE_HASH,
    }
}

fn log_filter(contract: Address, filter: &ChunkFilter, from: u64, to: u64) -> Filter {
    let mut log_filter = Filter::new()
        .address(contract)
        .event_signature(event_signature(filter.kind))
        .from_block(from)
        .to_block(to);
    if let Some(scope) = filter.scope {
        log_filter = log_filter.topic1(topic(scope.0));
    }
    if let Some(message_id) = filter.message_id {
        log_filter = log_filter.topic2(topic(message_id.0));
    }
    log_filter
}

fn decode_log(kind: StreamKind, log: &Log) -> Result<ChunkEvent, LedgerError> {
    if log.topics().first() != Some(&event_signature(kind)) {
        return Err(LedgerError::Decode(format!("log is not a {kind} event")));
    }
    let decode_err = |e: alloy::sol_types::Error| LedgerError::Decode(e.to_string());
    let (client_id, msg_id, stream, eof) = match kind {
        StreamKind::Stdin => {
            let event = log.log_decode::<Tanshell::Stdin>().map_err(decode_err)?.inner.data;
            (event.clientId, event.msgId, event.stream, event.eof)
        }
        StreamKind::Stdout => {
            let event = log.log_decode::<Tanshell::Stdout>().map_err(decode_err)?.inner.data;
            (event.clientId, event.msgId, event.stream, event.eof)
        }
        StreamKind::Stderr => {
            let event = log.log_decode::<Tanshell::Stderr>().map_err(decode_err)?.inner.data;
            (event.clientId, event.msgId, event.stream, event.eof)
        }
    };

    let narrow = |value: U256, what: &str| {
        u64::try_from(value).map_err(|_| LedgerError::Decode(format!("{what} {value} exceeds 64 bits")))
    };
    Ok(ChunkEvent {
        scope: ClientId(narrow(client_id, "client id")?),
        chunk: Chunk {
            key: StreamKey::new(MessageId(narrow(msg_id, "message id")?), kind),
            payload: stream.0,
            is_final: eof,
        },
    })
}

struct LogPoller {
    client: LedgerClient,
    contract: Address,
    filter: ChunkFilter,
    cursor: u64,
    interval: Duration,
    tx: mpsc::Sender<Result<ChunkEvent, LedgerError>>,
}

impl LogPoller {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;
            if self.tx.is_closed() {
                return;
            }

            match self.poll().await {
                Ok(true) => failures = 0,
                Ok(false) => return,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(kind = %self.filter.kind, failures = failures, error = %e, "Log poll failed");
                    if failures >= MAX_POLL_FAILURES {
                        let _ = self.tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }
    }

    /// One poll round. `Ok(false)` once the subscriber is gone.
    async fn poll(&mut self) -> LedgerResult<bool> {
        let head = self.client.get_block_number().await?;
        if head < self.cursor {
            return Ok(true);
        }

        let logs = self
            .client
            .get_logs(&log_filter(self.contract, &self.filter, self.cursor, head))
            .await?;
        for log in &logs {
            match decode_log(self.filter.kind, log) {
                Ok(event) if self.filter.matches(&event) => {
                    if self.tx.send(Ok(event)).await.is_err() {
                        return Ok(false);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable log"),
            }
        }
        self.cursor = head + 1;
        Ok(true)
    }
}
