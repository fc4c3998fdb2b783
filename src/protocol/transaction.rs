//! Serialized transaction submission for one signing identity.
//!
//! # Responsibilities
//! - Own the identity's nonce and gas price
//! - Submit one transaction at a time, across every logical stream
//! - Recover from nonce staleness (resync) and underpricing (price bump)
//! - Surface every other failure to the caller untouched

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::schema::ShellConfig;
use crate::observability::metrics;
use crate::protocol::error::{ProtocolError, ProtocolResult, SubmitError};
use crate::protocol::transport::LedgerTransport;
use crate::protocol::types::{LedgerTransaction, TxParams};
use crate::resilience::Backoff;

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Pricing and retry rules applied by the submitter.
#[derive(Debug, Clone)]
pub struct SubmitPolicy {
    pub gas_limit: u64,
    pub gas_price_multiplier: f64,
    pub max_gas_price_gwei: u64,
    pub gas_price_increment_wei: u128,
    pub backoff: Backoff,
    /// 0 retries until success, a non-contention failure, or cancellation.
    pub max_attempts: u32,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self::from(&ShellConfig::default())
    }
}

impl From<&ShellConfig> for SubmitPolicy {
    fn from(config: &ShellConfig) -> Self {
        Self {
            gas_limit: config.ledger.gas_limit,
            gas_price_multiplier: config.ledger.gas_price_multiplier,
            max_gas_price_gwei: config.ledger.max_gas_price_gwei,
            gas_price_increment_wei: u128::from(config.ledger.gas_price_increment_wei),
            backoff: Backoff::from(&config.retries),
            max_attempts: config.retries.max_attempts,
        }
    }
}

impl SubmitPolicy {
    fn initial_gas_price(&self, suggested: u128) -> u128 {
        (suggested as f64 * self.gas_price_multiplier) as u128
    }

    fn check_gas_price(&self, gas_price: u128) -> ProtocolResult<()> {
        let gas_price_gwei = gas_price / WEI_PER_GWEI;
        if gas_price_gwei > u128::from(self.max_gas_price_gwei) {
            return Err(ProtocolError::GasPriceTooHigh {
                current_gwei: gas_price_gwei.min(u128::from(u64::MAX)) as u64,
                max_gwei: self.max_gas_price_gwei,
            });
        }
        Ok(())
    }
}

/// Nonce and gas price of one signing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionState {
    pub nonce: u64,
    /// Price of the last accepted transaction, in wei.
    pub gas_price: u128,
}

/// The single submission point for one identity.
///
/// The state lock is held for a whole retry loop, so at most one logical
/// submission is outstanding per identity and nonces are handed out in strictly
/// increasing order.
pub struct TransactionSubmitter {
    transport: Arc<dyn LedgerTransport>,
    state: Mutex<TransactionState>,
    policy: SubmitPolicy,
    cancel: CancellationToken,
}

impl TransactionSubmitter {
    /// Create a submitter, seeding the nonce from the ledger.
    pub async fn new(
        transport: Arc<dyn LedgerTransport>,
        policy: SubmitPolicy,
        cancel: CancellationToken,
    ) -> ProtocolResult<Self> {
        let nonce = transport.account_nonce().await?;
        tracing::debug!(nonce = nonce, "Transaction submitter initialized");

        Ok(Self {
            transport,
            state: Mutex::new(TransactionState {
                nonce,
                gas_price: 0,
            }),
            policy,
            cancel,
        })
    }

    /// Submit the transaction produced by `build`, retrying through contention.
    ///
    /// `build` is called once per attempt with that attempt's parameters.
    /// Returns the parameters of the accepted transaction.
    pub async fn submit<F>(&self, build: F) -> ProtocolResult<TxParams>
    where
        F: Fn(TxParams) -> LedgerTransaction + Send + Sync,
    {
        let mut state = self.state.lock().await;

        let suggested = self.transport.suggested_gas_price().await?;
        let mut gas_price = self.policy.initial_gas_price(suggested);
        self.policy.check_gas_price(gas_price)?;

        let mut contended = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }

            let params = TxParams {
                nonce: state.nonce,
                gas_price,
                gas_limit: self.policy.gas_limit,
            };
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                outcome = self.transport.submit(build(params)) => outcome,
            };

            match outcome {
                Ok(()) => {
                    state.nonce += 1;
                    state.gas_price = gas_price;
                    metrics::record_transaction("accepted");
                    tracing::trace!(nonce = params.nonce, gas_price = gas_price, "Transaction accepted");
                    return Ok(params);
                }
                Err(SubmitError::NonceStale) => {
                    let nonce = self.transport.account_nonce().await?;
                    metrics::record_contention("nonce_stale");
                    tracing::debug!(stale = state.nonce, resynced = nonce, "Nonce resynchronized");
                    state.nonce = nonce;
                }
                Err(SubmitError::Underpriced) => {
                    gas_price = gas_price.saturating_add(self.policy.gas_price_increment_wei);
                    metrics::record_contention("underpriced");
                    tracing::debug!(nonce = state.nonce, gas_price = gas_price, "Gas price increased");
                    self.policy.check_gas_price(gas_price)?;
                }
                Err(e) => {
                    metrics::record_transaction("failed");
                    tracing::warn!(nonce = state.nonce, error = %e, "Transaction submission failed");
                    return Err(e.into());
                }
            }

            contended += 1;
            if self.policy.max_attempts > 0 && contended >= self.policy.max_attempts {
                metrics::record_transaction("abandoned");
                return Err(ProtocolError::RetriesExhausted(contended));
            }

            let delay = self.policy.backoff.delay(contended);
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Snapshot of the identity's transaction state.
    pub async fn state(&self) -> TransactionState {
        *self.state.lock().await
    }

    pub fn transport(&self) -> &Arc<dyn LedgerTransport> {
        &self.transport
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for TransactionSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSubmitter")
            .field("policy", &self.policy)
            .finish()
    }
}
