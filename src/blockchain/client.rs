//! Ledger RPC client with timeout and failover.
//!
//! # Responsibilities
//! - Connect to the primary JSON-RPC endpoint and any failovers
//! - Query chain state (chain id, head block, account nonce, gas price, logs)
//! - Bound every call by the configured timeout
//! - Verify the connected chain at startup without failing on mismatch

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::TransportResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::blockchain::types::{ChainId, LedgerConfig, LedgerResult};
use crate::protocol::error::LedgerError;

/// Read-side RPC client. Each call tries the providers in order.
#[derive(Clone)]
pub struct LedgerClient {
    /// List of providers (primary + failovers).
    providers: Vec<DynProvider>,
    config: LedgerConfig,
    timeout_duration: Duration,
}

impl LedgerClient {
    /// Create a client. Fails only on an unparseable primary URL.
    pub async fn new(config: LedgerConfig) -> LedgerResult<Self> {
        let timeout_duration = Duration::from_secs(config.rpc_timeout_secs);
        let mut providers = Vec::new();

        let primary_url: url::Url = config.rpc_url.parse().map_err(|e| {
            LedgerError::Rpc(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;
        providers.push(ProviderBuilder::new().connect_http(primary_url).erased());

        for url_str in &config.failover_urls {
            match url_str.parse::<url::Url>() {
                Ok(url) => providers.push(ProviderBuilder::new().connect_http(url).erased()),
                Err(_) => tracing::warn!(url = %url_str, "Ignoring invalid failover RPC URL"),
            }
        }

        let client = Self {
            providers,
            config,
            timeout_duration,
        };

        match client.verify_chain_id().await {
            Ok(()) => tracing::info!(
                rpc_url = %client.config.rpc_url,
                chain_id = client.config.chain_id,
                failovers = client.providers.len() - 1,
                "Ledger client initialized"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "Ledger client initialized but chain verification failed"
            ),
        }

        Ok(client)
    }

    /// Verify the connected chain ID matches configuration.
    pub async fn verify_chain_id(&self) -> LedgerResult<()> {
        let chain_id = self.get_chain_id().await?;
        if chain_id.0 != self.config.chain_id {
            return Err(LedgerError::ChainMismatch {
                expected: self.config.chain_id,
                actual: chain_id.0,
            });
        }
        Ok(())
    }

    pub async fn get_chain_id(&self) -> LedgerResult<ChainId> {
        self.with_failover("get_chain_id", |p| async move { p.get_chain_id().await })
            .await
            .map(ChainId)
    }

    pub async fn get_block_number(&self) -> LedgerResult<u64> {
        self.with_failover("get_block_number", |p| async move { p.get_block_number().await })
            .await
    }

    /// Confirmed transaction count (nonce) of an address.
    pub async fn get_transaction_count(&self, address: Address) -> LedgerResult<u64> {
        self.with_failover("get_transaction_count", move |p| async move {
            p.get_transaction_count(address).await
        })
        .await
    }

    /// Current gas price in wei.
    pub async fn get_gas_price(&self) -> LedgerResult<u128> {
        self.with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
            .await
    }

    pub async fn get_logs(&self, filter: &Filter) -> LedgerResult<Vec<Log>> {
        self.with_failover("get_logs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// The primary provider, for contract reads.
    pub fn provider(&self) -> &DynProvider {
        &self.providers[0]
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    async fn with_failover<T, F, Fut>(&self, op: &'static str, call: F) -> LedgerResult<T>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut last_error = None;
        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, call(provider.clone())).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    tracing::warn!(provider_idx = i, op = op, error = %e, "RPC error, trying next provider");
                    last_error = Some(LedgerError::Rpc(format!("{op}: {e}")));
                }
                Err(_) => {
                    tracing::warn!(provider_idx = i, op = op, "RPC timeout, trying next provider");
                    last_error = Some(LedgerError::Timeout(self.config.rpc_timeout_secs));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LedgerError::Rpc(format!("{op}: no RPC providers"))))
    }
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("rpc_url", &self.config.rpc_url)
            .field("chain_id", &self.config.chain_id)
            .field("providers", &self.providers.len())
            .field("timeout_secs", &self.config.rpc_timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            rpc_timeout_secs: 2,
            ..LedgerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_client_creation_tolerates_unreachable_node() {
        let result = LedgerClient::new(test_config()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_primary_url_rejected() {
        let config = LedgerConfig {
            rpc_url: "not a url".to_string(),
            ..test_config()
        };
        let err = LedgerClient::new(config).await.unwrap_err();
        assert!(err.to_string().contains("Invalid RPC URL"));
    }

    #[tokio::test]
    async fn test_rpc_failover_exhausts_every_provider() {
        let mut config = test_config();
        config.failover_urls.push("http://127.0.0.1:2".to_string());
        config.failover_urls.push("::bad::".to_string());

        let client = LedgerClient::new(config).await.unwrap();
        assert_eq!(client.providers.len(), 2);

        let err = client.get_block_number().await.unwrap_err();
        assert!(matches!(err, LedgerError::Rpc(_) | LedgerError::Timeout(_)));
    }
}
