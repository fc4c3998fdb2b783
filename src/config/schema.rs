//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a tan-shell
//! node. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a controller or server node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ShellConfig {
    /// Ledger endpoint, contract, and transaction pricing.
    pub ledger: LedgerConfig,

    /// Chunking and stream settings.
    pub protocol: ProtocolConfig,

    /// Contention retry behaviour.
    pub retries: RetryConfig,

    /// Command execution (server mode).
    pub executor: ExecutorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Ledger integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint URL.
    #[serde(alias = "endpoint")]
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs, used for reads.
    pub failover_urls: Vec<String>,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Address of the shell contract.
    pub contract_address: String,

    /// Hex private key. The environment variable takes precedence.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,

    /// Event polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Gas limit attached to every chunk transaction.
    pub gas_limit: u64,

    /// Gas price multiplier (1.0 = suggested, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,

    /// Wei added to the gas price after an underpriced rejection.
    pub gas_price_increment_wei: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            chain_id: 31337,
            rpc_timeout_secs: 10,
            contract_address: String::new(),
            private_key: None,
            poll_interval_ms: 1000,
            gas_limit: 100_000,
            gas_price_multiplier: 1.0,
            max_gas_price_gwei: 500,
            gas_price_increment_wei: 1,
        }
    }
}

/// Chunked stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest payload carried by a single chunk, in bytes.
    pub max_chunk_size: usize,

    /// Buffered chunks per controller output stream.
    pub stream_buffer: usize,

    /// Buffered commands between the listener and the executor.
    pub command_buffer: usize,

    /// Deadline for a stream to observe its terminal chunk. Unset waits forever.
    pub stream_timeout_secs: Option<u64>,

    /// First message id minus one. Unset seeds from the wall clock.
    pub message_id_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 4096,
            stream_buffer: 64,
            command_buffer: 16,
            stream_timeout_secs: None,
            message_id_seed: None,
        }
    }
}

/// Retry configuration for contended submissions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay for exponential backoff in milliseconds. 0 retries immediately.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Maximum contended attempts per submission. 0 retries until cancelled.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 2000,
            max_attempts: 0,
        }
    }
}

/// Command execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used to run commands (`sh` or `bash`).
    pub shell: String,

    /// Bytes read from the child's pipes per sink write.
    pub read_buffer_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            read_buffer_size: 20 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
