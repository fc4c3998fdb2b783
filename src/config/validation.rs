//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate endpoints and the contract address
//! - Validate value ranges (sizes > 0, multiplier >= 1.0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ShellConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use alloy::primitives::Address;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ShellConfig;
use crate::exec::Shell;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field}: invalid URL '{value}'")]
    InvalidUrl { field: &'static str, value: String },

    #[error("{field}: invalid address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("executor.shell: unsupported shell '{0}' (expected sh or bash)")]
    UnsupportedShell(String),

    #[error("observability.log_level: unknown level '{0}'")]
    InvalidLogLevel(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &ShellConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let ledger = &config.ledger;
    if ledger.rpc_url.parse::<url::Url>().is_err() {
        errors.push(ValidationError::InvalidUrl {
            field: "ledger.rpc_url",
            value: ledger.rpc_url.clone(),
        });
    }
    for failover in &ledger.failover_urls {
        if failover.parse::<url::Url>().is_err() {
            errors.push(ValidationError::InvalidUrl {
                field: "ledger.failover_urls",
                value: failover.clone(),
            });
        }
    }
    if ledger.contract_address.parse::<Address>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "ledger.contract_address",
            value: ledger.contract_address.clone(),
        });
    }
    non_zero(&mut errors, "ledger.rpc_timeout_secs", ledger.rpc_timeout_secs);
    non_zero(&mut errors, "ledger.poll_interval_ms", ledger.poll_interval_ms);
    non_zero(&mut errors, "ledger.gas_limit", ledger.gas_limit);
    non_zero(&mut errors, "ledger.max_gas_price_gwei", ledger.max_gas_price_gwei);
    non_zero(&mut errors, "ledger.gas_price_increment_wei", ledger.gas_price_increment_wei);
    if !ledger.gas_price_multiplier.is_finite() || ledger.gas_price_multiplier < 1.0 {
        errors.push(ValidationError::OutOfRange {
            field: "ledger.gas_price_multiplier",
            reason: format!("{} is below 1.0", ledger.gas_price_multiplier),
        });
    }

    let protocol = &config.protocol;
    non_zero(&mut errors, "protocol.max_chunk_size", protocol.max_chunk_size as u64);
    non_zero(&mut errors, "protocol.stream_buffer", protocol.stream_buffer as u64);
    non_zero(&mut errors, "protocol.command_buffer", protocol.command_buffer as u64);
    if let Some(secs) = protocol.stream_timeout_secs {
        non_zero(&mut errors, "protocol.stream_timeout_secs", secs);
    }

    let retries = &config.retries;
    if retries.max_delay_ms < retries.base_delay_ms {
        errors.push(ValidationError::OutOfRange {
            field: "retries.max_delay_ms",
            reason: format!(
                "{} is below base_delay_ms {}",
                retries.max_delay_ms, retries.base_delay_ms
            ),
        });
    }

    if config.executor.shell.parse::<Shell>().is_err() {
        errors.push(ValidationError::UnsupportedShell(config.executor.shell.clone()));
    }
    non_zero(&mut errors, "executor.read_buffer_size", config.executor.read_buffer_size as u64);

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::InvalidLogLevel(observability.log_level.clone()));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn non_zero(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero(field));
    }
}
