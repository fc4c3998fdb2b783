//! Signing identity.
//!
//! # Security
//! - The private key comes from `TANSHELL_PRIVATE_KEY`, or the config file as a fallback
//! - Keys are never logged or serialized

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;

use crate::blockchain::types::{LedgerConfig, LedgerResult};
use crate::protocol::error::LedgerError;

/// Environment variable name for the private key.
pub const PRIVATE_KEY_ENV_VAR: &str = "TANSHELL_PRIVATE_KEY";

/// One ledger identity. Nonces are owned by the submitter, not here.
#[derive(Debug, Clone)]
pub struct Wallet {
    signer: PrivateKeySigner,
}

impl Wallet {
    /// Create a wallet from a hex-encoded private key (with or without 0x prefix).
    pub fn from_private_key(private_key_hex: &str) -> LedgerResult<Self> {
        let key_hex = private_key_hex.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| LedgerError::Wallet(format!("Invalid private key format: {}", e)))?;

        tracing::info!(address = %signer.address(), "Wallet initialized");
        Ok(Self { signer })
    }

    /// Load the key from the environment, falling back to `ledger.private_key`.
    pub fn load(config: &LedgerConfig) -> LedgerResult<Self> {
        let env_key = std::env::var(PRIVATE_KEY_ENV_VAR).ok();
        Self::resolve(env_key.as_deref(), config.private_key.as_deref())
    }

    fn resolve(env_key: Option<&str>, config_key: Option<&str>) -> LedgerResult<Self> {
        match env_key.filter(|k| !k.trim().is_empty()).or(config_key) {
            Some(key) => Self::from_private_key(key),
            None => Err(LedgerError::Wallet(format!(
                "No private key: set {} or ledger.private_key",
                PRIVATE_KEY_ENV_VAR
            ))),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Network wallet used by the provider's signing filler.
    pub fn network_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}
