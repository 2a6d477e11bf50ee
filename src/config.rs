// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Client configuration, loadable from a JSON file.

use crate::errors::{InternalError, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root directory for persisted signers and derivation indexes.
    pub data_dir: PathBuf,

    /// Host chain family, used as the first directory level below
    /// `data_dir` (`ethereum`, `celo`, ...).
    pub chain_name: String,

    /// Keep lifecycle timing.
    pub client: ClientConfig,

    /// Background pre-parameters generation.
    pub pre_params: PreParamsConfig,

    /// Threshold protocol sessions.
    pub tss: TssConfig,

    /// Application-specific extensions.
    pub extensions: Extensions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            chain_name: "ethereum".to_string(),
            client: ClientConfig::default(),
            pre_params: PreParamsConfig::default(),
            tss: TssConfig::default(),
            extensions: Extensions::default(),
        }
    }
}

/// Timing of the keep lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// How far back keeps awaiting key generation are considered at startup
    /// (seconds)
    pub awaiting_key_generation_lookback_secs: u64,

    /// Overall key generation timeout, across retries (seconds)
    pub key_generation_timeout_secs: u64,

    /// Timeout of a single key generation attempt (seconds)
    pub key_generation_attempt_timeout_secs: u64,

    /// Overall timeout for producing one signature, across retries (seconds)
    pub signing_timeout_secs: u64,

    /// Timeout of a single signing attempt (seconds)
    pub signing_attempt_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            awaiting_key_generation_lookback_secs: 24 * 60 * 60,
            key_generation_timeout_secs: 3 * 60 * 60,
            key_generation_attempt_timeout_secs: 10 * 60,
            signing_timeout_secs: 2 * 60 * 60,
            signing_attempt_timeout_secs: 2 * 60,
        }
    }
}

impl ClientConfig {
    /// Lookback window for keeps awaiting key generation.
    pub fn awaiting_key_generation_lookback(&self) -> Duration {
        Duration::from_secs(self.awaiting_key_generation_lookback_secs)
    }

    /// Key generation deadline.
    pub fn key_generation_timeout(&self) -> Duration {
        Duration::from_secs(self.key_generation_timeout_secs)
    }

    /// Single key generation attempt deadline.
    pub fn key_generation_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.key_generation_attempt_timeout_secs)
    }

    /// Signing deadline.
    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    /// Single signing attempt deadline.
    pub fn signing_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_attempt_timeout_secs)
    }
}

/// Background pre-parameters generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreParamsConfig {
    /// Number of pre-parameters kept ready
    pub target_pool_size: usize,

    /// Give up on one generation after this long (seconds)
    pub generation_timeout_secs: u64,

    /// Pause between two generations (seconds)
    pub generation_delay_secs: u64,
}

impl Default for PreParamsConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 20,
            generation_timeout_secs: 7 * 60,
            generation_delay_secs: 10,
        }
    }
}

impl PreParamsConfig {
    /// Deadline of one generation.
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Pause between generations.
    pub fn generation_delay(&self) -> Duration {
        Duration::from_secs(self.generation_delay_secs)
    }
}

/// Threshold protocol sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TssConfig {
    /// Wait this long for every member to announce itself (seconds)
    pub ready_timeout_secs: u64,

    /// Initial retry backoff (milliseconds)
    pub retry_backoff_millis: u64,

    /// Upper bound of the retry backoff (seconds)
    pub max_backoff_secs: u64,

    /// Wait this long for a submitted public key to be published (seconds)
    pub publication_timeout_secs: u64,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 2 * 60,
            retry_backoff_millis: 500,
            max_backoff_secs: 30,
            publication_timeout_secs: 10 * 60,
        }
    }
}

impl TssConfig {
    /// Presence announcement deadline.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// First retry delay.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_millis)
    }

    /// Largest retry delay.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Publication deadline after a key submission.
    pub fn publication_timeout(&self) -> Duration {
        Duration::from_secs(self.publication_timeout_secs)
    }
}

/// Application-specific extensions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Extensions {
    /// tBTC liquidation recovery; disabled when absent.
    pub tbtc: Option<TbtcConfig>,
}

/// tBTC extension settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TbtcConfig {
    /// Liquidation recovery settings.
    pub liquidation_recovery: LiquidationRecoveryConfig,
}

/// Liquidation recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LiquidationRecoveryConfig {
    /// A Bitcoin address or BIP32 extended public key
    pub beneficiary_address: String,

    /// Highest fee this operator agrees to (satoshi per vbyte)
    pub max_fee_per_vbyte: u32,

    /// `bitcoin`, `testnet`, `signet` or `regtest`
    pub bitcoin_network: String,

    /// Base URL of the Electrs HTTP API
    pub electrs_url: String,

    /// Overall recovery timeout (seconds)
    pub timeout_secs: u64,
}

impl Default for LiquidationRecoveryConfig {
    fn default() -> Self {
        Self {
            beneficiary_address: String::new(),
            max_fee_per_vbyte: 75,
            bitcoin_network: "bitcoin".to_string(),
            electrs_url: String::new(),
            timeout_secs: 48 * 60 * 60,
        }
    }
}

impl LiquidationRecoveryConfig {
    /// The configured Bitcoin network.
    pub fn network(&self) -> Result<Network> {
        Network::from_str(&self.bitcoin_network).map_err(|_| {
            InternalError::Configuration(format!(
                "unknown bitcoin network `{}`",
                self.bitcoin_network
            ))
        })
    }

    /// Recovery deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.beneficiary_address.is_empty() {
            return Err(InternalError::Configuration(
                "liquidation recovery needs a beneficiary address".into(),
            ));
        }
        if self.electrs_url.is_empty() {
            return Err(InternalError::Configuration(
                "liquidation recovery needs an electrs url".into(),
            ));
        }
        if self.max_fee_per_vbyte == 0 || self.timeout_secs == 0 {
            return Err(InternalError::Configuration(
                "liquidation recovery fee and timeout must be positive".into(),
            ));
        }
        self.network().map(|_| ())
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InternalError::Configuration(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| InternalError::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| InternalError::Configuration(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| InternalError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(InternalError::Configuration(reason.into()));
        if self.data_dir.as_os_str().is_empty() {
            return invalid("data directory must be set");
        }
        if self.chain_name.is_empty() {
            return invalid("chain name must be set");
        }
        let client = &self.client;
        if client.key_generation_timeout_secs == 0
            || client.key_generation_attempt_timeout_secs == 0
            || client.signing_timeout_secs == 0
            || client.signing_attempt_timeout_secs == 0
            || self.tss.ready_timeout_secs == 0
            || self.tss.publication_timeout_secs == 0
            || self.pre_params.generation_timeout_secs == 0
        {
            return invalid("timeouts must be positive");
        }
        if self.pre_params.target_pool_size == 0 {
            return invalid("pre-parameters pool target must be positive");
        }
        if let Some(tbtc) = &self.extensions.tbtc {
            tbtc.liquidation_recovery.validate()?;
        }
        Ok(())
    }

    /// Directory holding the signers of this chain.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(&self.chain_name)
    }
}
