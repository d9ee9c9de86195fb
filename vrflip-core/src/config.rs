use crate::error::{CoreError, Result};
use crate::types::AccountId;
use bitcoin::secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Largest randomness domain a wager may use
pub const MAX_RESULT_CAP: u64 = 1337;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerConfig {
    pub max_result_cap: u64,
    /// Used when a wager is opened with `max_result == 0`
    pub default_max_result: u64,
    /// Receives the pot of single-party wagers the owner loses
    pub house_account: AccountId,
    /// Destination the oracle network calls back into
    pub callback_target: String,
    /// Hex x-only secp256k1 key of the trusted oracle
    pub oracle_public_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for WagerConfig {
    fn default() -> Self {
        Self {
            max_result_cap: MAX_RESULT_CAP,
            default_max_result: MAX_RESULT_CAP,
            house_account: AccountId::new("house"),
            callback_target: "vrflip/oracle-callback".to_string(),
            oracle_public_key: None,
            request_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl WagerConfig {
    pub fn new(oracle_public_key: impl Into<String>) -> Self {
        Self {
            oracle_public_key: Some(oracle_public_key.into()),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_house_account(mut self, account: impl Into<AccountId>) -> Self {
        self.house_account = account.into();
        self
    }

    /// Load a JSON config file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_result_cap < 2 {
            return Err(CoreError::config("Max result cap must be at least 2"));
        }

        if self.default_max_result == 0 || self.default_max_result > self.max_result_cap {
            return Err(CoreError::config(format!(
                "Default max result must be in 1..={}",
                self.max_result_cap
            )));
        }

        if self.house_account.as_str().is_empty() {
            return Err(CoreError::config("House account cannot be empty"));
        }

        if self.callback_target.is_empty() {
            return Err(CoreError::config("Callback target cannot be empty"));
        }

        if self.oracle_public_key.is_some() {
            self.trusted_oracle_key()?;
        }

        Ok(())
    }

    pub fn trusted_oracle_key(&self) -> Result<XOnlyPublicKey> {
        let key = self
            .oracle_public_key
            .as_deref()
            .ok_or_else(|| CoreError::config("Oracle public key is not configured"))?;

        XOnlyPublicKey::from_str(key)
            .map_err(|e| CoreError::invalid_key(format!("Oracle public key: {}", e)))
    }
}
