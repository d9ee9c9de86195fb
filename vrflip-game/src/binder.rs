//! Single-use tokens binding an oracle callback to the wager that requested it.
//!
//! A token is the only capability that can resolve a wager. [`consume`]
//! removes the mapping in the same critical section as the lookup, so a
//! redelivered or forged callback can never resolve a wager twice.
//!
//! [`consume`]: RandomnessRequestBinder::consume

use crate::wager::WagerKey;
use crate::{Result, WagerError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinderToken(String);

impl BinderToken {
    /// Wrap a token received from the oracle transport
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BinderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct BinderTables {
    nonce: u64,
    by_token: HashMap<BinderToken, WagerKey>,
    by_wager: HashMap<WagerKey, BinderToken>,
}

pub struct RandomnessRequestBinder {
    // distinguishes tokens issued by different binder instances
    instance: Uuid,
    tables: Mutex<BinderTables>,
}

impl Default for RandomnessRequestBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomnessRequestBinder {
    pub fn new() -> Self {
        Self {
            instance: Uuid::new_v4(),
            tables: Mutex::new(BinderTables::default()),
        }
    }

    /// Issue a fresh token for `key`
    pub fn issue(&self, key: &WagerKey) -> Result<BinderToken> {
        let mut tables = self.tables.lock();

        if tables.by_wager.contains_key(key) {
            return Err(WagerError::AlreadyPending(key.clone()));
        }

        let nonce = tables.nonce;
        tables.nonce += 1;

        let mut hasher = Sha256::new();
        hasher.update(self.instance.as_bytes());
        hasher.update(nonce.to_le_bytes());
        hasher.update(key.owner.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(key.id.as_bytes());
        let token = BinderToken(hex::encode(hasher.finalize()));

        tables.by_token.insert(token.clone(), key.clone());
        tables.by_wager.insert(key.clone(), token.clone());

        tracing::debug!("Issued binder token {} for wager {}", token, key);
        Ok(token)
    }

    /// Wager bound to `token`, leaving the token outstanding
    pub fn peek(&self, token: &BinderToken) -> Result<WagerKey> {
        self.tables
            .lock()
            .by_token
            .get(token)
            .cloned()
            .ok_or(WagerError::UnknownOrConsumedToken)
    }

    /// Look up and remove the mapping for `token` in one step
    pub fn consume(&self, token: &BinderToken) -> Result<WagerKey> {
        let mut tables = self.tables.lock();

        let key = tables
            .by_token
            .remove(token)
            .ok_or(WagerError::UnknownOrConsumedToken)?;
        tables.by_wager.remove(&key);

        tracing::debug!("Consumed binder token {} for wager {}", token, key);
        Ok(key)
    }

    /// Withdraw the outstanding token of `key`, if any
    pub fn revoke(&self, key: &WagerKey) -> Option<BinderToken> {
        let mut tables = self.tables.lock();

        let token = tables.by_wager.remove(key)?;
        tables.by_token.remove(&token);

        tracing::debug!("Revoked binder token {} for wager {}", token, key);
        Some(token)
    }

    pub fn pending_for(&self, key: &WagerKey) -> Option<BinderToken> {
        self.tables.lock().by_wager.get(key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.tables.lock().by_token.len()
    }
}
