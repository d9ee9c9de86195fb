//! External fungible-asset ledger boundary.
//!
//! Escrow and payouts only ever move value through [`AssetLedger`]. The
//! in-memory implementation backs tests and simulations; a SQLite-backed one
//! lives in [`crate::storage::BalanceStore`].

use crate::error::{CoreError, Result};
use crate::types::AccountId;
use async_trait::async_trait;
use bitcoin::Amount;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait AssetLedger: Send + Sync {
    /// Credit `amount` to `account`
    async fn deposit(&self, account: &AccountId, amount: Amount) -> Result<()>;

    /// Move `amount` from `from` to `to`, failing with `InsufficientFunds`
    async fn transfer(&self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<()>;

    async fn balance_of(&self, account: &AccountId) -> Result<Amount>;
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    balances: RwLock<HashMap<AccountId, Amount>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetLedger for MemoryLedger {
    async fn deposit(&self, account: &AccountId, amount: Amount) -> Result<()> {
        let mut balances = self.balances.write();
        let balance = balances.entry(account.clone()).or_insert(Amount::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| CoreError::internal(format!("Balance overflow for {}", account)))?;
        Ok(())
    }

    async fn transfer(&self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<()> {
        let mut balances = self.balances.write();

        let available = balances.get(from).copied().unwrap_or(Amount::ZERO);
        let remaining = available
            .checked_sub(amount)
            .ok_or(CoreError::InsufficientFunds {
                need: amount.to_sat(),
                available: available.to_sat(),
            })?;

        let credited = balances
            .get(to)
            .copied()
            .unwrap_or(Amount::ZERO)
            .checked_add(amount)
            .ok_or_else(|| CoreError::internal(format!("Balance overflow for {}", to)))?;

        balances.insert(from.clone(), remaining);
        balances.insert(to.clone(), credited);

        tracing::debug!("Ledger transfer {} -> {}: {} sats", from, to, amount.to_sat());
        Ok(())
    }

    async fn balance_of(&self, account: &AccountId) -> Result<Amount> {
        Ok(self
            .balances
            .read()
            .get(account)
            .copied()
            .unwrap_or(Amount::ZERO))
    }
}
