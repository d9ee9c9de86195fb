use crate::error::{CoreError, Result};
use crate::ledger::AssetLedger;
use crate::storage::Storage;
use crate::types::AccountId;
use async_trait::async_trait;
use bitcoin::Amount;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

/// Asset ledger persisted in the `balances` table
pub struct BalanceStore {
    storage: Arc<Storage>,
}

impl BalanceStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

fn read_balance(conn: &Connection, account: &AccountId) -> Result<Amount> {
    let sats: Option<i64> = conn
        .query_row(
            "SELECT amount FROM balances WHERE account = ?1",
            params![account.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(Amount::from_sat(sats.unwrap_or(0) as u64))
}

fn write_balance(conn: &Connection, account: &AccountId, amount: Amount) -> Result<()> {
    let sats = i64::try_from(amount.to_sat())
        .map_err(|_| CoreError::internal(format!("Balance overflow for {}", account)))?;

    conn.execute(
        "INSERT OR REPLACE INTO balances (account, amount, updated_at) VALUES (?1, ?2, ?3)",
        params![account.as_str(), sats, Utc::now().timestamp()],
    )?;
    Ok(())
}

#[async_trait]
impl AssetLedger for BalanceStore {
    async fn deposit(&self, account: &AccountId, amount: Amount) -> Result<()> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction()?;

        let credited = read_balance(&tx, account)?
            .checked_add(amount)
            .ok_or_else(|| CoreError::internal(format!("Balance overflow for {}", account)))?;
        write_balance(&tx, account, credited)?;

        tx.commit()?;
        Ok(())
    }

    async fn transfer(&self, from: &AccountId, to: &AccountId, amount: Amount) -> Result<()> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction()?;

        let available = read_balance(&tx, from)?;
        let remaining = available
            .checked_sub(amount)
            .ok_or(CoreError::InsufficientFunds {
                need: amount.to_sat(),
                available: available.to_sat(),
            })?;
        write_balance(&tx, from, remaining)?;

        let credited = read_balance(&tx, to)?
            .checked_add(amount)
            .ok_or_else(|| CoreError::internal(format!("Balance overflow for {}", to)))?;
        write_balance(&tx, to, credited)?;

        tx.commit()?;

        tracing::debug!("Ledger transfer {} -> {}: {} sats", from, to, amount.to_sat());
        Ok(())
    }

    async fn balance_of(&self, account: &AccountId) -> Result<Amount> {
        let conn = self.storage.get_connection().await;
        read_balance(&conn, account)
    }
}
