//! Escrow vaults keyed by wager.
//!
//! Each wager gets a vault account on the external asset ledger. The escrow
//! ledger records who paid in and how much is still held, but never looks at
//! wager state: callers serialize access per wager and decide when value may
//! move.

use crate::wager::WagerKey;
use crate::{Result, WagerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use vrflip_core::{AccountId, Amount, AssetLedger, CoreError};

#[derive(Debug, Clone, Default)]
struct EscrowRecord {
    contributions: Vec<(AccountId, Amount)>,
    balance: Amount,
}

pub struct EscrowLedger {
    ledger: Arc<dyn AssetLedger>,
    records: Mutex<HashMap<WagerKey, EscrowRecord>>,
}

fn from_ledger(err: CoreError) -> WagerError {
    match err {
        CoreError::InsufficientFunds { need, available } => {
            WagerError::InsufficientFunds { need, available }
        }
        other => other.into(),
    }
}

impl EscrowLedger {
    pub fn new(ledger: Arc<dyn AssetLedger>) -> Self {
        Self {
            ledger,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger account holding the funds of `key`
    pub fn vault_account(key: &WagerKey) -> AccountId {
        AccountId::new(format!("escrow:{}:{}", key.owner, key.id))
    }

    pub fn asset_ledger(&self) -> &Arc<dyn AssetLedger> {
        &self.ledger
    }

    /// Move `amount` from `payer` into the vault of `key`.
    ///
    /// The duplicate check and the recorded contribution are separated by
    /// ledger awaits, so two deposits by the same payer for the same wager
    /// must not run concurrently. `WagerStateMachine` holds the wager lock
    /// around every call.
    pub async fn deposit(&self, key: &WagerKey, payer: &AccountId, amount: Amount) -> Result<()> {
        {
            let records = self.records.lock();
            let duplicate = records
                .get(key)
                .is_some_and(|r| r.contributions.iter().any(|(p, _)| p == payer));
            if duplicate {
                return Err(WagerError::DuplicateDeposit {
                    key: key.clone(),
                    payer: payer.clone(),
                });
            }
        }

        let available = self.ledger.balance_of(payer).await?;
        if available < amount {
            return Err(WagerError::InsufficientFunds {
                need: amount.to_sat(),
                available: available.to_sat(),
            });
        }

        self.ledger
            .transfer(payer, &Self::vault_account(key), amount)
            .await
            .map_err(from_ledger)?;

        {
            let mut records = self.records.lock();
            let record = records.entry(key.clone()).or_default();
            record.contributions.push((payer.clone(), amount));
            record.balance = record
                .balance
                .checked_add(amount)
                .ok_or_else(|| CoreError::internal(format!("Escrow overflow for {}", key)))?;
        }

        tracing::info!(
            "Escrowed {} sats from {} for wager {}",
            amount.to_sat(),
            payer,
            key
        );
        Ok(())
    }

    pub async fn payout(&self, key: &WagerKey, recipient: &AccountId, amount: Amount) -> Result<()> {
        {
            let records = self.records.lock();
            let record = records
                .get(key)
                .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;
            if amount > record.balance {
                return Err(WagerError::InsufficientEscrow {
                    need: amount.to_sat(),
                    available: record.balance.to_sat(),
                });
            }
        }

        self.ledger
            .transfer(&Self::vault_account(key), recipient, amount)
            .await
            .map_err(from_ledger)?;

        {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(key) {
                record.balance = record.balance.checked_sub(amount).ok_or_else(|| {
                    CoreError::internal(format!("Escrow underflow for {}", key))
                })?;
            }
        }

        tracing::info!(
            "Paid {} sats from wager {} escrow to {}",
            amount.to_sat(),
            key,
            recipient
        );
        Ok(())
    }

    pub fn balance(&self, key: &WagerKey) -> Result<Amount> {
        self.records
            .lock()
            .get(key)
            .map(|r| r.balance)
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))
    }

    /// Forget the record of an emptied vault. Fails while value is still held.
    pub fn release(&self, key: &WagerKey) -> Result<()> {
        let mut records = self.records.lock();
        match records.get(key) {
            Some(record) if record.balance > Amount::ZERO => Err(CoreError::internal(format!(
                "Escrow for {} still holds {} sats",
                key,
                record.balance.to_sat()
            ))
            .into()),
            _ => {
                records.remove(key);
                Ok(())
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Deposits recorded for `key`, in payment order
    pub fn contributions(&self, key: &WagerKey) -> Result<Vec<(AccountId, Amount)>> {
        self.records
            .lock()
            .get(key)
            .map(|r| r.contributions.clone())
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))
    }
}
