//! Wager lifecycle: `Open -> RandomnessRequested -> Resolved -> Settled`,
//! with `Refunding -> Refunded` as the exit for cancelled or timed out
//! wagers.
//!
//! Every wager sits behind its own async mutex which is held for the whole
//! transition, ledger calls included, so no caller ever observes a half
//! applied transition. The wager index itself is only locked briefly.

use crate::binder::{BinderToken, RandomnessRequestBinder};
use crate::escrow::EscrowLedger;
use crate::events::{EventPublisher, WagerEvent, DEFAULT_EVENT_CAPACITY};
use crate::oracle::OracleRequest;
use crate::outcome::{self, RandomValue, Side};
use crate::wager::{Wager, WagerKey, WagerState};
use crate::{Result, WagerError};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use vrflip_core::{
    AccountId, Amount, AssetLedger, CoreError, Storage, WagerConfig, WagerRecord, WagerStore,
};

// `None` marks a slot whose opening deposit failed
type WagerCell = Arc<Mutex<Option<Wager>>>;

/// Result of a successful oracle callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub wager: WagerKey,
    pub result: u64,
    pub side: Side,
    pub winner: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub wager: WagerKey,
    pub winner: AccountId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub wager: WagerKey,
    pub refunds: Vec<(AccountId, Amount)>,
}

pub struct WagerStateMachine {
    config: WagerConfig,
    escrow: EscrowLedger,
    binder: RandomnessRequestBinder,
    wagers: RwLock<HashMap<WagerKey, WagerCell>>,
    archive: Option<Arc<Storage>>,
    events: EventPublisher,
}

impl WagerStateMachine {
    pub fn new(config: WagerConfig, ledger: Arc<dyn AssetLedger>) -> Self {
        Self {
            config,
            escrow: EscrowLedger::new(ledger),
            binder: RandomnessRequestBinder::new(),
            wagers: RwLock::new(HashMap::new()),
            archive: None,
            events: EventPublisher::new(DEFAULT_EVENT_CAPACITY),
        }
    }

    /// Archive wagers to `storage` once they reach a terminal state
    pub fn with_archive(mut self, storage: Arc<Storage>) -> Self {
        self.archive = Some(storage);
        self
    }

    pub fn config(&self) -> &WagerConfig {
        &self.config
    }

    pub fn escrow(&self) -> &EscrowLedger {
        &self.escrow
    }

    /// Receive every lifecycle event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<WagerEvent> {
        self.events.subscribe()
    }

    /// Open a wager and escrow the owner's stake
    pub async fn open(
        &self,
        wager_id: &str,
        owner: &AccountId,
        stake: Amount,
        max_result: u64,
        choice: u64,
    ) -> Result<WagerKey> {
        if stake == Amount::ZERO {
            return Err(WagerError::InvalidStake);
        }

        let max_result = self.effective_max_result(max_result)?;
        if choice >= max_result {
            return Err(WagerError::InvalidChoice { choice, max_result });
        }

        let key = WagerKey::new(owner.clone(), wager_id);

        // Reserve the slot locked so nobody can use it before the deposit lands
        let cell: WagerCell = Arc::new(Mutex::new(None));
        let mut slot = cell.clone().lock_owned().await;
        {
            let mut wagers = self.wagers.write();
            if wagers.contains_key(&key) {
                return Err(WagerError::WagerExists(key));
            }
            wagers.insert(key.clone(), cell);
        }

        // pruned wagers only live on in the archive
        let reserved = match self.is_archived(&key).await {
            Ok(true) => Err(WagerError::WagerExists(key.clone())),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        let opened = match reserved {
            Ok(()) => self.escrow.deposit(&key, owner, stake).await,
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            self.wagers.write().remove(&key);
            tracing::warn!("Opening wager {} failed: {}", key, e);
            return Err(e);
        }

        let wager = Wager::new(key.clone(), stake, max_result, choice);
        self.events.publish(WagerEvent::Opened {
            wager: key.clone(),
            stake,
            max_result,
            timestamp: wager.created_at,
        });
        *slot = Some(wager);

        tracing::info!(
            "Wager {} opened: stake {} sats, choice {} in [0, {})",
            key,
            stake.to_sat(),
            choice,
            max_result
        );
        Ok(key)
    }

    /// Bind the wager to a fresh randomness request.
    ///
    /// With `counterparty_stake` the requester joins as counterparty and
    /// escrows a stake equal to the owner's. Without it only the owner may
    /// request, and the house takes the opposite side.
    pub async fn request_randomness(
        &self,
        key: &WagerKey,
        requester: &AccountId,
        counterparty_stake: Option<Amount>,
    ) -> Result<OracleRequest> {
        let mut guard = self.lock(key).await?;
        let wager = guard
            .as_mut()
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;
        wager.expect_state(WagerState::Open)?;

        match counterparty_stake {
            Some(offered) => {
                if requester == wager.owner() {
                    return Err(WagerError::SelfJoin);
                }
                if offered != wager.stake {
                    return Err(WagerError::StakeMismatch {
                        offered: offered.to_sat(),
                        required: wager.stake.to_sat(),
                    });
                }
            }
            None => {
                if requester != wager.owner() {
                    return Err(WagerError::NotOwner(key.clone()));
                }
            }
        }

        let token = self.binder.issue(key)?;

        if let Some(stake) = counterparty_stake {
            if let Err(e) = self.escrow.deposit(key, requester, stake).await {
                self.binder.revoke(key);
                return Err(e);
            }
            wager.counterparty = Some(requester.clone());
            wager.escrow_balance = wager
                .escrow_balance
                .checked_add(stake)
                .ok_or_else(|| CoreError::internal(format!("Escrow overflow for {}", key)))?;
        }

        let now = Utc::now();
        wager.request_binding = Some(token.clone());
        wager.requested_at = Some(now);
        wager.state = WagerState::RandomnessRequested;

        tracing::info!(
            "Randomness requested for wager {} by {} (escrow {} sats)",
            key,
            requester,
            wager.escrow_balance.to_sat()
        );
        self.events.publish(WagerEvent::RandomnessRequested {
            wager: key.clone(),
            requester: requester.clone(),
            max_result: wager.max_result,
            escrow: wager.escrow_balance,
            timestamp: now,
        });

        Ok(OracleRequest {
            wager: key.clone(),
            token,
            callback_target: self.config.callback_target.clone(),
            max_result: wager.max_result,
        })
    }

    /// Apply an authenticated random value to the wager bound to `token`.
    ///
    /// The token is only consumed once the wager lock is held, and nothing
    /// between the consume and the transition awaits. A callback dropped
    /// while waiting for the lock leaves the token outstanding.
    pub async fn resolve(&self, token: &BinderToken, value: &RandomValue) -> Result<Resolution> {
        let key = self.binder.peek(token)?;

        let cell = self
            .wagers
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| WagerError::BindingMismatch(key.clone()))?;
        let mut guard = cell.lock_owned().await;

        // a concurrent delivery or refund may have taken it while we waited
        self.binder.consume(token)?;

        let wager = guard
            .as_mut()
            .ok_or_else(|| WagerError::BindingMismatch(key.clone()))?;

        if wager.request_binding.as_ref() != Some(token) {
            return Err(WagerError::BindingMismatch(key));
        }
        wager.expect_state(WagerState::RandomnessRequested)?;

        let (result, side) = outcome::evaluate(value, wager.max_result, wager.choice);
        let winner = match side {
            Side::Owner => wager.owner().clone(),
            Side::Opponent => wager
                .counterparty
                .clone()
                .unwrap_or_else(|| self.config.house_account.clone()),
        };

        let now = Utc::now();
        wager.result = Some(result);
        wager.winner = Some(winner.clone());
        wager.resolved_at = Some(now);
        wager.state = WagerState::Resolved;

        tracing::info!(
            "Wager {} resolved: result {} (choice {}), winner {}",
            key,
            result,
            wager.choice,
            winner
        );
        self.events.publish(WagerEvent::Resolved {
            wager: key.clone(),
            max_result: wager.max_result,
            result,
            winner: winner.clone(),
            timestamp: now,
        });

        Ok(Resolution {
            wager: key,
            result,
            side,
            winner,
        })
    }

    /// Pay the whole escrow to the recorded winner. Anyone may trigger a
    /// settlement, but only the winner's claim is honoured.
    pub async fn settle(&self, key: &WagerKey, claimant: &AccountId) -> Result<Settlement> {
        let mut guard = self.lock(key).await?;
        let wager = guard
            .as_mut()
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;

        match wager.state {
            WagerState::Resolved => {}
            WagerState::Settled => return Err(WagerError::AlreadySettled(key.clone())),
            other => return Err(WagerError::invalid_state("Resolved", other)),
        }

        let winner = wager
            .winner
            .clone()
            .ok_or_else(|| CoreError::internal(format!("Resolved wager {} has no winner", key)))?;
        if claimant != &winner {
            return Err(WagerError::NotWinner {
                key: key.clone(),
                claimant: claimant.clone(),
            });
        }

        let amount = wager.escrow_balance;
        self.escrow.payout(key, &winner, amount).await?;

        let now = Utc::now();
        wager.escrow_balance = Amount::ZERO;
        wager.request_binding = None;
        wager.closed_at = Some(now);
        wager.state = WagerState::Settled;

        tracing::info!(
            "Wager {} settled: {} sats paid to {}",
            key,
            amount.to_sat(),
            winner
        );
        self.events.publish(WagerEvent::Settled {
            wager: key.clone(),
            winner: winner.clone(),
            amount,
            timestamp: now,
        });
        self.archive_wager(wager).await;

        Ok(Settlement {
            wager: key.clone(),
            winner,
            amount,
        })
    }

    /// Owner withdraws an `Open` wager nobody has requested randomness for.
    /// If a payout fails the wager stays in `Refunding` and `refund` finishes it.
    pub async fn cancel(&self, key: &WagerKey, caller: &AccountId) -> Result<Refund> {
        let mut guard = self.lock(key).await?;
        let wager = guard
            .as_mut()
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;
        wager.expect_state(WagerState::Open)?;

        if caller != wager.owner() {
            return Err(WagerError::NotOwner(key.clone()));
        }

        wager.state = WagerState::Refunding;
        let refund = self.return_contributions(wager).await?;
        tracing::info!("Wager {} cancelled by owner", key);
        Ok(refund)
    }

    /// Return all stakes of a wager whose oracle never called back within
    /// the configured timeout. Anyone may trigger it.
    ///
    /// The outstanding token is revoked first, so a late callback is
    /// rejected as unknown. A wager left in `Refunding` by a failed payout
    /// resumes with the contributions not yet returned.
    pub async fn refund(&self, key: &WagerKey, caller: &AccountId) -> Result<Refund> {
        let mut guard = self.lock(key).await?;
        let wager = guard
            .as_mut()
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;

        match wager.state {
            WagerState::RandomnessRequested => {
                if !self.is_expired(wager)? {
                    return Err(WagerError::TimeoutNotReached(key.clone()));
                }
                // callbacks consume under this same lock
                if self.binder.revoke(key).is_none() {
                    return Err(CoreError::internal(format!(
                        "Wager {} awaits randomness without a pending token",
                        key
                    ))
                    .into());
                }
                wager.request_binding = None;
                wager.state = WagerState::Refunding;
            }
            WagerState::Refunding => {
                tracing::info!(
                    "Resuming refund of wager {} ({} of {} contributions returned)",
                    key,
                    wager.refunded.len(),
                    self.escrow.contributions(key)?.len()
                );
            }
            other => return Err(WagerError::invalid_state("RandomnessRequested", other)),
        }

        let refund = self.return_contributions(wager).await?;
        tracing::warn!(
            "Wager {} refunded after oracle timeout (triggered by {})",
            key,
            caller
        );
        Ok(refund)
    }

    /// Wagers that have waited for randomness longer than the timeout,
    /// plus refunds that stopped partway. Wagers locked by an in-progress
    /// call are skipped.
    pub fn expired_requests(&self) -> Vec<WagerKey> {
        let cells: Vec<WagerCell> = self.wagers.read().values().cloned().collect();

        cells
            .iter()
            .filter_map(|cell| {
                let guard = cell.try_lock().ok()?;
                let wager = guard.as_ref()?;
                let due = match wager.state {
                    WagerState::RandomnessRequested => self.is_expired(wager).unwrap_or(false),
                    WagerState::Refunding => true,
                    _ => false,
                };
                if due {
                    Some(wager.key.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Snapshot of the wager
    pub async fn get(&self, key: &WagerKey) -> Option<Wager> {
        let cell = self.wagers.read().get(key).cloned()?;
        let guard = cell.lock().await;
        guard.clone()
    }

    pub fn wager_count(&self) -> usize {
        self.wagers.read().len()
    }

    /// Evict settled and refunded wagers and their escrow records from
    /// memory. Returns how many were evicted. With an archive attached the
    /// evicted ids stay taken.
    pub fn prune_terminal(&self) -> usize {
        let mut wagers = self.wagers.write();
        let before = wagers.len();

        wagers.retain(|key, cell| {
            let terminal = cell
                .try_lock()
                .map(|guard| guard.as_ref().is_some_and(|w| w.state.is_terminal()))
                .unwrap_or(false);
            if !terminal {
                return true;
            }
            match self.escrow.release(key) {
                Ok(()) => false,
                Err(e) => {
                    tracing::warn!("Keeping wager {} in memory: {}", key, e);
                    true
                }
            }
        });

        let pruned = before - wagers.len();
        if pruned > 0 {
            tracing::debug!("Pruned {} terminal wagers", pruned);
        }
        pruned
    }

    async fn lock(&self, key: &WagerKey) -> Result<OwnedMutexGuard<Option<Wager>>> {
        let cell = self
            .wagers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| WagerError::UnknownWager(key.clone()))?;
        Ok(cell.lock_owned().await)
    }

    fn effective_max_result(&self, requested: u64) -> Result<u64> {
        if requested == 0 {
            return Ok(self.config.default_max_result);
        }
        if requested > self.config.max_result_cap {
            return Err(WagerError::MaxResultExceedsMaximum {
                requested,
                cap: self.config.max_result_cap,
            });
        }
        Ok(requested)
    }

    fn is_expired(&self, wager: &Wager) -> Result<bool> {
        let timeout = chrono::Duration::from_std(self.config.request_timeout)
            .map_err(|e| CoreError::config(format!("Invalid request timeout: {}", e)))?;

        Ok(wager
            .requested_at
            .is_some_and(|requested_at| Utc::now() >= requested_at + timeout))
    }

    async fn is_archived(&self, key: &WagerKey) -> Result<bool> {
        let Some(storage) = &self.archive else {
            return Ok(false);
        };
        let record = WagerStore::new(storage).load(&key.owner, &key.id).await?;
        Ok(record.is_some())
    }

    // Pays back every contribution not yet in `wager.refunded`, so a failed
    // run can be repeated from `Refunding`
    async fn return_contributions(&self, wager: &mut Wager) -> Result<Refund> {
        let key = wager.key.clone();
        for (payer, amount) in self.escrow.contributions(&key)? {
            if wager.refunded.iter().any(|(paid, _)| paid == &payer) {
                continue;
            }
            self.escrow.payout(&key, &payer, amount).await?;
            wager.escrow_balance = wager
                .escrow_balance
                .checked_sub(amount)
                .ok_or_else(|| CoreError::internal(format!("Escrow underflow for {}", key)))?;
            wager.refunded.push((payer, amount));
        }

        let now = Utc::now();
        wager.closed_at = Some(now);
        wager.state = WagerState::Refunded;

        let refund = Refund {
            wager: key.clone(),
            refunds: wager.refunded.clone(),
        };
        self.events.publish(WagerEvent::Refunded {
            wager: key,
            refunds: refund.refunds.clone(),
            timestamp: now,
        });
        self.archive_wager(wager).await;

        Ok(refund)
    }

    // Archive failures are logged, never allowed to undo a completed payout
    async fn archive_wager(&self, wager: &Wager) {
        let Some(storage) = &self.archive else {
            return;
        };

        let snapshot = match serde_json::to_string(&wager.info()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Failed to serialize wager {}: {}", wager.key, e);
                return;
            }
        };

        let record = WagerRecord {
            owner: wager.owner().clone(),
            wager_id: wager.key.id.clone(),
            state: wager.state.as_str().to_string(),
            snapshot,
            archived_at: Utc::now(),
        };

        if let Err(e) = WagerStore::new(storage).archive(&record).await {
            tracing::warn!("Failed to archive wager {}: {}", wager.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vrflip_core::MemoryLedger;

    const STAKE: u64 = 100;

    fn p1() -> AccountId {
        AccountId::new("p1")
    }

    fn p2() -> AccountId {
        AccountId::new("p2")
    }

    async fn machine_with(config: WagerConfig) -> Arc<WagerStateMachine> {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit(&p1(), Amount::from_sat(1_000)).await.unwrap();
        ledger.deposit(&p2(), Amount::from_sat(1_000)).await.unwrap();
        Arc::new(WagerStateMachine::new(config, ledger))
    }

    async fn machine() -> Arc<WagerStateMachine> {
        machine_with(WagerConfig::default()).await
    }

    async fn balance(machine: &WagerStateMachine, account: &AccountId) -> u64 {
        machine
            .escrow()
            .asset_ledger()
            .balance_of(account)
            .await
            .unwrap()
            .to_sat()
    }

    #[tokio::test]
    async fn test_open_escrows_stake() {
        let machine = machine().await;
        for (id, max_result, choice) in [("a", 2, 0), ("b", 2, 1), ("c", 1337, 1336), ("d", 1, 0)] {
            let key = machine
                .open(id, &p1(), Amount::from_sat(STAKE), max_result, choice)
                .await
                .unwrap();
            assert_eq!(machine.escrow().balance(&key).unwrap().to_sat(), STAKE);

            let wager = machine.get(&key).await.unwrap();
            assert_eq!(wager.state(), WagerState::Open);
            assert_eq!(wager.escrow_balance().to_sat(), STAKE);
        }
        assert_eq!(balance(&machine, &p1()).await, 1_000 - 4 * STAKE);
    }

    #[tokio::test]
    async fn test_open_validation() {
        let machine = machine().await;

        assert!(matches!(
            machine.open("10", &p1(), Amount::ZERO, 10, 0).await,
            Err(WagerError::InvalidStake)
        ));
        assert!(matches!(
            machine.open("10", &p1(), Amount::from_sat(STAKE), 10, 10).await,
            Err(WagerError::InvalidChoice {
                choice: 10,
                max_result: 10
            })
        ));
        assert!(matches!(
            machine.open("10", &p1(), Amount::from_sat(STAKE), 1338, 0).await,
            Err(WagerError::MaxResultExceedsMaximum { .. })
        ));
        assert!(matches!(
            machine.open("10", &p1(), Amount::from_sat(5_000), 10, 0).await,
            Err(WagerError::InsufficientFunds { .. })
        ));

        // failed opens leave nothing behind
        assert_eq!(machine.wager_count(), 0);
        assert_eq!(balance(&machine, &p1()).await, 1_000);
    }

    #[tokio::test]
    async fn test_zero_max_result_uses_default() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 0, 1336)
            .await
            .unwrap();
        assert_eq!(machine.get(&key).await.unwrap().max_result(), 1337);
    }

    #[tokio::test]
    async fn test_wager_ids_are_unique_per_owner() {
        let machine = machine().await;
        machine
            .open("10", &p1(), Amount::from_sat(STAKE), 2, 0)
            .await
            .unwrap();

        assert!(matches!(
            machine.open("10", &p1(), Amount::from_sat(STAKE), 2, 0).await,
            Err(WagerError::WagerExists(_))
        ));
        // same id, different owner
        machine
            .open("10", &p2(), Amount::from_sat(STAKE), 2, 0)
            .await
            .unwrap();
        assert_eq!(balance(&machine, &p1()).await, 1_000 - STAKE);
    }

    #[tokio::test]
    async fn test_request_randomness_emits_oracle_request() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        let request = machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();
        assert_eq!(request.wager, key);
        assert_eq!(request.max_result, 1337);
        assert_eq!(request.callback_target, machine.config().callback_target);

        let wager = machine.get(&key).await.unwrap();
        assert_eq!(wager.state(), WagerState::RandomnessRequested);
        assert_eq!(wager.counterparty(), Some(&p2()));
        assert_eq!(wager.request_binding(), Some(&request.token));
        assert_eq!(wager.escrow_balance().to_sat(), 2 * STAKE);
        assert_eq!(machine.escrow().balance(&key).unwrap().to_sat(), 2 * STAKE);
    }

    #[tokio::test]
    async fn test_request_randomness_validation() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        assert!(matches!(
            machine
                .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE - 1)))
                .await,
            Err(WagerError::StakeMismatch { .. })
        ));
        assert!(matches!(
            machine
                .request_randomness(&key, &p1(), Some(Amount::from_sat(STAKE)))
                .await,
            Err(WagerError::SelfJoin)
        ));
        assert!(matches!(
            machine.request_randomness(&key, &p2(), None).await,
            Err(WagerError::NotOwner(_))
        ));
        assert!(matches!(
            machine
                .request_randomness(&WagerKey::new("p1", "nope"), &p1(), None)
                .await,
            Err(WagerError::UnknownWager(_))
        ));

        assert_eq!(
            machine.get(&key).await.unwrap().state(),
            WagerState::Open
        );
        assert_eq!(machine.binder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_join_deposit_releases_token() {
        let machine = machine().await;
        let poor = AccountId::new("p3");
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        assert!(matches!(
            machine
                .request_randomness(&key, &poor, Some(Amount::from_sat(STAKE)))
                .await,
            Err(WagerError::InsufficientFunds { .. })
        ));
        assert!(machine.binder.pending_for(&key).is_none());

        // the wager is still joinable
        machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_randomness_requires_open_state() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        // RandomnessRequested
        let request = machine.request_randomness(&key, &p1(), None).await.unwrap();
        let err = machine.request_randomness(&key, &p1(), None).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::InvalidState {
                found: WagerState::RandomnessRequested,
                ..
            }
        ));

        // Resolved
        machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();
        let err = machine.request_randomness(&key, &p1(), None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StateConflict);

        // Settled
        machine.settle(&key, &p1()).await.unwrap();
        let err = machine.request_randomness(&key, &p1(), None).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::InvalidState {
                found: WagerState::Settled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_single_party_loss_goes_to_house() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine.request_randomness(&key, &p1(), None).await.unwrap();

        let resolution = machine
            .resolve(&request.token, &RandomValue::from(1))
            .await
            .unwrap();
        assert_eq!(resolution.side, Side::Opponent);
        assert_eq!(resolution.winner, machine.config().house_account);

        assert!(matches!(
            machine.settle(&key, &p1()).await,
            Err(WagerError::NotWinner { .. })
        ));
        let house = machine.config().house_account.clone();
        machine.settle(&key, &house).await.unwrap();
        assert_eq!(balance(&machine, &house).await, STAKE);
    }

    #[tokio::test]
    async fn test_resolve_rejects_stale_binding() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        machine.request_randomness(&key, &p1(), None).await.unwrap();

        // a token issued outside the machine's request flow
        let binder_token = {
            machine.binder.revoke(&key);
            machine.binder.issue(&key).unwrap()
        };
        assert!(matches!(
            machine.resolve(&binder_token, &RandomValue::from(0)).await,
            Err(WagerError::BindingMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_requires_resolved() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        assert!(matches!(
            machine.settle(&key, &p1()).await,
            Err(WagerError::InvalidState {
                found: WagerState::Open,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_one_wins() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let machine = machine.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    machine
                        .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e.kind(), crate::ErrorKind::StateConflict),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(machine.escrow().balance(&key).unwrap().to_sat(), 2 * STAKE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settle_pays_once() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();
        machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let machine = machine.clone();
                let key = key.clone();
                tokio::spawn(async move { machine.settle(&key, &p1()).await })
            })
            .collect();

        let mut settled = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(settlement) => {
                    settled += 1;
                    assert_eq!(settlement.amount.to_sat(), 2 * STAKE);
                }
                Err(e) => assert!(matches!(e, WagerError::AlreadySettled(_))),
            }
        }
        assert_eq!(settled, 1);
        assert_eq!(balance(&machine, &p1()).await, 1_000 + STAKE);
    }

    #[tokio::test]
    async fn test_cancel_open_wager() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        assert!(matches!(
            machine.cancel(&key, &p2()).await,
            Err(WagerError::NotOwner(_))
        ));

        let refund = machine.cancel(&key, &p1()).await.unwrap();
        assert_eq!(refund.refunds, vec![(p1(), Amount::from_sat(STAKE))]);
        assert_eq!(balance(&machine, &p1()).await, 1_000);
        assert_eq!(
            machine.get(&key).await.unwrap().state(),
            WagerState::Refunded
        );
        assert!(machine.request_randomness(&key, &p1(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_refund_waits_for_timeout() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        machine.request_randomness(&key, &p1(), None).await.unwrap();

        assert!(matches!(
            machine.refund(&key, &p2()).await,
            Err(WagerError::TimeoutNotReached(_))
        ));
        assert!(machine.expired_requests().is_empty());
    }

    #[tokio::test]
    async fn test_refund_after_timeout_blocks_late_callback() {
        let config = WagerConfig::default().with_request_timeout(Duration::ZERO);
        let machine = machine_with(config).await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();

        assert_eq!(machine.expired_requests(), vec![key.clone()]);

        // anyone may trigger the refund
        let refund = machine
            .refund(&key, &AccountId::new("keeper"))
            .await
            .unwrap();
        assert_eq!(refund.refunds.len(), 2);
        assert_eq!(balance(&machine, &p1()).await, 1_000);
        assert_eq!(balance(&machine, &p2()).await, 1_000);
        assert_eq!(machine.escrow().balance(&key).unwrap(), Amount::ZERO);

        assert!(matches!(
            machine.resolve(&request.token, &RandomValue::from(0)).await,
            Err(WagerError::UnknownOrConsumedToken)
        ));
        assert!(machine.expired_requests().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_callback_keeps_token() {
        let machine = machine().await;
        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine.request_randomness(&key, &p1(), None).await.unwrap();

        // the transport gives up while another call holds the wager
        let held = machine.lock(&key).await.unwrap();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            machine.resolve(&request.token, &RandomValue::from(0)),
        )
        .await;
        assert!(timed_out.is_err());
        drop(held);

        assert_eq!(machine.binder.pending_for(&key), Some(request.token.clone()));
        let resolution = machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();
        assert_eq!(resolution.winner, p1());
        machine.settle(&key, &p1()).await.unwrap();
        assert_eq!(balance(&machine, &p1()).await, 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_callback_and_refund_apply_in_order() {
        let config = WagerConfig::default().with_request_timeout(Duration::ZERO);
        let machine = machine_with(config).await;

        for (id, callback_first) in [("10", true), ("11", false)] {
            let key = machine
                .open(id, &p1(), Amount::from_sat(STAKE), 1337, 0)
                .await
                .unwrap();
            let request = machine.request_randomness(&key, &p1(), None).await.unwrap();

            let held = machine.lock(&key).await.unwrap();
            let spawn_callback = || {
                let machine = machine.clone();
                let token = request.token.clone();
                tokio::spawn(async move { machine.resolve(&token, &RandomValue::from(0)).await })
            };
            let spawn_refund = || {
                let machine = machine.clone();
                let key = key.clone();
                tokio::spawn(async move { machine.refund(&key, &p2()).await })
            };

            // the wager lock hands out turns in arrival order
            let (callback, refund) = if callback_first {
                let callback = spawn_callback();
                tokio::time::sleep(Duration::from_millis(20)).await;
                (callback, spawn_refund())
            } else {
                let refund = spawn_refund();
                tokio::time::sleep(Duration::from_millis(20)).await;
                (spawn_callback(), refund)
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);

            let callback = callback.await.unwrap();
            let refund = refund.await.unwrap();
            if callback_first {
                assert!(callback.is_ok());
                assert!(matches!(
                    refund,
                    Err(WagerError::InvalidState {
                        found: WagerState::Resolved,
                        ..
                    })
                ));
            } else {
                assert!(refund.is_ok());
                assert!(matches!(callback, Err(WagerError::UnknownOrConsumedToken)));
                assert_eq!(
                    machine.get(&key).await.unwrap().state(),
                    WagerState::Refunded
                );
            }
            assert_eq!(machine.binder.pending_count(), 0);
        }
    }

    /// Fails every transfer into `broken` while armed
    struct FlakyLedger {
        inner: MemoryLedger,
        broken: parking_lot::Mutex<Option<AccountId>>,
    }

    #[async_trait::async_trait]
    impl AssetLedger for FlakyLedger {
        async fn deposit(&self, account: &AccountId, amount: Amount) -> vrflip_core::Result<()> {
            self.inner.deposit(account, amount).await
        }

        async fn transfer(
            &self,
            from: &AccountId,
            to: &AccountId,
            amount: Amount,
        ) -> vrflip_core::Result<()> {
            if self.broken.lock().as_ref() == Some(to) {
                return Err(CoreError::internal("ledger unavailable"));
            }
            self.inner.transfer(from, to, amount).await
        }

        async fn balance_of(&self, account: &AccountId) -> vrflip_core::Result<Amount> {
            self.inner.balance_of(account).await
        }
    }

    #[tokio::test]
    async fn test_failed_refund_resumes() {
        let ledger = Arc::new(FlakyLedger {
            inner: MemoryLedger::new(),
            broken: parking_lot::Mutex::new(None),
        });
        ledger.deposit(&p1(), Amount::from_sat(1_000)).await.unwrap();
        ledger.deposit(&p2(), Amount::from_sat(1_000)).await.unwrap();
        let config = WagerConfig::default().with_request_timeout(Duration::ZERO);
        let machine = WagerStateMachine::new(config, ledger.clone());

        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();

        *ledger.broken.lock() = Some(p2());
        let err = machine.refund(&key, &p1()).await.unwrap_err();
        assert!(matches!(err, WagerError::Core(CoreError::Internal(_))));

        // p1 is repaid, p2's stake is still escrowed and accounted for
        let wager = machine.get(&key).await.unwrap();
        assert_eq!(wager.state(), WagerState::Refunding);
        assert_eq!(wager.refunded(), &[(p1(), Amount::from_sat(STAKE))]);
        assert_eq!(wager.escrow_balance(), machine.escrow().balance(&key).unwrap());
        assert_eq!(wager.escrow_balance().to_sat(), STAKE);
        assert_eq!(machine.expired_requests(), vec![key.clone()]);

        *ledger.broken.lock() = None;
        let refund = machine.refund(&key, &p2()).await.unwrap();
        assert_eq!(
            refund.refunds,
            vec![
                (p1(), Amount::from_sat(STAKE)),
                (p2(), Amount::from_sat(STAKE))
            ]
        );
        assert_eq!(balance(&machine, &p1()).await, 1_000);
        assert_eq!(balance(&machine, &p2()).await, 1_000);
        assert_eq!(
            machine.get(&key).await.unwrap().state(),
            WagerState::Refunded
        );
        assert!(machine.refund(&key, &p2()).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_lifecycle_events() {
        let machine = machine().await;
        let mut events = machine.subscribe();

        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine
            .request_randomness(&key, &p2(), Some(Amount::from_sat(STAKE)))
            .await
            .unwrap();
        machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();
        machine.settle(&key, &p1()).await.unwrap();

        let other = machine
            .open("11", &p1(), Amount::from_sat(STAKE), 2, 0)
            .await
            .unwrap();
        machine.cancel(&other, &p1()).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 6);
        assert!(matches!(
            &received[0],
            WagerEvent::Opened { max_result: 1337, .. }
        ));
        assert!(matches!(
            &received[1],
            WagerEvent::RandomnessRequested { requester, escrow, .. }
                if requester == &p2() && escrow.to_sat() == 2 * STAKE
        ));
        assert!(matches!(
            &received[2],
            WagerEvent::Resolved { result: 0, winner, .. } if winner == &p1()
        ));
        assert!(matches!(
            &received[3],
            WagerEvent::Settled { amount, .. } if amount.to_sat() == 2 * STAKE
        ));
        assert!(matches!(&received[4], WagerEvent::Opened { .. }));
        assert!(matches!(
            &received[5],
            WagerEvent::Refunded { refunds, .. } if refunds.len() == 1
        ));
        assert!(received[..4].iter().all(|e| e.wager() == &key));
    }

    #[tokio::test]
    async fn test_prune_terminal_evicts_closed_wagers() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit(&p1(), Amount::from_sat(1_000)).await.unwrap();
        let machine =
            WagerStateMachine::new(WagerConfig::default(), ledger).with_archive(storage.clone());

        let settled = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine
            .request_randomness(&settled, &p1(), None)
            .await
            .unwrap();
        machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();
        machine.settle(&settled, &p1()).await.unwrap();

        let cancelled = machine
            .open("11", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        machine.cancel(&cancelled, &p1()).await.unwrap();

        let open = machine
            .open("12", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();

        assert_eq!(machine.prune_terminal(), 2);
        assert_eq!(machine.wager_count(), 1);
        assert_eq!(machine.escrow().tracked_count(), 1);
        assert!(machine.get(&settled).await.is_none());
        assert!(machine.get(&open).await.is_some());
        assert_eq!(machine.prune_terminal(), 0);

        // archived ids cannot be reopened
        assert!(matches!(
            machine.open("10", &p1(), Amount::from_sat(STAKE), 1337, 0).await,
            Err(WagerError::WagerExists(_))
        ));
        assert_eq!(machine.wager_count(), 1);
        assert_eq!(balance(&machine, &p1()).await, 1_000 - STAKE);
    }

    #[tokio::test]
    async fn test_terminal_wagers_are_archived() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit(&p1(), Amount::from_sat(1_000)).await.unwrap();
        let machine =
            WagerStateMachine::new(WagerConfig::default(), ledger).with_archive(storage.clone());

        let key = machine
            .open("10", &p1(), Amount::from_sat(STAKE), 1337, 0)
            .await
            .unwrap();
        let request = machine.request_randomness(&key, &p1(), None).await.unwrap();
        machine
            .resolve(&request.token, &RandomValue::from(0))
            .await
            .unwrap();
        machine.settle(&key, &p1()).await.unwrap();

        let record = WagerStore::new(&storage)
            .load(&p1(), "10")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, "Settled");

        let info: crate::wager::WagerInfo = serde_json::from_str(&record.snapshot).unwrap();
        assert_eq!(info.winner, Some(p1()));
        assert_eq!(info.escrow_balance, Amount::ZERO);
    }
}
