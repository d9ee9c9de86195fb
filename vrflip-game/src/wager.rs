use crate::binder::BinderToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vrflip_core::{AccountId, Amount};

/// Wager ids are chosen by the opener and unique per owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WagerKey {
    pub owner: AccountId,
    pub id: String,
}

impl WagerKey {
    pub fn new(owner: impl Into<AccountId>, id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for WagerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.id)
    }
}

/// Lifecycle of a wager. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WagerState {
    Open,
    RandomnessRequested,
    Resolved,
    Settled,
    /// Stakes are being returned; a failed refund resumes from here
    Refunding,
    Refunded,
}

impl WagerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WagerState::Settled | WagerState::Refunded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WagerState::Open => "Open",
            WagerState::RandomnessRequested => "RandomnessRequested",
            WagerState::Resolved => "Resolved",
            WagerState::Settled => "Settled",
            WagerState::Refunding => "Refunding",
            WagerState::Refunded => "Refunded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub(crate) key: WagerKey,
    pub(crate) counterparty: Option<AccountId>,
    pub(crate) stake: Amount,
    pub(crate) max_result: u64,
    pub(crate) choice: u64,
    pub(crate) state: WagerState,
    pub(crate) request_binding: Option<BinderToken>,
    pub(crate) result: Option<u64>,
    pub(crate) winner: Option<AccountId>,
    pub(crate) escrow_balance: Amount,
    // contributions already paid back by a cancel or refund
    pub(crate) refunded: Vec<(AccountId, Amount)>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) requested_at: Option<DateTime<Utc>>,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) closed_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub(crate) fn new(key: WagerKey, stake: Amount, max_result: u64, choice: u64) -> Self {
        Self {
            key,
            counterparty: None,
            stake,
            max_result,
            choice,
            state: WagerState::Open,
            request_binding: None,
            result: None,
            winner: None,
            escrow_balance: stake,
            refunded: Vec::new(),
            created_at: Utc::now(),
            requested_at: None,
            resolved_at: None,
            closed_at: None,
        }
    }

    pub fn key(&self) -> &WagerKey {
        &self.key
    }

    pub fn owner(&self) -> &AccountId {
        &self.key.owner
    }

    pub fn counterparty(&self) -> Option<&AccountId> {
        self.counterparty.as_ref()
    }

    pub fn stake(&self) -> Amount {
        self.stake
    }

    pub fn max_result(&self) -> u64 {
        self.max_result
    }

    pub fn choice(&self) -> u64 {
        self.choice
    }

    pub fn state(&self) -> WagerState {
        self.state
    }

    pub fn request_binding(&self) -> Option<&BinderToken> {
        self.request_binding.as_ref()
    }

    pub fn result(&self) -> Option<u64> {
        self.result
    }

    pub fn winner(&self) -> Option<&AccountId> {
        self.winner.as_ref()
    }

    pub fn escrow_balance(&self) -> Amount {
        self.escrow_balance
    }

    pub fn refunded(&self) -> &[(AccountId, Amount)] {
        &self.refunded
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }

    pub fn is_two_party(&self) -> bool {
        self.counterparty.is_some()
    }

    pub(crate) fn expect_state(&self, expected: WagerState) -> crate::Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(crate::WagerError::invalid_state(expected.as_str(), self.state))
        }
    }

    pub fn info(&self) -> WagerInfo {
        WagerInfo {
            key: self.key.clone(),
            counterparty: self.counterparty.clone(),
            stake: self.stake,
            max_result: self.max_result,
            choice: self.choice,
            state: self.state,
            result: self.result,
            winner: self.winner.clone(),
            escrow_balance: self.escrow_balance,
            refunded: self.refunded.clone(),
            created_at: self.created_at,
            requested_at: self.requested_at,
            resolved_at: self.resolved_at,
            closed_at: self.closed_at,
        }
    }
}

/// Wager summary for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerInfo {
    pub key: WagerKey,
    pub counterparty: Option<AccountId>,
    pub stake: Amount,
    pub max_result: u64,
    pub choice: u64,
    pub state: WagerState,
    pub result: Option<u64>,
    pub winner: Option<AccountId>,
    pub escrow_balance: Amount,
    #[serde(default)]
    pub refunded: Vec<(AccountId, Amount)>,
    pub created_at: DateTime<Utc>,
    pub requested_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}
