use crate::wager::{WagerKey, WagerState};
use thiserror::Error;
use vrflip_core::{AccountId, CoreError};

pub type Result<T> = std::result::Result<T, WagerError>;

/// Coarse error class, used by callers to decide whether a failure is retryable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    Resource,
    TrustBoundary,
    Timeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum WagerError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Invalid choice {choice}: must be below {max_result}")]
    InvalidChoice { choice: u64, max_result: u64 },

    #[error("Invalid stake: must be greater than zero")]
    InvalidStake,

    #[error("Max result {requested} exceeds maximum {cap}")]
    MaxResultExceedsMaximum { requested: u64, cap: u64 },

    #[error("Counterparty stake {offered} sats does not match wager stake {required} sats")]
    StakeMismatch { offered: u64, required: u64 },

    #[error("Owner cannot join their own wager")]
    SelfJoin,

    #[error("Only the owner may do this on wager {0}")]
    NotOwner(WagerKey),

    #[error("Wager already exists: {0}")]
    WagerExists(WagerKey),

    #[error("Wager not found: {0}")]
    UnknownWager(WagerKey),

    #[error("Invalid wager state: expected {expected}, found {found:?}")]
    InvalidState {
        expected: &'static str,
        found: WagerState,
    },

    #[error("Wager already settled: {0}")]
    AlreadySettled(WagerKey),

    #[error("Randomness request already pending for wager {0}")]
    AlreadyPending(WagerKey),

    #[error("Unknown or consumed binder token")]
    UnknownOrConsumedToken,

    #[error("Binder token does not match the request recorded on wager {0}")]
    BindingMismatch(WagerKey),

    #[error("{claimant} is not the winner of wager {key}")]
    NotWinner { key: WagerKey, claimant: AccountId },

    #[error("Insufficient funds: need {need} sats, have {available} sats")]
    InsufficientFunds { need: u64, available: u64 },

    #[error("Insufficient escrow: need {need} sats, have {available} sats")]
    InsufficientEscrow { need: u64, available: u64 },

    #[error("Deposit already made by {payer} for wager {key}")]
    DuplicateDeposit { key: WagerKey, payer: AccountId },

    #[error("Callback signature not from the trusted oracle")]
    UntrustedOracle,

    #[error("Randomness request for wager {0} has not timed out yet")]
    TimeoutNotReached(WagerKey),
}

impl WagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChoice { .. }
            | Self::InvalidStake
            | Self::MaxResultExceedsMaximum { .. }
            | Self::StakeMismatch { .. }
            | Self::SelfJoin
            | Self::NotOwner(_)
            | Self::NotWinner { .. } => ErrorKind::Validation,

            Self::WagerExists(_)
            | Self::UnknownWager(_)
            | Self::InvalidState { .. }
            | Self::AlreadySettled(_)
            | Self::AlreadyPending(_)
            | Self::UnknownOrConsumedToken
            | Self::BindingMismatch(_)
            | Self::DuplicateDeposit { .. } => ErrorKind::StateConflict,

            Self::InsufficientFunds { .. } | Self::InsufficientEscrow { .. } => {
                ErrorKind::Resource
            }

            Self::UntrustedOracle => ErrorKind::TrustBoundary,
            Self::TimeoutNotReached(_) => ErrorKind::Timeout,

            Self::Core(CoreError::InsufficientFunds { .. }) => ErrorKind::Resource,
            Self::Core(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_state(expected: &'static str, found: WagerState) -> Self {
        Self::InvalidState { expected, found }
    }
}
