//! vrflip core - asset ledger, storage and configuration
//!
//! Provides the pieces a VRF-settled wager builds on: identities, the
//! external fungible-asset ledger boundary, SQLite persistence and the
//! wager configuration.

pub mod config;
pub mod error;
pub mod ledger;
pub mod storage;
pub mod types;

pub use config::{WagerConfig, MAX_RESULT_CAP};
pub use error::{CoreError, Result};
pub use ledger::{AssetLedger, MemoryLedger};
pub use storage::{BalanceStore, Storage, WagerRecord, WagerStore};
pub use types::AccountId;

pub use ::bitcoin::Amount;
