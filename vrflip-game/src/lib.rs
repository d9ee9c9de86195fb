//! Two-party wager settled by an oracle-delivered random value
//!
//! The owner opens a wager and escrows a stake. A counterparty may join with
//! an equal stake when randomness is requested; otherwise the house takes
//! the other side. The oracle answers through [`OracleCallbackGateway`] with
//! a signed random value bound to a single-use token, and the winner claims
//! the escrow exactly once.

pub mod binder;
pub mod error;
pub mod escrow;
pub mod events;
pub mod gateway;
pub mod machine;
pub mod oracle;
pub mod outcome;
pub mod wager;

pub use binder::{BinderToken, RandomnessRequestBinder};
pub use error::{ErrorKind, Result, WagerError};
pub use escrow::EscrowLedger;
pub use events::WagerEvent;
pub use gateway::OracleCallbackGateway;
pub use machine::{Refund, Resolution, Settlement, WagerStateMachine};
pub use oracle::{OracleCallback, OracleKeypair, OracleRequest};
pub use outcome::{RandomValue, Side};
pub use wager::{Wager, WagerInfo, WagerKey, WagerState};

use std::sync::Arc;
use vrflip_core::{AssetLedger, WagerConfig};

/// Build a state machine and the gateway trusting the configured oracle key
pub fn create_engine(
    config: WagerConfig,
    ledger: Arc<dyn AssetLedger>,
) -> Result<(Arc<WagerStateMachine>, OracleCallbackGateway)> {
    config.validate()?;
    let machine = Arc::new(WagerStateMachine::new(config, ledger));
    let gateway = OracleCallbackGateway::from_config(machine.clone())?;
    Ok((machine, gateway))
}
