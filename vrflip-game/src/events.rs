//! Lifecycle events published by the state machine.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Publishing
//! never blocks a transition; a subscriber that falls behind sees
//! `RecvError::Lagged` and skips ahead.

use crate::wager::WagerKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use vrflip_core::{AccountId, Amount};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WagerEvent {
    Opened {
        wager: WagerKey,
        stake: Amount,
        max_result: u64,
        timestamp: DateTime<Utc>,
    },
    RandomnessRequested {
        wager: WagerKey,
        requester: AccountId,
        max_result: u64,
        escrow: Amount,
        timestamp: DateTime<Utc>,
    },
    Resolved {
        wager: WagerKey,
        max_result: u64,
        result: u64,
        winner: AccountId,
        timestamp: DateTime<Utc>,
    },
    Settled {
        wager: WagerKey,
        winner: AccountId,
        amount: Amount,
        timestamp: DateTime<Utc>,
    },
    Refunded {
        wager: WagerKey,
        refunds: Vec<(AccountId, Amount)>,
        timestamp: DateTime<Utc>,
    },
}

impl WagerEvent {
    pub fn wager(&self) -> &WagerKey {
        match self {
            WagerEvent::Opened { wager, .. }
            | WagerEvent::RandomnessRequested { wager, .. }
            | WagerEvent::Resolved { wager, .. }
            | WagerEvent::Settled { wager, .. }
            | WagerEvent::Refunded { wager, .. } => wager,
        }
    }
}

pub(crate) struct EventPublisher {
    sender: broadcast::Sender<WagerEvent>,
}

impl EventPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WagerEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: WagerEvent) {
        // no subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!("Wager event dropped: no subscribers");
        }
    }
}
