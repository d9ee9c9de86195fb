use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw 32-byte value delivered by the oracle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomValue([u8; 32]);

impl RandomValue {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 bytes read as a little-endian integer
    pub fn as_u128(&self) -> u128 {
        let mut low = [0u8; 16];
        low.copy_from_slice(&self.0[..16]);
        u128::from_le_bytes(low)
    }
}

impl From<u128> for RandomValue {
    fn from(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(&value.to_le_bytes());
        Self(bytes)
    }
}

impl fmt::Debug for RandomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RandomValue({})", hex::encode(self.0))
    }
}

/// Which side of the wager a result favours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Owner,
    /// The counterparty, or the house when nobody joined
    Opponent,
}

/// Reduce a raw value into `[0, max_result)`
pub fn normalize(value: &RandomValue, max_result: u64) -> u64 {
    debug_assert!(max_result > 0);
    (value.as_u128() % u128::from(max_result)) as u64
}

pub fn decide(result: u64, choice: u64) -> Side {
    if result == choice {
        Side::Owner
    } else {
        Side::Opponent
    }
}

/// Normalized result and the side it favours
pub fn evaluate(value: &RandomValue, max_result: u64, choice: u64) -> (u64, Side) {
    let result = normalize(value, max_result);
    (result, decide(result, choice))
}
