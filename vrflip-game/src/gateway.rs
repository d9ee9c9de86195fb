use crate::binder::BinderToken;
use crate::machine::{Resolution, WagerStateMachine};
use crate::oracle::{callback_message, OracleCallback};
use crate::outcome::RandomValue;
use crate::{Result, WagerError};
use bitcoin::secp256k1::{schnorr::Signature, Secp256k1, VerifyOnly, XOnlyPublicKey};
use std::sync::Arc;

/// Entry point for the oracle network. Nothing reaches the state machine
/// without a valid signature from the trusted oracle key.
pub struct OracleCallbackGateway {
    machine: Arc<WagerStateMachine>,
    secp: Secp256k1<VerifyOnly>,
    trusted_key: XOnlyPublicKey,
}

impl OracleCallbackGateway {
    pub fn new(machine: Arc<WagerStateMachine>, trusted_key: XOnlyPublicKey) -> Self {
        Self {
            machine,
            secp: Secp256k1::verification_only(),
            trusted_key,
        }
    }

    /// Trust the oracle key from the machine's config
    pub fn from_config(machine: Arc<WagerStateMachine>) -> Result<Self> {
        let trusted_key = machine.config().trusted_oracle_key()?;
        Ok(Self::new(machine, trusted_key))
    }

    pub fn trusted_key(&self) -> XOnlyPublicKey {
        self.trusted_key
    }

    pub async fn on_callback(
        &self,
        token: &BinderToken,
        value: &RandomValue,
        signature: &Signature,
    ) -> Result<Resolution> {
        let message = callback_message(token, value);
        if self
            .secp
            .verify_schnorr(signature, &message, &self.trusted_key)
            .is_err()
        {
            tracing::warn!("Rejected callback for token {}: untrusted signature", token);
            return Err(WagerError::UntrustedOracle);
        }

        self.machine.resolve(token, value).await.map_err(|e| {
            tracing::warn!("Callback for token {} not applied: {}", token, e);
            e
        })
    }

    pub async fn deliver(&self, callback: &OracleCallback) -> Result<Resolution> {
        self.on_callback(&callback.token, &callback.value, &callback.signature)
            .await
    }
}
