use crate::binder::BinderToken;
use crate::outcome::RandomValue;
use crate::wager::WagerKey;
use crate::Result;
use bitcoin::secp256k1::{
    schnorr::Signature, All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vrflip_core::CoreError;

const CALLBACK_TAG: &[u8] = b"vrflip/callback";

/// Outbound request handed to whatever submits randomness requests to the
/// oracle network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub wager: WagerKey,
    pub token: BinderToken,
    pub callback_target: String,
    pub max_result: u64,
}

/// Inbound callback as delivered by the oracle transport
#[derive(Debug, Clone)]
pub struct OracleCallback {
    pub token: BinderToken,
    pub value: RandomValue,
    pub signature: Signature,
}

/// Message the oracle signs for a callback
pub fn callback_message(token: &BinderToken, value: &RandomValue) -> Message {
    let mut hasher = Sha256::new();
    hasher.update(CALLBACK_TAG);
    hasher.update(token.as_str().as_bytes());
    hasher.update(value.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Message::from_digest(digest)
}

/// Signing side of the oracle, used by simulators and tests
pub struct OracleKeypair {
    secp: Secp256k1<All>,
    keypair: Keypair,
}

impl OracleKeypair {
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(secret)
            .map_err(|e| CoreError::invalid_key(format!("Invalid oracle secret: {}", e)))?;
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        Ok(Self { secp, keypair })
    }

    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut secret = [0u8; 32];
        loop {
            rand::thread_rng().fill_bytes(&mut secret);
            // out-of-range scalars are astronomically rare, just draw again
            if let Ok(secret_key) = SecretKey::from_slice(&secret) {
                let keypair = Keypair::from_secret_key(&secp, &secret_key);
                return Self { secp, keypair };
            }
        }
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    pub fn public_key_hex(&self) -> String {
        self.public_key().to_string()
    }

    pub fn sign(&self, token: &BinderToken, value: &RandomValue) -> Signature {
        let message = callback_message(token, value);
        self.secp.sign_schnorr_no_aux_rand(&message, &self.keypair)
    }

    /// Answer `request` with `value`
    pub fn fulfil(&self, request: &OracleRequest, value: RandomValue) -> OracleCallback {
        OracleCallback {
            token: request.token.clone(),
            value,
            signature: self.sign(&request.token, &value),
        }
    }
}
