//! Integrity checks for candidate events: content hash and Schnorr signature.

use secp256k1::{schnorr::Signature, All, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{error::ValidationError, event::Event};

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> [u8; 32] {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    // Serializing a `Value` built from strings and integers cannot fail.
    let data = serde_json::to_vec(&arr).unwrap_or_default();
    Sha256::digest(&data).into()
}

/// Verifies event ids and signatures. Holds a reusable secp256k1 context.
#[derive(Clone)]
pub struct Validator {
    secp: Secp256k1<All>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Fail-closed admission check. Never panics or errors; rejections are logged.
    pub fn validate(&self, ev: &Event) -> bool {
        match self.verify(ev) {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %ev.id, pubkey = %ev.pubkey, kind = ev.kind, "rejected event: {e}");
                false
            }
        }
    }

    /// Verify an event's ID and Schnorr signature, reporting the reason on failure.
    pub fn verify(&self, ev: &Event) -> Result<(), ValidationError> {
        if ev.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if ev.pubkey.is_empty() {
            return Err(ValidationError::MissingField("pubkey"));
        }
        if ev.sig.is_empty() {
            return Err(ValidationError::MissingField("sig"));
        }
        let hash = event_hash(ev);
        if hex::encode(hash) != ev.id {
            return Err(ValidationError::IdMismatch);
        }
        let sig_bytes = hex::decode(&ev.sig).map_err(|_| ValidationError::MalformedHex("sig"))?;
        let pk_bytes =
            hex::decode(&ev.pubkey).map_err(|_| ValidationError::MalformedHex("pubkey"))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|_| ValidationError::InvalidSignatureEncoding)?;
        let pk =
            XOnlyPublicKey::from_slice(&pk_bytes).map_err(|_| ValidationError::InvalidPublicKey)?;
        let msg = Message::from_digest(hash);
        self.secp
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| ValidationError::BadSignature)
    }
}
