//! Keys, envelope sealing, and the authenticity gate.
//!
//! Identities are hex-encoded Ed25519 public keys. The envelope signature
//! covers the content-derived id digest; the detached receipt signature
//! covers the canonical receipt body and is verified separately.

use crate::envelope::{Envelope, Tag, EVENT_KIND};
use crate::error::{ProtocolError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub struct Keypair {
    signing: SigningKey,
    public_hex: String,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ProtocolError::Config(format!("bad secret key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Config("secret key must be 32 bytes".to_string()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, public_hex }
    }

    /// 64-hex identity this keypair signs as.
    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Detached signature over an arbitrary digest, hex-encoded.
    pub fn sign_digest(&self, digest: &[u8]) -> String {
        hex::encode(self.signing.sign(digest).to_bytes())
    }

    /// Build a signed envelope around serialized payload content.
    pub fn seal(&self, tags: Vec<Tag>, content: String, created_at: u64) -> Result<Envelope> {
        let digest =
            Envelope::compute_digest(&self.public_hex, created_at, EVENT_KIND, &tags, &content)?;
        let sig = self.sign_digest(&digest);
        Ok(Envelope {
            id: hex::encode(digest),
            origin: self.public_hex.clone(),
            created_at,
            kind: EVENT_KIND,
            tags,
            content,
            sig,
        })
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("public", &self.public_hex).finish()
    }
}

fn verify_hex_signature(signature_hex: &str, message: &[u8], identity_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(identity_hex) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Verify the envelope signature against the claimed origin: the id must
/// match the canonical body and the signature must cover it.
pub fn verify_envelope(envelope: &Envelope) -> bool {
    let Ok(digest) = Envelope::compute_digest(
        &envelope.origin,
        envelope.created_at,
        envelope.kind,
        &envelope.tags,
        &envelope.content,
    ) else {
        return false;
    };
    if hex::encode(digest) != envelope.id {
        return false;
    }
    verify_hex_signature(&envelope.sig, &digest, &envelope.origin)
}

/// Verify a detached signature over a canonical body digest. Used for the
/// settlement receipt only.
pub fn verify_detached(signature_hex: &str, body_digest: &[u8], identity_hex: &str) -> bool {
    verify_hex_signature(signature_hex, body_digest, identity_hex)
}

/// The authenticity gate: both the signature and the protocol version must
/// check out before any state-machine logic may run. A failure of either
/// means the message does not exist for state purposes.
pub fn authenticate(envelope: &Envelope) -> bool {
    verify_envelope(envelope) && envelope.has_supported_version()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{tag_message_type, tag_version};
    use crate::model::MessageKind;

    fn sealed() -> (Keypair, Envelope) {
        let keys = Keypair::generate();
        let env = keys
            .seal(
                vec![tag_message_type(MessageKind::RideRequest), tag_version()],
                "{\"id\":\"req-1\"}".to_string(),
                1_700_000_000,
            )
            .unwrap();
        (keys, env)
    }

    #[test]
    fn test_secret_round_trip() {
        let keys = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keys.secret_hex()).unwrap();
        assert_eq!(keys.public_hex(), restored.public_hex());
    }

    #[test]
    fn test_seal_verifies() {
        let (_, env) = sealed();
        assert_eq!(env.id.len(), 64);
        assert!(verify_envelope(&env));
        assert!(authenticate(&env));
    }

    #[test]
    fn test_tampered_content_rejected() {
        let (_, mut env) = sealed();
        env.content = "{\"id\":\"req-2\"}".to_string();
        assert!(!verify_envelope(&env));
    }

    #[test]
    fn test_wrong_origin_rejected() {
        let (_, mut env) = sealed();
        env.origin = Keypair::generate().public_hex().to_string();
        assert!(!verify_envelope(&env));
    }

    #[test]
    fn test_missing_version_fails_gate() {
        let keys = Keypair::generate();
        let env = keys
            .seal(
                vec![tag_message_type(MessageKind::RideRequest)],
                "{}".to_string(),
                1_700_000_000,
            )
            .unwrap();
        // Signature is fine, but the gate requires the version tag too.
        assert!(verify_envelope(&env));
        assert!(!authenticate(&env));
    }

    #[test]
    fn test_detached_signature() {
        let keys = Keypair::generate();
        let digest = [7u8; 32];
        let sig = keys.sign_digest(&digest);
        assert!(verify_detached(&sig, &digest, keys.public_hex()));
        assert!(!verify_detached(&sig, &[8u8; 32], keys.public_hex()));
        assert!(!verify_detached(&sig, &digest, Keypair::generate().public_hex()));
    }
}
