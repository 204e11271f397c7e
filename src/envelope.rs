//! Signed message envelope and its tag vocabulary.
//!
//! An envelope is the only thing the transport moves. Its `id` is derived
//! from the canonical serialization of the signed fields, so any mutation
//! in transit invalidates both the id and the signature.

use crate::error::{ProtocolError, Result};
use crate::model::MessageKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Application event kind shared by every protocol message.
pub const EVENT_KIND: u16 = 30078;

/// The single supported protocol version. Envelopes tagged with anything
/// else are treated as unparseable.
pub const PROTOCOL_VERSION: &str = "1";

pub const TAG_MESSAGE_TYPE: &str = "d";
pub const TAG_VERSION: &str = "v";
pub const TAG_REFERENCE: &str = "e";
pub const TAG_TARGET: &str = "p";

pub type Tag = (String, String);

/// Current unix time in seconds, as carried by `created_at`.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

pub fn tag_message_type(kind: MessageKind) -> Tag {
    (TAG_MESSAGE_TYPE.to_string(), kind.as_tag().to_string())
}

pub fn tag_version() -> Tag {
    (TAG_VERSION.to_string(), PROTOCOL_VERSION.to_string())
}

pub fn tag_reference(event_id: &str) -> Tag {
    (TAG_REFERENCE.to_string(), event_id.to_string())
}

pub fn tag_target(identity: &str) -> Tag {
    (TAG_TARGET.to_string(), identity.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Content-derived identifier: SHA-256 over the canonical body, hex.
    pub id: String,
    /// Origin identity (64-hex public key).
    pub origin: String,
    /// Unix seconds.
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    /// JSON-serialized payload.
    pub content: String,
    /// Origin's signature over the id digest, hex.
    pub sig: String,
}

impl Envelope {
    /// Canonical byte form of the signed fields. Field order is fixed;
    /// both id derivation and verification depend on it.
    pub fn canonical_bytes(
        origin: &str,
        created_at: u64,
        kind: u16,
        tags: &[Tag],
        content: &str,
    ) -> Result<Vec<u8>> {
        let body = (0u8, origin, created_at, kind, tags, content);
        serde_json::to_vec(&body).map_err(ProtocolError::from)
    }

    /// SHA-256 digest of the canonical body.
    pub fn compute_digest(
        origin: &str,
        created_at: u64,
        kind: u16,
        tags: &[Tag],
        content: &str,
    ) -> Result<[u8; 32]> {
        let bytes = Self::canonical_bytes(origin, created_at, kind, tags, content)?;
        Ok(Sha256::digest(&bytes).into())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(ProtocolError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(ProtocolError::from)
    }

    fn first_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Message kind declared by the message-type tag, if recognized.
    pub fn message_kind(&self) -> Option<MessageKind> {
        self.first_tag(TAG_MESSAGE_TYPE).and_then(MessageKind::from_tag)
    }

    pub fn version(&self) -> Option<&str> {
        self.first_tag(TAG_VERSION)
    }

    pub fn has_supported_version(&self) -> bool {
        self.version() == Some(PROTOCOL_VERSION)
    }

    /// Reference to a prior envelope id, if tagged.
    pub fn reference(&self) -> Option<&str> {
        self.first_tag(TAG_REFERENCE)
    }

    /// Target identities, in tag order.
    pub fn targets(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|(k, _)| k == TAG_TARGET)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn targets_identity(&self, identity: &str) -> bool {
        self.targets().iter().any(|t| *t == identity)
    }
}
