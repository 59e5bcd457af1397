//! The log entry model.
//!
//! Every record appended to a participant's log is either a *control*
//! entry (a membership change) or a *data* entry (chat content or a
//! farewell marker). The two kinds are disjoint; control entries are
//! consumed during view materialization and never surface in a transcript.

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::identity::{verify_signature, Identity};
use crate::types::WriterKey;

/// One item appended to a writer's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Entry {
    Control(ControlEntry),
    Data(DataEntry),
}

/// A membership mutation.
///
/// `SelfEcho` is a peer's re-broadcast of its own admission record; the
/// materializer recognizes it and must not re-apply it, otherwise an
/// admitted peer would re-admit itself via its own echoed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlEntry {
    AddWriter(WriterKey),
    SelfEcho(WriterKey),
}

/// A transcript-visible record: who wrote what, when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataEntry {
    pub when: DateTime<Utc>,
    pub who: WriterKey,
    pub body: DataBody,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataBody {
    /// A chat message payload.
    Message(String),
    /// Terminal marker appended when the author leaves the room.
    LeftChat,
    /// A record that did not decode as a conforming entry, carried
    /// verbatim so the view stays monotonic.
    Raw(Vec<u8>),
}

impl Entry {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, SharedError> {
        bincode::serialize(self).map_err(|e| SharedError::Serialization(e.to_string()))
    }

    /// Deserialize from binary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SharedError> {
        bincode::deserialize(bytes).map_err(|e| SharedError::Serialization(e.to_string()))
    }

    /// Deserialize from binary, wrapping undecodable records as raw data
    /// entries instead of failing. Conforming writers never produce such
    /// records, but a malformed one must not halt materialization.
    pub fn from_bytes_lossy(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes).unwrap_or_else(|_| {
            Entry::Data(DataEntry {
                when: Utc::now(),
                who: WriterKey::UNKNOWN,
                body: DataBody::Raw(bytes.to_vec()),
                signature: None,
            })
        })
    }
}

impl DataEntry {
    /// Build a signed message entry authored by `identity` now.
    pub fn message(identity: &Identity, text: impl Into<String>) -> Result<Self, SharedError> {
        Self::signed(identity, DataBody::Message(text.into()))
    }

    /// Build the signed farewell entry authored by `identity` now.
    pub fn farewell(identity: &Identity) -> Result<Self, SharedError> {
        Self::signed(identity, DataBody::LeftChat)
    }

    fn signed(identity: &Identity, body: DataBody) -> Result<Self, SharedError> {
        let mut entry = DataEntry {
            when: Utc::now(),
            who: identity.writer_key(),
            body,
            signature: None,
        };
        let signature = identity.sign(&entry.signable_bytes()?);
        entry.signature = Some(signature.to_bytes().to_vec());
        Ok(entry)
    }

    /// The byte string covered by the entry signature.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, SharedError> {
        bincode::serialize(&(&self.when, &self.who, &self.body))
            .map_err(|e| SharedError::Serialization(e.to_string()))
    }

    /// Check the entry signature against the author's writer key.
    /// Unsigned or malformed entries verify as `false`, never as an error.
    pub fn verify(&self) -> bool {
        let Some(sig_bytes) = self.signature.as_deref() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig_bytes) else {
            return false;
        };
        let Ok(message) = self.signable_bytes() else {
            return false;
        };
        verify_signature(&self.who, &message, &signature).is_ok()
    }

    /// Whether this is the author's farewell marker.
    pub fn is_farewell(&self) -> bool {
        matches!(self.body, DataBody::LeftChat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let id = Identity::generate();
        let entry = Entry::Data(DataEntry::message(&id, "hi there").unwrap());

        let bytes = entry.to_bytes().unwrap();
        let restored = Entry::from_bytes(&bytes).unwrap();
        assert_eq!(entry, restored);
    }

    #[test]
    fn test_control_roundtrip() {
        let entry = Entry::Control(ControlEntry::AddWriter(WriterKey([3u8; 32])));
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(Entry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_lossy_fallback_keeps_payload() {
        let garbage = vec![0xFFu8; 11];
        match Entry::from_bytes_lossy(&garbage) {
            Entry::Data(d) => {
                assert_eq!(d.who, WriterKey::UNKNOWN);
                assert_eq!(d.body, DataBody::Raw(garbage));
                assert!(!d.verify());
            }
            other => panic!("expected data entry, got {other:?}"),
        }
    }

    #[test]
    fn test_signed_message_verifies() {
        let id = Identity::generate();
        let entry = DataEntry::message(&id, "signed").unwrap();
        assert!(entry.verify());

        // Tampering with the payload breaks the signature
        let mut tampered = entry.clone();
        tampered.body = DataBody::Message("forged".into());
        assert!(!tampered.verify());
    }

    #[test]
    fn test_farewell_marker() {
        let id = Identity::generate();
        let entry = DataEntry::farewell(&id).unwrap();
        assert!(entry.is_farewell());
        assert!(entry.verify());
    }
}
