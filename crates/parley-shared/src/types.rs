use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;

// Writer identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WriterKey(pub [u8; 32]);

impl WriterKey {
    /// Placeholder key attributed to log records whose author is unknown.
    pub const UNKNOWN: WriterKey = WriterKey([0u8; 32]);

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SharedError> {
        let bytes = hex::decode(s).map_err(|_| SharedError::InvalidKeyBytes)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SharedError::InvalidKeyBytes)?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for WriterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One-time rendezvous descriptor under which a host accepts a pairing
/// candidate.
pub type Topic = [u8; 32];

/// Opaque unique identifier for one logical room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_key_hex_roundtrip() {
        let key = WriterKey([7u8; 32]);
        let restored = WriterKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn test_writer_key_short() {
        let key = WriterKey([0xABu8; 32]);
        assert_eq!(key.short(), "abababab");
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(WriterKey::from_hex("not-hex").is_err());
        assert!(WriterKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_room_ids_unique() {
        assert_ne!(RoomId::generate(), RoomId::generate());
    }
}
