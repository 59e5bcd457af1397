//! Invite and key text codec.
//!
//! Invites and writer keys travel between humans as short base-32 strings
//! (unpadded, lowercase, case-insensitive on decode). The codec is a plain
//! byte transport: `decode(encode(x)) == x` for every input length.

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::KDF_CONTEXT_ROOM_TOPIC;
use crate::error::SharedError;
use crate::identity::Identity;
use crate::types::{Topic, WriterKey};

/// Encode opaque invite bytes as shareable text.
pub fn encode_invite(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

/// Decode shareable invite text back to the original bytes.
pub fn decode_invite(text: &str) -> Result<Vec<u8>, SharedError> {
    BASE32_NOPAD
        .decode(text.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| SharedError::InvalidInvite)
}

/// Encode a writer key for display surfaces (`peerEntered` / `peerLeft`).
pub fn encode_key(key: &WriterKey) -> String {
    encode_invite(&key.0)
}

/// Decode a displayed writer key.
pub fn decode_key(text: &str) -> Result<WriterKey, SharedError> {
    let bytes = decode_invite(text)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SharedError::InvalidKeyBytes)?;
    Ok(WriterKey(arr))
}

/// The candidate descriptor carried inside an invite: the one-time
/// rendezvous topic plus the issuing host's writer key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvitePayload {
    pub topic: Topic,
    pub host_key: WriterKey,
}

impl InvitePayload {
    /// Derive a fresh single-use invite from the host's writer key.
    ///
    /// The topic is a BLAKE3 derivation over the host key plus a random
    /// nonce, so every invite rendezvouses under a distinct descriptor.
    pub fn derive(host: &Identity) -> Self {
        let host_key = host.writer_key();
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_TOPIC);
        hasher.update(&host_key.0);
        hasher.update(Uuid::new_v4().as_bytes());
        Self {
            topic: *hasher.finalize().as_bytes(),
            host_key,
        }
    }

    /// Encode as shareable invite text.
    pub fn encode(&self) -> Result<String, SharedError> {
        let bytes =
            bincode::serialize(self).map_err(|e| SharedError::Serialization(e.to_string()))?;
        Ok(encode_invite(&bytes))
    }

    /// Decode from shareable invite text.
    pub fn decode(text: &str) -> Result<Self, SharedError> {
        let bytes = decode_invite(text)?;
        bincode::deserialize(&bytes).map_err(|_| SharedError::InvalidInvite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_roundtrip_all_lengths() {
        for len in 0..64usize {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37) as u8).collect();
            let text = encode_invite(&bytes);
            assert_eq!(decode_invite(&text).unwrap(), bytes, "len {len}");
        }
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let bytes = vec![1u8, 2, 3, 4, 5];
        let text = encode_invite(&bytes);
        assert_eq!(decode_invite(&text.to_ascii_uppercase()).unwrap(), bytes);
        assert_eq!(decode_invite(&format!("  {text} \n")).unwrap(), bytes);
    }

    #[test]
    fn test_bad_invite_rejected() {
        assert!(decode_invite("not valid base32 !!").is_err());
    }

    #[test]
    fn test_key_roundtrip() {
        let key = WriterKey([0x5Au8; 32]);
        assert_eq!(decode_key(&encode_key(&key)).unwrap(), key);
    }

    #[test]
    fn test_payload_roundtrip() {
        let host = Identity::generate();
        let payload = InvitePayload::derive(&host);
        let decoded = InvitePayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.host_key, host.writer_key());
    }

    #[test]
    fn test_payload_topics_are_single_use() {
        let host = Identity::generate();
        let a = InvitePayload::derive(&host);
        let b = InvitePayload::derive(&host);
        assert_ne!(a.topic, b.topic);
    }
}
