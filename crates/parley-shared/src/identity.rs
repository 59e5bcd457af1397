use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::types::WriterKey;

/// A participant's cryptographic identity based on Ed25519.
/// The public key doubles as the writer key for the participant's log.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting an identity.
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from secret key bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore an identity from a serialized export.
    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    /// The writer key (public key) this identity appends under.
    pub fn writer_key(&self) -> WriterKey {
        WriterKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// The verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Export the identity for serialization.
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("writer_key", &self.writer_key())
            .finish_non_exhaustive()
    }
}

/// Verify a signature against a writer key.
pub fn verify_signature(
    key: &WriterKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SharedError> {
    let verifying_key =
        VerifyingKey::from_bytes(&key.0).map_err(|_| SharedError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| SharedError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        assert_eq!(id.writer_key().0.len(), 32);
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_export(&export);
        assert_eq!(id.writer_key(), restored.writer_key());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"hello, parley";
        let signature = id.sign(message);

        assert!(verify_signature(&id.writer_key(), message, &signature).is_ok());

        // Wrong message should fail
        assert!(verify_signature(&id.writer_key(), b"wrong", &signature).is_err());
    }
}
