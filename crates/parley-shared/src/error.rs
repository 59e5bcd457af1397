use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid invite text")]
    InvalidInvite,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Serialization error: {0}")]
    Serialization(String),
}
