use parley_shared::WriterKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Substrate is closed")]
    Closed,

    #[error("Key {0} is not an admitted writer")]
    NotAWriter(WriterKey),

    #[error("No log opened for room {0}")]
    NoSuchRoom(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
