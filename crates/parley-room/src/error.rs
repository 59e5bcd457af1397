use thiserror::Error;

use parley_shared::SharedError;
use parley_store::StoreError;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Shared(#[from] SharedError),

    #[error("Room is not ready")]
    NotReady,

    #[error("Room is closed")]
    Closed,

    #[error("Registry is shutting down")]
    ShuttingDown,

    #[error("Pairing failed: {0}")]
    Pairing(String),

    #[error("Malformed identity claim: {0}")]
    MalformedClaim(&'static str),

    #[error("Ready room produced no invite")]
    MissingInvite,
}
