//! # parley-shared
//!
//! Types shared across the Parley workspace: writer identities, the log
//! entry model, the invite codec, and the common error taxonomy.

pub mod constants;
pub mod entry;
pub mod identity;
pub mod invite;
pub mod types;

mod error;

pub use entry::{ControlEntry, DataBody, DataEntry, Entry};
pub use error::SharedError;
pub use identity::{verify_signature, Identity};
pub use invite::{decode_invite, decode_key, encode_invite, encode_key, InvitePayload};
pub use types::{RoomId, Topic, WriterKey};
