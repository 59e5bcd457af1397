//! Seams for the external replication, discovery, and pairing
//! collaborators.
//!
//! The room protocol only ever issues the operations below; everything
//! about transport wire formats, DHT lookups, and conflict resolution
//! lives behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use parley_shared::{RoomId, Topic, WriterKey};

use crate::error::StoreError;

/// One room's merged multi-writer log, opened for a local writer key.
///
/// Records are opaque bytes in merge order: indices are stable, lengths
/// only grow, and every replica of the room observes the same sequence.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append a record under the local writer key. Returns the merged
    /// length after the append. Fails if the local key is not admitted.
    async fn append(&self, record: &[u8]) -> Result<u64, StoreError>;

    /// Read the record at a merge-order index.
    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Current merged length.
    async fn len(&self) -> Result<u64, StoreError>;

    /// Admit another writer key to this log.
    async fn add_writer(&self, key: WriterKey) -> Result<(), StoreError>;

    /// Growth signal carrying the merged length after each append.
    /// Bursts may coalesce; consumers must re-read `len` on each signal.
    async fn updates(&self) -> Result<broadcast::Receiver<u64>, StoreError>;

    /// Release this log handle.
    async fn close(&self) -> Result<(), StoreError>;
}

/// A pairing candidate that arrived under a rendezvous topic.
#[derive(Debug)]
pub struct Candidate {
    /// The candidate's writer key, offered with the pairing request.
    pub key: WriterKey,
    confirm: oneshot::Sender<WriterKey>,
}

impl Candidate {
    pub fn new(key: WriterKey, confirm: oneshot::Sender<WriterKey>) -> Self {
        Self { key, confirm }
    }

    /// Confirm the pairing back to the candidate with the host's writer
    /// key, completing the handshake from the host side.
    pub fn confirm(self, host_key: WriterKey) -> Result<(), StoreError> {
        self.confirm
            .send(host_key)
            .map_err(|_| StoreError::PairingFailed("candidate went away".into()))
    }
}

/// Rendezvous discovery plus the pairing coordinator, bound to one room.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Join a rendezvous topic, connecting this room's replication.
    async fn join(&self, topic: Topic) -> Result<(), StoreError>;

    /// Leave a rendezvous topic.
    async fn leave(&self, topic: Topic) -> Result<(), StoreError>;

    /// Host side: wait for the single candidate redeeming the invite
    /// issued under `topic`.
    async fn accept_candidate(&self, topic: Topic) -> Result<Candidate, StoreError>;

    /// Joiner side: redeem a pairing under `topic`, offering the local
    /// writer key. Resolves with the host's writer key on confirmation.
    async fn request_pairing(&self, topic: Topic, local: WriterKey) -> Result<WriterKey, StoreError>;
}

/// Per-room substrate handles produced by [`Substrate::open`].
pub struct RoomSubstrate {
    pub log: Arc<dyn ReplicatedLog>,
    pub rendezvous: Arc<dyn Rendezvous>,
}

/// A replication/discovery/pairing substrate shared by many rooms.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Open the substrate for one room, namespacing log storage under the
    /// room id. The local writer key is admitted as the founding writer.
    async fn open(&self, room: &RoomId, local: WriterKey) -> Result<RoomSubstrate, StoreError>;

    /// Release shared resources. Called at most once, by the owner.
    async fn close(&self) -> Result<(), StoreError>;
}
