//! In-process substrate.
//!
//! A [`MemoryBus`] is a process-wide rendezvous connecting every
//! [`MemorySubstrate`] cloned over it. Each room namespace starts with its
//! own spine (an arrival-order record sequence plus an admitted-writer
//! set); joining a rendezvous topic splices a namespace's spine onto the
//! topic owner's spine, after which all connected replicas observe the
//! same merge order. Pairing slots are single-use: once a candidate has
//! been handed to the host, further redemptions of the topic fail.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use parley_shared::constants::EVENT_CHANNEL_CAPACITY;
use parley_shared::{RoomId, Topic, WriterKey};

use crate::error::StoreError;
use crate::traits::{Candidate, Rendezvous, ReplicatedLog, RoomSubstrate, Substrate};

/// Process-wide rendezvous and storage for in-process rooms.
pub struct MemoryBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    closed: bool,
    next_spine: u64,
    spines: HashMap<u64, Spine>,
    namespaces: HashMap<String, u64>,
    topics: HashMap<Topic, TopicClaim>,
    pairing: HashMap<Topic, PairingSlot>,
    redeemed: HashSet<Topic>,
}

/// Who claimed a rendezvous topic. Splicing repoints namespace ids, so
/// release checks go by the claimant's name, not the shared spine id.
struct TopicClaim {
    claimant: String,
    spine: u64,
}

struct Spine {
    records: Vec<Vec<u8>>,
    writers: HashSet<WriterKey>,
    notify: broadcast::Sender<u64>,
}

#[derive(Default)]
struct PairingSlot {
    host: Option<oneshot::Sender<Candidate>>,
    /// Joiner offers that arrived before the host armed acceptance.
    waiting: Vec<Offer>,
}

struct Offer {
    key: WriterKey,
    reply: oneshot::Sender<WriterKey>,
}

impl BusInner {
    /// Follow the namespace to its current spine. A splice repoints the
    /// namespace, so the lookup is always two-step.
    fn resolve_mut(&mut self, namespace: &str) -> Result<&mut Spine, StoreError> {
        let id = *self
            .namespaces
            .get(namespace)
            .ok_or_else(|| StoreError::NoSuchRoom(namespace.to_string()))?;
        self.spines
            .get_mut(&id)
            .ok_or_else(|| StoreError::NoSuchRoom(namespace.to_string()))
    }
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                closed: false,
                next_spine: 0,
                spines: HashMap::new(),
                namespaces: HashMap::new(),
                topics: HashMap::new(),
                pairing: HashMap::new(),
                redeemed: HashSet::new(),
            }),
        })
    }

    /// Shut the bus down. Pending pairings resolve with errors and every
    /// subsequent log or rendezvous operation fails with `Closed`.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.pairing.clear();
        debug!("Memory bus closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_namespace(&self, namespace: &str, founder: WriterKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.namespaces.contains_key(namespace) {
            // Re-opening an existing namespace keeps its spine.
            return Ok(());
        }
        let id = inner.next_spine;
        inner.next_spine += 1;
        let (notify, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut writers = HashSet::new();
        writers.insert(founder);
        inner.spines.insert(
            id,
            Spine {
                records: Vec::new(),
                writers,
                notify,
            },
        );
        inner.namespaces.insert(namespace.to_string(), id);
        debug!(namespace, founder = %founder, "Opened log namespace");
        Ok(())
    }

    fn append(&self, namespace: &str, local: WriterKey, record: &[u8]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let spine = inner.resolve_mut(namespace)?;
        if !spine.writers.contains(&local) {
            return Err(StoreError::NotAWriter(local));
        }
        spine.records.push(record.to_vec());
        let len = spine.records.len() as u64;
        let _ = spine.notify.send(len);
        Ok(len)
    }

    fn get(&self, namespace: &str, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let spine = inner.resolve_mut(namespace)?;
        Ok(spine.records.get(index as usize).cloned())
    }

    fn len(&self, namespace: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let spine = inner.resolve_mut(namespace)?;
        Ok(spine.records.len() as u64)
    }

    fn add_writer(&self, namespace: &str, key: WriterKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let spine = inner.resolve_mut(namespace)?;
        spine.writers.insert(key);
        Ok(())
    }

    fn subscribe(&self, namespace: &str) -> Result<broadcast::Receiver<u64>, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let spine = inner.resolve_mut(namespace)?;
        Ok(spine.notify.subscribe())
    }

    /// Connect a namespace's replication under a rendezvous topic.
    ///
    /// The first namespace to join claims the topic; later namespaces are
    /// spliced onto the claimant's spine in arrival order. Growth
    /// subscriptions taken out before a splice stay bound to the old
    /// spine, so replicas subscribe after joining.
    fn join(&self, namespace: &str, topic: Topic) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let my_id = *inner
            .namespaces
            .get(namespace)
            .ok_or_else(|| StoreError::NoSuchRoom(namespace.to_string()))?;
        match inner.topics.get(&topic).map(|claim| claim.spine) {
            None => {
                inner.topics.insert(
                    topic,
                    TopicClaim {
                        claimant: namespace.to_string(),
                        spine: my_id,
                    },
                );
                Ok(())
            }
            Some(owner_id) if owner_id == my_id => Ok(()),
            Some(owner_id) => {
                let Some(mine) = inner.spines.remove(&my_id) else {
                    return Err(StoreError::NoSuchRoom(namespace.to_string()));
                };
                let owner = inner
                    .spines
                    .get_mut(&owner_id)
                    .ok_or_else(|| StoreError::NoSuchRoom(namespace.to_string()))?;
                // Only the records splice. Admission never travels with a
                // splice: a writer joins the shared spine's admitted set
                // solely through an applied membership entry.
                owner.records.extend(mine.records);
                let len = owner.records.len() as u64;
                let _ = owner.notify.send(len);
                for id in inner.namespaces.values_mut() {
                    if *id == my_id {
                        *id = owner_id;
                    }
                }
                debug!(namespace, "Spliced namespace onto rendezvous spine");
                Ok(())
            }
        }
    }

    fn leave(&self, namespace: &str, topic: Topic) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        // Only the claimant releases the topic; a spliced-in replica
        // leaving must not drop the claim or cancel a pending pairing.
        let is_claimant = inner
            .topics
            .get(&topic)
            .is_some_and(|claim| claim.claimant == namespace);
        if is_claimant {
            inner.topics.remove(&topic);
            inner.pairing.remove(&topic);
        }
        Ok(())
    }

    fn accept_candidate(&self, topic: Topic) -> Result<oneshot::Receiver<Candidate>, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.redeemed.contains(&topic) {
            return Err(StoreError::PairingFailed("invite already redeemed".into()));
        }
        let (tx, rx) = oneshot::channel();
        let slot = inner.pairing.entry(topic).or_default();
        if let Some(offer) = slot.waiting.pop() {
            // A joiner got here first; hand it straight over.
            let _ = tx.send(Candidate::new(offer.key, offer.reply));
            inner.pairing.remove(&topic);
            inner.redeemed.insert(topic);
        } else {
            slot.host = Some(tx);
        }
        Ok(rx)
    }

    fn request_pairing(
        &self,
        topic: Topic,
        local: WriterKey,
    ) -> Result<oneshot::Receiver<WriterKey>, StoreError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.redeemed.contains(&topic) {
            return Err(StoreError::PairingFailed("invite already redeemed".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let slot = inner.pairing.entry(topic).or_default();
        match slot.host.take() {
            Some(host_tx) => {
                if host_tx
                    .send(Candidate::new(local, reply_tx))
                    .is_err()
                {
                    return Err(StoreError::PairingFailed("host went away".into()));
                }
                inner.pairing.remove(&topic);
                inner.redeemed.insert(topic);
            }
            None => {
                slot.waiting.push(Offer {
                    key: local,
                    reply: reply_tx,
                });
            }
        }
        Ok(reply_rx)
    }
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

struct MemoryLog {
    bus: Arc<MemoryBus>,
    namespace: String,
    local: WriterKey,
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    async fn append(&self, record: &[u8]) -> Result<u64, StoreError> {
        self.bus.append(&self.namespace, self.local, record)
    }

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.bus.get(&self.namespace, index)
    }

    async fn len(&self) -> Result<u64, StoreError> {
        self.bus.len(&self.namespace)
    }

    async fn add_writer(&self, key: WriterKey) -> Result<(), StoreError> {
        self.bus.add_writer(&self.namespace, key)
    }

    async fn updates(&self) -> Result<broadcast::Receiver<u64>, StoreError> {
        self.bus.subscribe(&self.namespace)
    }

    async fn close(&self) -> Result<(), StoreError> {
        // Shared spine survives; only this handle is released.
        Ok(())
    }
}

struct MemoryRendezvous {
    bus: Arc<MemoryBus>,
    namespace: String,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn join(&self, topic: Topic) -> Result<(), StoreError> {
        self.bus.join(&self.namespace, topic)
    }

    async fn leave(&self, topic: Topic) -> Result<(), StoreError> {
        self.bus.leave(&self.namespace, topic)
    }

    async fn accept_candidate(&self, topic: Topic) -> Result<Candidate, StoreError> {
        let rx = self.bus.accept_candidate(topic)?;
        rx.await
            .map_err(|_| StoreError::PairingFailed("pairing cancelled".into()))
    }

    async fn request_pairing(&self, topic: Topic, local: WriterKey) -> Result<WriterKey, StoreError> {
        let rx = self.bus.request_pairing(topic, local)?;
        rx.await
            .map_err(|_| StoreError::PairingFailed("host abandoned pairing".into()))
    }
}

/// A [`Substrate`] over a shared [`MemoryBus`].
pub struct MemorySubstrate {
    bus: Arc<MemoryBus>,
}

impl MemorySubstrate {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self { bus }
    }

    /// Convenience constructor with a private bus (single-process rooms).
    pub fn standalone() -> Self {
        Self::new(MemoryBus::new())
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn open(&self, room: &RoomId, local: WriterKey) -> Result<RoomSubstrate, StoreError> {
        self.bus.create_namespace(&room.0, local)?;
        Ok(RoomSubstrate {
            log: Arc::new(MemoryLog {
                bus: self.bus.clone(),
                namespace: room.0.clone(),
                local,
            }),
            rendezvous: Arc::new(MemoryRendezvous {
                bus: self.bus.clone(),
                namespace: room.0.clone(),
            }),
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.bus.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> WriterKey {
        WriterKey([b; 32])
    }

    async fn open(substrate: &MemorySubstrate, writer: WriterKey) -> (RoomId, RoomSubstrate) {
        let room = RoomId::generate();
        let handles = substrate.open(&room, writer).await.unwrap();
        (room, handles)
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let substrate = MemorySubstrate::standalone();
        let (_, handles) = open(&substrate, key(1)).await;

        assert_eq!(handles.log.append(b"one").await.unwrap(), 1);
        assert_eq!(handles.log.append(b"two").await.unwrap(), 2);
        assert_eq!(handles.log.len().await.unwrap(), 2);
        assert_eq!(handles.log.get(0).await.unwrap().unwrap(), b"one");
        assert_eq!(handles.log.get(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unadmitted_writer_rejected() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, a) = open(&substrate, key(1)).await;
        let (_, b) = open(&substrate, key(2)).await;

        // Splice b's namespace onto a's spine without admitting key 2.
        let topic = [9u8; 32];
        a.rendezvous.join(topic).await.unwrap();
        b.rendezvous.join(topic).await.unwrap();

        // Learning the topic grants replication, never append rights.
        assert!(matches!(
            b.log.append(b"nope").await,
            Err(StoreError::NotAWriter(_))
        ));
        assert!(a.log.append(b"owner still writes").await.is_ok());

        a.log.add_writer(key(2)).await.unwrap();
        assert!(b.log.append(b"now ok").await.is_ok());
    }

    #[tokio::test]
    async fn test_join_merges_spines() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, a) = open(&substrate, key(1)).await;
        let (_, b) = open(&substrate, key(2)).await;

        a.log.append(b"from a").await.unwrap();
        b.log.append(b"from b").await.unwrap();

        let topic = [7u8; 32];
        a.rendezvous.join(topic).await.unwrap();
        b.rendezvous.join(topic).await.unwrap();

        // Both replicas now see the same merged sequence.
        for handles in [&a, &b] {
            assert_eq!(handles.log.len().await.unwrap(), 2);
            assert_eq!(handles.log.get(0).await.unwrap().unwrap(), b"from a");
            assert_eq!(handles.log.get(1).await.unwrap().unwrap(), b"from b");
        }
    }

    #[tokio::test]
    async fn test_leave_by_joined_replica_keeps_topic_claim() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, a) = open(&substrate, key(1)).await;
        let (_, b) = open(&substrate, key(2)).await;
        let (_, c) = open(&substrate, key(3)).await;

        a.log.append(b"root").await.unwrap();
        let topic = [6u8; 32];
        a.rendezvous.join(topic).await.unwrap();
        b.rendezvous.join(topic).await.unwrap();
        b.rendezvous.leave(topic).await.unwrap();

        // The claim belongs to a; c still splices onto a's spine.
        c.rendezvous.join(topic).await.unwrap();
        assert_eq!(c.log.len().await.unwrap(), 1);
        assert_eq!(c.log.get(0).await.unwrap().unwrap(), b"root");

        // The claimant's own leave does release the topic.
        a.rendezvous.leave(topic).await.unwrap();
        let (_, d) = open(&substrate, key(4)).await;
        d.rendezvous.join(topic).await.unwrap();
        assert_eq!(d.log.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_updates_signal_fires() {
        let substrate = MemorySubstrate::standalone();
        let (_, handles) = open(&substrate, key(1)).await;

        let mut rx = handles.log.updates().await.unwrap();
        handles.log.append(b"ping").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pairing_host_first() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, host) = open(&substrate, key(1)).await;
        let (_, joiner) = open(&substrate, key(2)).await;

        let topic = [3u8; 32];
        let accept = tokio::spawn({
            let rendezvous = host.rendezvous.clone();
            async move {
                let candidate = rendezvous.accept_candidate(topic).await.unwrap();
                assert_eq!(candidate.key, key(2));
                candidate.confirm(key(1)).unwrap();
            }
        });

        let host_key = joiner
            .rendezvous
            .request_pairing(topic, key(2))
            .await
            .unwrap();
        assert_eq!(host_key, key(1));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_pairing_joiner_first() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, host) = open(&substrate, key(1)).await;
        let (_, joiner) = open(&substrate, key(2)).await;

        let topic = [4u8; 32];
        let redeem = tokio::spawn({
            let rendezvous = joiner.rendezvous.clone();
            async move { rendezvous.request_pairing(topic, key(2)).await.unwrap() }
        });
        tokio::task::yield_now().await;

        let candidate = host.rendezvous.accept_candidate(topic).await.unwrap();
        candidate.confirm(key(1)).unwrap();
        assert_eq!(redeem.await.unwrap(), key(1));
    }

    #[tokio::test]
    async fn test_pairing_is_single_use() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, host) = open(&substrate, key(1)).await;
        let (_, joiner) = open(&substrate, key(2)).await;

        let topic = [5u8; 32];
        let accept = tokio::spawn({
            let rendezvous = host.rendezvous.clone();
            async move {
                let candidate = rendezvous.accept_candidate(topic).await.unwrap();
                candidate.confirm(key(1)).unwrap();
            }
        });
        joiner
            .rendezvous
            .request_pairing(topic, key(2))
            .await
            .unwrap();
        accept.await.unwrap();

        // A second redemption of the same topic must fail.
        assert!(matches!(
            joiner.rendezvous.request_pairing(topic, key(3)).await,
            Err(StoreError::PairingFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_operations() {
        let bus = MemoryBus::new();
        let substrate = MemorySubstrate::new(bus);
        let (_, handles) = open(&substrate, key(1)).await;

        substrate.close().await.unwrap();
        assert!(matches!(
            handles.log.append(b"late").await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(handles.log.len().await, Err(StoreError::Closed)));
    }
}
