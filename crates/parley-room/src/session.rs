//! One room's session: identity, log handle, membership, and lifecycle.
//!
//! Lifecycle: `Created → Pairing → Ready → Exiting → Closed`. Sends and
//! transcript reads are permitted once ready; `ready()` and `exit()` are
//! idempotent and serialized against each other.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::constants::{EVENT_CHANNEL_CAPACITY, META_HOST, META_WHO};
use parley_shared::{encode_key, DataEntry, Entry, Identity, RoomId, Topic, WriterKey};
use parley_store::{Rendezvous, ReplicatedLog, RoomSubstrate};

use crate::error::RoomError;
use crate::events::RoomEvent;
use crate::pairing;
use crate::view::{self, SharedView};

/// Lifecycle states of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Created,
    Pairing,
    Ready,
    Exiting,
    Closed,
}

/// Observable readiness, published on a watch channel so callers can wait
/// for pairing completion instead of inferring it from return values.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    Pending,
    Ready { invite: Option<String> },
    Closed,
}

/// Room info query result.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub invite: Option<String>,
    pub room_id: RoomId,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Joiner,
}

struct Lifecycle {
    state: RoomState,
    role: Option<Role>,
    /// Encoded invite: produced on the host path, redeemed on the joiner
    /// path. Present once ready.
    invite: Option<String>,
    /// Invite supplied at creation (joiner path).
    pending_invite: Option<String>,
    topic: Option<Topic>,
    metadata: serde_json::Map<String, serde_json::Value>,
    materializer: Option<JoinHandle<()>>,
}

/// One logical chat room, owned exclusively by this session.
pub struct RoomSession {
    id: RoomId,
    identity: Identity,
    log: Arc<dyn ReplicatedLog>,
    rendezvous: Arc<dyn Rendezvous>,
    events: broadcast::Sender<RoomEvent>,
    ready_tx: watch::Sender<ReadyState>,
    view: SharedView,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes `ready()` and `exit()` so duplicate initialization and
    /// concurrent exits cannot interleave.
    op: tokio::sync::Mutex<()>,
}

impl RoomSession {
    pub(crate) fn new(
        id: RoomId,
        identity: Identity,
        substrate: RoomSubstrate,
        mut metadata: serde_json::Map<String, serde_json::Value>,
        invite: Option<String>,
    ) -> Arc<Self> {
        metadata.insert(
            META_WHO.to_string(),
            serde_json::Value::String(encode_key(&identity.writer_key())),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        let view = view::shared_view(identity.writer_key());
        Arc::new(Self {
            id,
            identity,
            log: substrate.log,
            rendezvous: substrate.rendezvous,
            events,
            ready_tx,
            view,
            lifecycle: Mutex::new(Lifecycle {
                state: RoomState::Created,
                role: None,
                invite: None,
                pending_invite: invite,
                topic: None,
                metadata,
                materializer: None,
            }),
            op: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// The writer key this session appends under.
    pub fn writer_key(&self) -> WriterKey {
        self.identity.writer_key()
    }

    pub fn state(&self) -> RoomState {
        self.lock().state
    }

    /// Subscribe to this session's notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Watch readiness transitions.
    pub fn ready_watch(&self) -> watch::Receiver<ReadyState> {
        self.ready_tx.subscribe()
    }

    /// Run the pairing handshake and attach the materializer.
    ///
    /// Returns the encoded invite on the host path, `None` on the joiner
    /// path. Safe to call repeatedly: after the first completion it
    /// returns the cached result without re-pairing.
    pub async fn ready(&self) -> Result<Option<String>, RoomError> {
        let _op = self.op.lock().await;
        let pending_invite = {
            let mut lc = self.lock();
            match lc.state {
                RoomState::Ready => {
                    return Ok(match lc.role {
                        Some(Role::Host) => lc.invite.clone(),
                        _ => None,
                    });
                }
                RoomState::Exiting | RoomState::Closed => return Err(RoomError::Closed),
                RoomState::Created | RoomState::Pairing => {
                    lc.state = RoomState::Pairing;
                    lc.pending_invite.clone()
                }
            }
        };

        let outcome = match pending_invite.as_deref() {
            Some(invite_text) => {
                pairing::join(
                    &self.identity,
                    &self.log,
                    &self.rendezvous,
                    &self.events,
                    invite_text,
                )
                .await
            }
            None => pairing::host(&self.identity, &self.log, &self.rendezvous, &self.events).await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.lock().state = RoomState::Created;
                return Err(e);
            }
        };

        let handle =
            view::spawn_materializer(self.log.clone(), self.events.clone(), self.view.clone());

        let invite_out = {
            let mut lc = self.lock();
            lc.topic = Some(outcome.topic);
            lc.materializer = Some(handle);
            lc.state = RoomState::Ready;
            match outcome.host_key {
                Some(host_key) => {
                    lc.role = Some(Role::Joiner);
                    lc.invite = pending_invite;
                    lc.metadata.insert(
                        META_HOST.to_string(),
                        serde_json::Value::String(encode_key(&host_key)),
                    );
                    None
                }
                None => {
                    lc.role = Some(Role::Host);
                    lc.invite = outcome.invite.clone();
                    outcome.invite
                }
            }
        };
        let _ = self.ready_tx.send(ReadyState::Ready {
            invite: invite_out.clone(),
        });
        info!(room = %self.id, who = %self.identity.writer_key(), "Room ready");
        Ok(invite_out)
    }

    /// Append a signed message entry to the local log.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), RoomError> {
        match self.state() {
            RoomState::Ready => {}
            RoomState::Created | RoomState::Pairing => return Err(RoomError::NotReady),
            RoomState::Exiting | RoomState::Closed => return Err(RoomError::Closed),
        }
        let entry = DataEntry::message(&self.identity, text)?;
        let record = Entry::Data(entry).to_bytes()?;
        self.log.append(&record).await?;
        Ok(())
    }

    /// The full ordered transcript currently in the view.
    pub fn transcript(&self) -> Vec<DataEntry> {
        self.view
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .transcript()
    }

    /// Room info query: invite, identifier, metadata.
    pub fn info(&self) -> RoomInfo {
        let lc = self.lock();
        RoomInfo {
            invite: lc.invite.clone(),
            room_id: self.id.clone(),
            metadata: lc.metadata.clone(),
        }
    }

    /// Merge caller-defined fields into the room metadata.
    pub fn update_metadata(&self, fields: serde_json::Map<String, serde_json::Value>) {
        let mut lc = self.lock();
        for (key, value) in fields {
            lc.metadata.insert(key, value);
        }
    }

    /// Leave the room: append the farewell entry, release resources, and
    /// emit `RoomClosed` exactly once. Idempotent; a failed farewell
    /// append still releases everything owned locally.
    pub async fn exit(&self) -> Result<(), RoomError> {
        let _op = self.op.lock().await;
        let (was_ready, topic, materializer) = {
            let mut lc = self.lock();
            if lc.state == RoomState::Closed {
                return Ok(());
            }
            let was_ready = lc.state == RoomState::Ready;
            lc.state = RoomState::Exiting;
            (was_ready, lc.topic.take(), lc.materializer.take())
        };

        let mut failure: Option<RoomError> = None;
        if was_ready {
            match self.farewell_record() {
                Ok(record) => {
                    if let Err(e) = self.log.append(&record).await {
                        warn!(room = %self.id, error = %e, "Farewell append failed");
                        failure = Some(e.into());
                    }
                }
                Err(e) => failure = Some(e),
            }
        }
        if let Some(topic) = topic {
            if let Err(e) = self.rendezvous.leave(topic).await {
                debug!(room = %self.id, error = %e, "Leaving rendezvous topic failed");
            }
        }
        if let Some(handle) = materializer {
            handle.abort();
        }
        if let Err(e) = self.log.close().await {
            failure.get_or_insert(e.into());
        }

        self.lock().state = RoomState::Closed;
        let _ = self.events.send(RoomEvent::RoomClosed);
        let _ = self.ready_tx.send(ReadyState::Closed);
        info!(room = %self.id, "Room closed");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn farewell_record(&self) -> Result<Vec<u8>, RoomError> {
        let entry = DataEntry::farewell(&self.identity)?;
        Ok(Entry::Data(entry).to_bytes()?)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("id", &self.id)
            .field("who", &self.identity.writer_key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
