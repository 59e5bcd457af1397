//! Room registry: supervises many sessions over one shared substrate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use parley_shared::constants::EVENT_CHANNEL_CAPACITY;
use parley_shared::{Identity, RoomId};
use parley_store::{MemorySubstrate, Substrate};

use crate::error::RoomError;
use crate::events::{RegistryEvent, RoomEvent};
use crate::session::{ReadyState, RoomSession};

/// Options for creating a room session.
#[derive(Default)]
pub struct RoomOptions {
    /// Invite to redeem; absent for the host path.
    pub invite: Option<String>,
    /// Caller-defined metadata, merged with protocol-derived fields.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Writer identity; a fresh one is generated per room when absent.
    pub identity: Option<Identity>,
}

struct RegistryInner {
    rooms: HashMap<RoomId, Arc<RoomSession>>,
    shutting_down: bool,
    had_rooms: bool,
    cleaned: bool,
}

/// Supervises concurrent room sessions sharing one
/// replication/discovery/pairing substrate.
pub struct RoomRegistry {
    substrate: Arc<dyn Substrate>,
    /// Whether the substrate was constructed here (owned) or supplied by
    /// the caller (borrowed). Only owned resources are released.
    owns_substrate: bool,
    substrate_closed: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
    inner: Mutex<RegistryInner>,
}

impl RoomRegistry {
    /// Supervise rooms over a caller-supplied (borrowed) substrate.
    pub fn new(substrate: Arc<dyn Substrate>) -> Arc<Self> {
        Self::build(substrate, false)
    }

    /// Supervise rooms over an internally owned in-process substrate.
    pub fn local() -> Arc<Self> {
        Self::build(Arc::new(MemorySubstrate::standalone()), true)
    }

    fn build(substrate: Arc<dyn Substrate>, owns_substrate: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            substrate,
            owns_substrate,
            substrate_closed: AtomicBool::new(false),
            events,
            inner: Mutex::new(RegistryInner {
                rooms: HashMap::new(),
                shutting_down: false,
                had_rooms: false,
                cleaned: false,
            }),
        })
    }

    /// Subscribe to registry notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<RoomSession>> {
        self.lock().rooms.get(id).cloned()
    }

    /// Create and track a new room session with a fresh identifier. Log
    /// storage is namespaced under the identifier.
    pub async fn create_room(
        self: &Arc<Self>,
        options: RoomOptions,
    ) -> Result<Arc<RoomSession>, RoomError> {
        if self.lock().shutting_down {
            return Err(RoomError::ShuttingDown);
        }
        let id = RoomId::generate();
        let identity = options.identity.unwrap_or_else(Identity::generate);
        let handles = self.substrate.open(&id, identity.writer_key()).await?;
        let session = RoomSession::new(
            id.clone(),
            identity,
            handles,
            options.metadata,
            options.invite,
        );
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return Err(RoomError::ShuttingDown);
            }
            inner.rooms.insert(id.clone(), session.clone());
            inner.had_rooms = true;
        }
        let _ = self.events.send(RegistryEvent::NewRoom(id.clone()));
        info!(room = %id, "Room session created");
        self.spawn_session_watcher(session.clone());
        Ok(session)
    }

    /// Route one session's lifecycle into the registry: emit `ReadyRoom`
    /// once its invite is available and drop it from the map on close.
    fn spawn_session_watcher(self: &Arc<Self>, session: Arc<RoomSession>) {
        let registry = self.clone();
        // Receivers must exist before the caller can drive the session:
        // ready() may complete without yielding, and a receiver taken after
        // the readiness send would never observe it.
        let mut events = session.subscribe();
        let mut ready = session.ready_watch();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = ready.changed() => {
                        if changed.is_err() {
                            continue;
                        }
                        let state = ready.borrow_and_update().clone();
                        if let ReadyState::Ready { invite: Some(invite) } = state {
                            let _ = registry.events.send(RegistryEvent::ReadyRoom {
                                room: session.id().clone(),
                                invite,
                            });
                        }
                    }
                    event = events.recv() => match event {
                        Ok(RoomEvent::RoomClosed) | Err(broadcast::error::RecvError::Closed) => {
                            registry.forget(session.id());
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        });
    }

    fn forget(&self, id: &RoomId) {
        let emit_last = {
            let mut inner = self.lock();
            let removed = inner.rooms.remove(id).is_some();
            removed && inner.rooms.is_empty() && inner.had_rooms && !inner.shutting_down
        };
        debug!(room = %id, "Room session removed from registry");
        if emit_last {
            let _ = self.events.send(RegistryEvent::LastRoomClosed);
        }
    }

    /// Exit all tracked sessions concurrently, then release owned shared
    /// resources exactly once. Repeated calls are no-ops.
    pub async fn cleanup(&self) -> Result<(), RoomError> {
        let sessions: Vec<Arc<RoomSession>> = {
            let mut inner = self.lock();
            inner.shutting_down = true;
            if inner.cleaned {
                return Ok(());
            }
            inner.cleaned = true;
            inner.rooms.values().cloned().collect()
        };

        let results = futures::future::join_all(sessions.iter().map(|s| s.exit())).await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Room exit during cleanup failed");
            }
        }
        self.lock().rooms.clear();

        if self.owns_substrate && !self.substrate_closed.swap(true, Ordering::SeqCst) {
            self.substrate.close().await?;
        }
        info!("Registry cleanup complete");
        Ok(())
    }

    /// Process-level shutdown hook: mark the registry as shutting down and
    /// run full cleanup. `lastRoomClosed` never fires for rooms torn down
    /// here. Wire this to the process signal handler.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.cleanup().await
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
