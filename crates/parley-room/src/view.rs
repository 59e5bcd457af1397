//! Log view materialization.
//!
//! Consumes the merged log strictly in merge order and maintains the
//! room's transcript: an append-only sequence of data entries. Control
//! entries mutate membership against the log engine and never surface.
//! Notification rules:
//!
//! - entries authored by the local identity never notify;
//! - a farewell entry notifies `PeerLeft` and never also `Message`;
//! - a `Message` or `PeerLeft` fires at most once per distinct view
//!   length, so coalesced or spurious growth signals cannot deliver the
//!   same logical append twice.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_shared::{encode_key, ControlEntry, DataEntry, Entry, WriterKey};
use parley_store::ReplicatedLog;

use crate::events::RoomEvent;

/// The materialized room view: merge-ordered data entries only.
pub struct ViewState {
    entries: Vec<DataEntry>,
    last_notified_len: u64,
    local: WriterKey,
}

impl ViewState {
    pub fn new(local: WriterKey) -> Self {
        Self {
            entries: Vec::new(),
            last_notified_len: 0,
            local,
        }
    }

    /// Append one merged data entry and compute the notification for it,
    /// if any.
    pub fn apply(&mut self, entry: DataEntry) -> Option<RoomEvent> {
        self.entries.push(entry);
        self.notify()
    }

    /// Re-inspect the newest entry after a growth signal that carried no
    /// new records. The length guard makes this a no-op for any length
    /// that already notified.
    pub fn repoll(&mut self) -> Option<RoomEvent> {
        self.notify()
    }

    fn notify(&mut self) -> Option<RoomEvent> {
        let len = self.entries.len() as u64;
        if len <= self.last_notified_len {
            return None;
        }
        let newest = self.entries.last()?;
        if newest.who == self.local {
            return None;
        }
        let event = if newest.is_farewell() {
            RoomEvent::PeerLeft(encode_key(&newest.who))
        } else {
            RoomEvent::Message(newest.clone())
        };
        self.last_notified_len = len;
        Some(event)
    }

    /// The full ordered transcript so far.
    pub fn transcript(&self) -> Vec<DataEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) type SharedView = Arc<Mutex<ViewState>>;

pub(crate) fn shared_view(local: WriterKey) -> SharedView {
    Arc::new(Mutex::new(ViewState::new(local)))
}

fn lock_view(view: &SharedView) -> MutexGuard<'_, ViewState> {
    view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drive the materializer for one session: a single task pulls the log's
/// growth signal, catches the view up in merge order, and emits events.
/// One in-flight pass at a time; no reordering between notifications.
pub(crate) fn spawn_materializer(
    log: Arc<dyn ReplicatedLog>,
    events: broadcast::Sender<RoomEvent>,
    view: SharedView,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut updates = match log.updates().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Log growth signal unavailable");
                return;
            }
        };
        let mut processed: u64 = 0;
        loop {
            let before = processed;
            loop {
                let len = match log.len().await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!(error = %e, "Log unavailable, stopping materializer");
                        return;
                    }
                };
                if processed >= len {
                    break;
                }
                let record = match log.get(processed).await {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Log unavailable, stopping materializer");
                        return;
                    }
                };
                processed += 1;
                match Entry::from_bytes_lossy(&record) {
                    Entry::Control(ControlEntry::AddWriter(key)) => {
                        if let Err(e) = log.add_writer(key).await {
                            warn!(key = %key, error = %e, "Failed to admit writer");
                        }
                    }
                    Entry::Control(ControlEntry::SelfEcho(_)) => {
                        // A peer's echo of its own admission; re-applying it
                        // would start an admission cycle.
                    }
                    Entry::Data(entry) => {
                        let event = lock_view(&view).apply(entry);
                        if let Some(event) = event {
                            let _ = events.send(event);
                        }
                    }
                }
            }
            if processed == before {
                // Spurious or coalesced signal; the length guard decides.
                let event = lock_view(&view).repoll();
                if let Some(event) = event {
                    let _ = events.send(event);
                }
            }
            match updates.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::{DataBody, Identity};

    fn peer_message(identity: &Identity, text: &str) -> DataEntry {
        DataEntry::message(identity, text).unwrap()
    }

    #[test]
    fn test_view_grows_in_order() {
        let local = Identity::generate();
        let peer = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        view.apply(peer_message(&peer, "one"));
        view.apply(peer_message(&local, "two"));
        view.apply(peer_message(&peer, "three"));

        let transcript = view.transcript();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[0].body, DataBody::Message("one".into()));
        assert_eq!(transcript[1].body, DataBody::Message("two".into()));
        assert_eq!(transcript[2].body, DataBody::Message("three".into()));
    }

    #[test]
    fn test_peer_message_notifies_once() {
        let local = Identity::generate();
        let peer = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        let event = view.apply(peer_message(&peer, "hello"));
        match event {
            Some(RoomEvent::Message(entry)) => {
                assert_eq!(entry.who, peer.writer_key());
                assert_eq!(entry.body, DataBody::Message("hello".into()));
            }
            other => panic!("expected message event, got {other:?}"),
        }

        // Repeated polls of the same length stay silent.
        assert_eq!(view.repoll(), None);
        assert_eq!(view.repoll(), None);
    }

    #[test]
    fn test_no_self_notification() {
        let local = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        assert_eq!(view.apply(peer_message(&local, "mine")), None);
        assert_eq!(view.repoll(), None);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_farewell_notifies_peer_left_only() {
        let local = Identity::generate();
        let peer = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        let event = view.apply(DataEntry::farewell(&peer).unwrap());
        assert_eq!(
            event,
            Some(RoomEvent::PeerLeft(encode_key(&peer.writer_key())))
        );
        // Never both, never duplicated.
        assert_eq!(view.repoll(), None);
    }

    #[test]
    fn test_message_after_self_entry_still_notifies() {
        let local = Identity::generate();
        let peer = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        assert_eq!(view.apply(peer_message(&local, "mine")), None);
        let event = view.apply(peer_message(&peer, "yours"));
        assert!(matches!(event, Some(RoomEvent::Message(_))));
    }

    #[tokio::test]
    async fn test_materializer_consumes_control_entries() {
        use std::time::Duration;

        use parley_shared::RoomId;
        use parley_store::{MemorySubstrate, Substrate};
        use tokio::time::timeout;

        let substrate = MemorySubstrate::standalone();
        let local = Identity::generate();
        let peer = Identity::generate();
        let stranger = Identity::generate();
        let room = RoomId::generate();
        let handles = substrate.open(&room, local.writer_key()).await.unwrap();

        let (events, mut rx) = broadcast::channel(16);
        let view = shared_view(local.writer_key());
        let task = spawn_materializer(handles.log.clone(), events, view.clone());

        // An admission is applied as a membership mutation; an echo of a
        // peer's own admission is skipped and must admit nobody.
        let admit = Entry::Control(ControlEntry::AddWriter(peer.writer_key()));
        let echo = Entry::Control(ControlEntry::SelfEcho(stranger.writer_key()));
        handles.log.append(&admit.to_bytes().unwrap()).await.unwrap();
        handles.log.append(&echo.to_bytes().unwrap()).await.unwrap();

        // Once the admission lands, the peer can append.
        let peer_log = substrate.open(&room, peer.writer_key()).await.unwrap().log;
        let record = Entry::Data(peer_message(&peer, "hello")).to_bytes().unwrap();
        let mut admitted = false;
        for _ in 0..200 {
            if peer_log.append(&record).await.is_ok() {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(admitted, "admission control entry was not applied");

        // The echoed admission never took effect.
        let stranger_log = substrate
            .open(&room, stranger.writer_key())
            .await
            .unwrap()
            .log;
        assert!(stranger_log.append(b"denied").await.is_err());

        // The only notification is the peer message; control entries never
        // surfaced in the view.
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            RoomEvent::Message(entry) => {
                assert_eq!(entry.who, peer.writer_key());
                assert_eq!(entry.body, DataBody::Message("hello".into()));
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(lock_view(&view).len(), 1);
        task.abort();
    }

    #[test]
    fn test_raw_entry_surfaces_as_message() {
        let local = Identity::generate();
        let mut view = ViewState::new(local.writer_key());

        let entry = match Entry::from_bytes_lossy(&[0xFF, 0xFE, 0xFD]) {
            Entry::Data(entry) => entry,
            other => panic!("expected data entry, got {other:?}"),
        };
        let event = view.apply(entry);
        assert!(matches!(event, Some(RoomEvent::Message(_))));
        assert_eq!(view.len(), 1);
    }
}
