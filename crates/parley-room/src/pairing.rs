//! The pairing handshake.
//!
//! A session becomes ready either as a host (no invite supplied: derive a
//! one-time invite, accept a single candidate under its rendezvous topic)
//! or as a joiner (redeem a supplied invite, await the host's
//! confirmation). Both sides finish holding each other's writer key,
//! recorded as `AddWriter` control entries in their logs.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use parley_shared::{
    encode_key, ControlEntry, Entry, Identity, InvitePayload, Topic, WriterKey,
};
use parley_store::{Candidate, Rendezvous, ReplicatedLog};

use crate::error::RoomError;
use crate::events::RoomEvent;

pub(crate) struct PairingOutcome {
    /// Encoded invite, host path only.
    pub invite: Option<String>,
    pub topic: Topic,
    /// The confirmed host key, joiner path only.
    pub host_key: Option<WriterKey>,
}

/// Host path: publish readiness under a fresh one-time topic and admit
/// the single candidate that redeems it. The invite is returned
/// immediately; admission runs in the background.
pub(crate) async fn host(
    identity: &Identity,
    log: &Arc<dyn ReplicatedLog>,
    rendezvous: &Arc<dyn Rendezvous>,
    events: &broadcast::Sender<RoomEvent>,
) -> Result<PairingOutcome, RoomError> {
    let payload = InvitePayload::derive(identity);
    let invite = payload.encode()?;
    let topic = payload.topic;
    rendezvous.join(topic).await?;

    let host_key = identity.writer_key();
    let rendezvous = rendezvous.clone();
    let log = log.clone();
    let events = events.clone();
    tokio::spawn(async move {
        match rendezvous.accept_candidate(topic).await {
            Ok(candidate) => {
                let key = candidate.key;
                if let Err(e) = admit(&log, &events, candidate, host_key).await {
                    warn!(peer = %key, error = %e, "Failed to admit pairing candidate");
                } else {
                    debug!(peer = %key, "Admitted pairing candidate");
                }
            }
            Err(e) => debug!(error = %e, "Pairing acceptance ended without a candidate"),
        }
    });

    Ok(PairingOutcome {
        invite: Some(invite),
        topic,
        host_key: None,
    })
}

async fn admit(
    log: &Arc<dyn ReplicatedLog>,
    events: &broadcast::Sender<RoomEvent>,
    candidate: Candidate,
    host_key: WriterKey,
) -> Result<(), RoomError> {
    let key = candidate.key;
    candidate.confirm(host_key)?;
    let record = Entry::Control(ControlEntry::AddWriter(key)).to_bytes()?;
    log.append(&record).await?;
    let _ = events.send(RoomEvent::PeerEntered(encode_key(&key)));
    Ok(())
}

/// Joiner path: redeem the invite, offering the local writer key; on the
/// host's confirmation, admit the host and connect replication.
pub(crate) async fn join(
    identity: &Identity,
    log: &Arc<dyn ReplicatedLog>,
    rendezvous: &Arc<dyn Rendezvous>,
    events: &broadcast::Sender<RoomEvent>,
    invite_text: &str,
) -> Result<PairingOutcome, RoomError> {
    let payload = InvitePayload::decode(invite_text)?;
    let topic = payload.topic;

    let host_key = rendezvous
        .request_pairing(topic, identity.writer_key())
        .await?;
    if host_key != payload.host_key {
        return Err(RoomError::Pairing(
            "confirmed host key does not match the invite".into(),
        ));
    }

    let record = Entry::Control(ControlEntry::AddWriter(host_key)).to_bytes()?;
    log.append(&record).await?;
    rendezvous.join(topic).await?;
    let _ = events.send(RoomEvent::PeerEntered(encode_key(&host_key)));
    debug!(host = %host_key, "Pairing confirmed by host");

    Ok(PairingOutcome {
        invite: None,
        topic,
        host_key: Some(host_key),
    })
}
