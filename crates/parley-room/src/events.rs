//! Typed notification channels.
//!
//! Sessions and registries fan their notifications out over
//! `tokio::sync::broadcast`; every consumer takes its own receiver via
//! `subscribe()`. Writer keys appear in their encoded text form on these
//! surfaces.

use parley_shared::{DataEntry, RoomId};

/// Notifications emitted by one room session.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A transcript entry authored by another participant was committed.
    Message(DataEntry),
    /// A peer completed pairing into the room.
    PeerEntered(String),
    /// A peer's farewell entry was committed.
    PeerLeft(String),
    /// The session reached its terminal state.
    RoomClosed,
}

/// Notifications emitted by a room registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A session was created and tracked.
    NewRoom(RoomId),
    /// A created session became ready and its invite is available.
    ReadyRoom { room: RoomId, invite: String },
    /// The registry emptied after having held at least one session.
    LastRoomClosed,
}
