//! # parley-room
//!
//! The room session protocol: materializing a consistent transcript from a
//! multi-writer replicated log, the pairing handshake admitting new
//! writers, the session lifecycle, the trust-negotiation protocol for
//! unsolicited room requests, and the registry supervising many rooms over
//! one shared substrate.

pub mod agreement;
pub mod events;
pub mod registry;
pub mod session;
pub mod view;

mod error;
mod pairing;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default log subscriber for embedding applications.
/// `RUST_LOG` overrides the built-in filter. Call at most once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_room=debug,parley_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

pub use agreement::{
    Acceptance, ChallengeResponse, ClaimKind, Ed25519Verifier, Expectations, ExpectationsQuery,
    HostCredential, IdentityClaim, IdentityVerifier, NegotiationContext, NegotiationOutcome,
    Negotiator, NegotiatorConfig, ParticipantDetails, Verdict,
};
pub use error::RoomError;
pub use events::{RegistryEvent, RoomEvent};
pub use registry::{RoomOptions, RoomRegistry};
pub use session::{ReadyState, RoomInfo, RoomSession, RoomState};
pub use view::ViewState;
