//! # parley-store
//!
//! Substrate seams for the Parley room protocol: the multi-writer
//! replicated log, rendezvous discovery, and the pairing coordinator are
//! external collaborators, reached through the traits in [`traits`]. The
//! [`memory`] module provides a complete in-process substrate that backs
//! local rooms and the test suite; it is a stand-in spine, not a
//! conflict-resolution engine.

pub mod memory;
pub mod traits;

mod error;

pub use error::StoreError;
pub use memory::{MemoryBus, MemorySubstrate};
pub use traits::{Candidate, Rendezvous, ReplicatedLog, RoomSubstrate, Substrate};
