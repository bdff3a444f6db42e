//! Domain types: replica identity, persisted state, storage metadata.

pub mod identity;
pub mod metadata;
pub mod state;

pub use identity::{InvalidReplicaId, ReplicaId};
pub use metadata::StorageMetadata;
pub use state::{ControlParseError, ControlRecord, PrimaryState};
