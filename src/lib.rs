#![forbid(unsafe_code)]

pub mod authority;
pub mod config;
pub mod core;
pub mod entry;
pub mod error;
pub mod events;
mod fsutil;
pub mod inventory;
pub mod paths;
pub mod repository;
pub mod space;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at the crate root for convenience.
pub use crate::authority::{AuthorityError, MetadataAuthority};
pub use crate::config::PoolConfig;
pub use crate::core::{ControlRecord, PrimaryState, ReplicaId, StorageMetadata};
pub use crate::entry::{EntryError, ReplicaEntry};
pub use crate::events::{RepositoryListener, ReplicaEvent};
pub use crate::inventory::{InventoryError, InventoryOptions, InventoryReport};
pub use crate::paths::PoolLayout;
pub use crate::repository::{Repository, RepositoryError};
pub use crate::space::{FairQueueAllocation, SpaceError, SpaceMonitor, SpaceRequestListener};
