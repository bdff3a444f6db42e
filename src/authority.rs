//! Naming-authority seam.
//!
//! The repository never talks to the authority except during recovery;
//! the trait keeps that dependency injectable and trivially mockable.

use thiserror::Error;

use crate::core::{ReplicaId, StorageMetadata};

#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority did not answer in time. Retried indefinitely.
    #[error("authority request timed out")]
    Timeout,
    /// The authority has no record of this replica.
    #[error("replica unknown to the authority")]
    NotFound,
    /// Any other authority-side failure.
    #[error("authority request failed: {0}")]
    Failed(String),
}

/// Source of truth for per-replica storage metadata.
pub trait MetadataAuthority: Send + Sync {
    fn storage_metadata(&self, id: &ReplicaId) -> Result<StorageMetadata, AuthorityError>;
}
