use thiserror::Error;

use crate::authority::AuthorityError;
use crate::config::ConfigError;
use crate::entry::EntryError;
use crate::inventory::InventoryError;
use crate::repository::RepositoryError;
use crate::space::SpaceError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical
/// per-module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}
