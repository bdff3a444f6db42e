//! Pool directory layout helpers.

use std::path::{Path, PathBuf};

use crate::core::ReplicaId;

/// File name of the durable reserved-space counter, under `control/`.
pub const RESERVED_SPACE_FILE: &str = "reserved_space";

/// Suffix distinguishing metadata files from control files.
pub const METADATA_SUFFIX: &str = ".meta";

/// Resolved paths for one pool's on-disk tree.
///
/// ```text
/// <base>/data/<id>            replica bytes
/// <base>/control/<id>         state text file
/// <base>/control/<id>.meta    storage metadata (JSON)
/// <base>/control/reserved_space
/// ```
#[derive(Clone, Debug)]
pub struct PoolLayout {
    base: PathBuf,
}

impl PoolLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.base.join("control")
    }

    pub fn data_path(&self, id: &ReplicaId) -> PathBuf {
        self.data_dir().join(id.as_str())
    }

    pub fn control_path(&self, id: &ReplicaId) -> PathBuf {
        self.control_dir().join(id.as_str())
    }

    pub fn metadata_path(&self, id: &ReplicaId) -> PathBuf {
        self.control_dir()
            .join(format!("{}{}", id, METADATA_SUFFIX))
    }

    pub fn reserved_space_path(&self) -> PathBuf {
        self.control_dir().join(RESERVED_SPACE_FILE)
    }
}
