//! Storage metadata envelope.
//!
//! The repository only interprets `size` and `hsm_stored`; the rest of
//! what the naming authority hands back travels in `payload` untouched
//! so upstream protocol changes never force a repository migration.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Canonical file size; `None` until the upstream record is final.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Whether the backing store already holds a durable copy.
    #[serde(default)]
    pub hsm_stored: bool,
    /// Opaque upstream payload, stored verbatim.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StorageMetadata {
    pub fn new(size: Option<u64>, hsm_stored: bool) -> Self {
        Self {
            size,
            hsm_stored,
            payload: serde_json::Value::Null,
        }
    }
}

impl Default for StorageMetadata {
    fn default() -> Self {
        Self::new(None, false)
    }
}
