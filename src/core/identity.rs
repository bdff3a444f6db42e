//! Replica identity.
//!
//! A `ReplicaId` names one replica and doubles as its file name under
//! both the data and control directories.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of hex characters in a replica id.
pub const REPLICA_ID_LEN: usize = 24;

/// Replica identifier - exactly 24 hex characters, canonically lowercase.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

#[derive(Debug, Error)]
#[error("invalid replica id {raw:?}: {reason}")]
pub struct InvalidReplicaId {
    pub raw: String,
    pub reason: String,
}

impl ReplicaId {
    /// Parse and validate a replica id.
    ///
    /// Uppercase hex is accepted and canonicalized to lowercase.
    pub fn parse(s: &str) -> Result<Self, InvalidReplicaId> {
        if s.len() != REPLICA_ID_LEN {
            return Err(InvalidReplicaId {
                raw: s.to_string(),
                reason: format!("expected {REPLICA_ID_LEN} characters, got {}", s.len()),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidReplicaId {
                raw: s.to_string(),
                reason: "contains non-hex character".into(),
            });
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = InvalidReplicaId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_canonicalizes_to_lowercase() {
        let id = ReplicaId::parse("000100000000000000001060").expect("valid id");
        assert_eq!(id.as_str(), "000100000000000000001060");

        let upper = ReplicaId::parse("000100000000000000001ABC").expect("valid id");
        assert_eq!(upper.as_str(), "000100000000000000001abc");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(ReplicaId::parse("0001").is_err());
        assert!(ReplicaId::parse("").is_err());
        assert!(ReplicaId::parse("0001000000000000000010601").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        let err = ReplicaId::parse("00010000000000000000106z").unwrap_err();
        assert!(err.reason.contains("non-hex"));
    }

    #[test]
    fn display_matches_canonical_form() {
        let id = ReplicaId::parse("FFFF00000000000000001060").expect("valid id");
        assert_eq!(id.to_string(), "ffff00000000000000001060");
    }
}
