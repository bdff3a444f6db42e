//! Persisted replica state and the control file text format.
//!
//! Each replica owns one control file. Line one carries the primary
//! state token, an optional second line carries `sticky`. The format is
//! deliberately tiny so a half-finished write is detectable as a parse
//! failure rather than silently misread.

use std::fmt;

use thiserror::Error;

/// The single primary state a replica holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaryState {
    /// Upload from a client is in progress.
    ReceivingFromClient,
    /// Restore from the backing store is in progress.
    ReceivingFromStore,
    /// Committed; a durable copy exists in the backing store.
    Cached,
    /// Committed; this pool holds the only copy.
    Precious,
}

impl PrimaryState {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimaryState::ReceivingFromClient => "receiving.client",
            PrimaryState::ReceivingFromStore => "receiving.store",
            PrimaryState::Cached => "cached",
            PrimaryState::Precious => "precious",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "receiving.client" => Some(PrimaryState::ReceivingFromClient),
            "receiving.store" => Some(PrimaryState::ReceivingFromStore),
            "cached" => Some(PrimaryState::Cached),
            "precious" => Some(PrimaryState::Precious),
            _ => None,
        }
    }

    /// Transient states must never be observed across a restart.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            PrimaryState::ReceivingFromClient | PrimaryState::ReceivingFromStore
        )
    }
}

impl fmt::Display for PrimaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a control file says: the primary state plus the sticky flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub state: PrimaryState,
    pub sticky: bool,
}

#[derive(Debug, Error)]
pub enum ControlParseError {
    #[error("control file is empty")]
    Empty,
    #[error("unknown state token {token:?}")]
    UnknownState { token: String },
    #[error("unexpected trailing line {line:?}")]
    TrailingGarbage { line: String },
}

impl ControlRecord {
    /// Render the control file contents.
    pub fn encode(&self) -> String {
        if self.sticky {
            format!("{}\nsticky\n", self.state)
        } else {
            format!("{}\n", self.state)
        }
    }

    /// Parse control file contents.
    ///
    /// Tolerates surrounding whitespace per line; anything after an
    /// optional `sticky` line is corruption.
    pub fn parse(contents: &str) -> Result<Self, ControlParseError> {
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());

        let first = lines.next().ok_or(ControlParseError::Empty)?;
        let state = PrimaryState::parse(first).ok_or_else(|| ControlParseError::UnknownState {
            token: first.to_string(),
        })?;

        let sticky = match lines.next() {
            None => false,
            Some("sticky") => true,
            Some(other) => {
                return Err(ControlParseError::TrailingGarbage {
                    line: other.to_string(),
                });
            }
        };

        if let Some(extra) = lines.next() {
            return Err(ControlParseError::TrailingGarbage {
                line: extra.to_string(),
            });
        }

        Ok(Self { state, sticky })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_roundtrip_all_states() {
        for state in [
            PrimaryState::ReceivingFromClient,
            PrimaryState::ReceivingFromStore,
            PrimaryState::Cached,
            PrimaryState::Precious,
        ] {
            for sticky in [false, true] {
                let record = ControlRecord { state, sticky };
                let parsed = ControlRecord::parse(&record.encode()).expect("roundtrip");
                assert_eq!(parsed, record);
            }
        }
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let parsed = ControlRecord::parse("  precious  \n\n  sticky \n").expect("parse");
        assert_eq!(parsed.state, PrimaryState::Precious);
        assert!(parsed.sticky);
    }

    #[test]
    fn parse_rejects_empty_and_unknown() {
        assert!(matches!(
            ControlRecord::parse(""),
            Err(ControlParseError::Empty)
        ));
        assert!(matches!(
            ControlRecord::parse("pinned\n"),
            Err(ControlParseError::UnknownState { .. })
        ));
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        assert!(matches!(
            ControlRecord::parse("cached\nsticky\nextra\n"),
            Err(ControlParseError::TrailingGarbage { .. })
        ));
        assert!(matches!(
            ControlRecord::parse("cached\nnot-sticky\n"),
            Err(ControlParseError::TrailingGarbage { .. })
        ));
    }

    #[test]
    fn transient_states() {
        assert!(PrimaryState::ReceivingFromClient.is_transient());
        assert!(PrimaryState::ReceivingFromStore.is_transient());
        assert!(!PrimaryState::Cached.is_transient());
        assert!(!PrimaryState::Precious.is_transient());
    }
}
