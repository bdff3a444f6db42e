//! Replica entries: the persisted per-replica state machine.
//!
//! Every entry keeps its mutable state behind one mutex and persists
//! transitions to its control file before mutating memory, so a failed
//! write leaves both the file and the in-memory view unchanged.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::warn;

use crate::authority::{AuthorityError, MetadataAuthority};
use crate::core::{ControlRecord, PrimaryState, ReplicaId, StorageMetadata};
use crate::events::ReplicaEvent;
use crate::fsutil;
use crate::repository::RepoShared;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("replica {id} is destroyed")]
    Destroyed { id: ReplicaId },
    #[error("illegal transition for replica {id}: {detail}")]
    IllegalTransition { id: ReplicaId, detail: String },
    #[error("corrupt metadata for replica {id}: {source}")]
    CorruptMetadata {
        id: ReplicaId,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a recovery attempt did not produce a healthy entry.
#[derive(Debug)]
pub(crate) enum RecoveryFailure {
    /// The authority has no record; the replica must be purged.
    FileNotFound,
    /// Authoritative size disagrees with the data file.
    SizeMismatch { recorded: u64, actual: u64 },
    /// The authority record carries no final size yet.
    SizeUnknown,
    /// Non-retryable authority failure.
    Failed(String),
    /// Local persistence failed while committing the recovered state.
    Io(EntryError),
}

pub(crate) enum RemoveDisposition {
    AlreadyRemoved,
    Locked,
    Removed { destroy_now: bool },
}

pub(crate) struct EntryInner {
    pub(crate) primary: Option<PrimaryState>,
    pub(crate) sticky: bool,
    pub(crate) removed: bool,
    pub(crate) destroyed: bool,
    pub(crate) bad: bool,
    /// Transfer-to-store marker; meaningful only while precious and
    /// never persisted.
    pub(crate) to_store: bool,
    pub(crate) link_count: u32,
    pub(crate) locked: bool,
    pub(crate) locked_until: Option<Instant>,
    pub(crate) created_at: SystemTime,
    pub(crate) last_access: SystemTime,
    pub(crate) metadata: Option<StorageMetadata>,
    pub(crate) metadata_loaded: bool,
}

pub struct ReplicaEntry {
    id: ReplicaId,
    shared: Arc<RepoShared>,
    inner: Mutex<EntryInner>,
}

impl ReplicaEntry {
    /// Claim a fresh id by creating its (empty) control file.
    ///
    /// `create_new` semantics make the control file the arbiter: a
    /// leftover from a previous life surfaces as `AlreadyExists`.
    pub(crate) fn create(id: ReplicaId, shared: Arc<RepoShared>) -> Result<Arc<Self>, EntryError> {
        let control = shared.layout.control_path(&id);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&control)
            .map_err(|source| EntryError::Io {
                path: control.clone(),
                source,
            })?;

        let now = SystemTime::now();
        Ok(Arc::new(Self {
            id,
            shared,
            inner: Mutex::new(EntryInner {
                primary: None,
                sticky: false,
                removed: false,
                destroyed: false,
                bad: false,
                to_store: false,
                link_count: 0,
                locked: false,
                locked_until: None,
                created_at: now,
                last_access: now,
                metadata: None,
                metadata_loaded: false,
            }),
        }))
    }

    /// Rehydrate an entry from what the inventory scan found on disk.
    pub(crate) fn from_scan(
        id: ReplicaId,
        shared: Arc<RepoShared>,
        state: Option<PrimaryState>,
        sticky: bool,
        bad: bool,
        metadata: Option<StorageMetadata>,
        last_access: SystemTime,
    ) -> Arc<Self> {
        let metadata_loaded = metadata.is_some();
        Arc::new(Self {
            id,
            shared,
            inner: Mutex::new(EntryInner {
                primary: state,
                sticky,
                removed: false,
                destroyed: false,
                bad,
                to_store: false,
                link_count: 0,
                locked: false,
                locked_until: None,
                created_at: last_access,
                last_access,
                metadata,
                metadata_loaded,
            }),
        })
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    fn lock_inner(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_path(&self) -> PathBuf {
        self.shared.layout.data_path(&self.id)
    }

    fn control_path(&self) -> PathBuf {
        self.shared.layout.control_path(&self.id)
    }

    fn metadata_path(&self) -> PathBuf {
        self.shared.layout.metadata_path(&self.id)
    }

    /// Length of the backing data file; a missing file counts as empty.
    pub fn size(&self) -> u64 {
        fs::metadata(self.data_path()).map(|m| m.len()).unwrap_or(0)
    }

    pub fn state(&self) -> Option<PrimaryState> {
        self.lock_inner().primary
    }

    pub fn is_sticky(&self) -> bool {
        self.lock_inner().sticky
    }

    pub fn is_removed(&self) -> bool {
        self.lock_inner().removed
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_inner().destroyed
    }

    pub fn is_bad(&self) -> bool {
        self.lock_inner().bad
    }

    pub fn is_sending_to_store(&self) -> bool {
        self.lock_inner().to_store
    }

    pub fn link_count(&self) -> u32 {
        self.lock_inner().link_count
    }

    pub fn created_at(&self) -> SystemTime {
        self.lock_inner().created_at
    }

    pub fn last_access(&self) -> SystemTime {
        self.lock_inner().last_access
    }

    pub fn is_locked(&self) -> bool {
        let inner = self.lock_inner();
        Self::locked_now(&inner)
    }

    fn locked_now(inner: &EntryInner) -> bool {
        if inner.locked {
            return true;
        }
        match inner.locked_until {
            Some(until) => until > Instant::now(),
            None => false,
        }
    }

    fn check_destroyed(&self, inner: &EntryInner) -> Result<(), EntryError> {
        if inner.destroyed {
            Err(EntryError::Destroyed {
                id: self.id.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn write_control(&self, record: ControlRecord) -> Result<(), EntryError> {
        let path = self.control_path();
        fsutil::atomic_write(&path, record.encode().as_bytes())
            .map_err(|source| EntryError::Io { path, source })
    }

    fn write_metadata_file(&self, meta: &StorageMetadata) -> Result<(), EntryError> {
        let bytes = serde_json::to_vec_pretty(meta).map_err(|source| EntryError::CorruptMetadata {
            id: self.id.clone(),
            source,
        })?;
        let path = self.metadata_path();
        fsutil::atomic_write(&path, &bytes).map_err(|source| EntryError::Io { path, source })
    }

    fn emit(&self, events: &[ReplicaEvent]) {
        self.shared.listeners.emit_all(events, &self.id);
    }

    // ---- transitions ----------------------------------------------------

    pub fn set_receiving_from_client(&self) -> Result<(), EntryError> {
        self.set_receiving(PrimaryState::ReceivingFromClient)
    }

    pub fn set_receiving_from_store(&self) -> Result<(), EntryError> {
        self.set_receiving(PrimaryState::ReceivingFromStore)
    }

    fn set_receiving(&self, state: PrimaryState) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if let Some(current) = inner.primary {
            return Err(EntryError::IllegalTransition {
                id: self.id.clone(),
                detail: format!("{current} -> {state}"),
            });
        }
        self.write_control(ControlRecord {
            state,
            sticky: inner.sticky,
        })?;
        inner.primary = Some(state);
        drop(inner);
        self.emit(&[ReplicaEvent::Created]);
        Ok(())
    }

    pub fn set_precious(&self, force: bool) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if inner.primary == Some(PrimaryState::Precious) {
            return Ok(());
        }
        if !force && inner.primary != Some(PrimaryState::ReceivingFromClient) {
            return Err(EntryError::IllegalTransition {
                id: self.id.clone(),
                detail: format!("{} -> precious", state_name(inner.primary)),
            });
        }
        self.write_control(ControlRecord {
            state: PrimaryState::Precious,
            sticky: inner.sticky,
        })?;
        inner.primary = Some(PrimaryState::Precious);
        drop(inner);
        self.shared.precious_add(self.size());
        self.emit(&[ReplicaEvent::Precious, ReplicaEvent::Available]);
        Ok(())
    }

    pub fn set_cached(&self, force: bool) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if inner.primary == Some(PrimaryState::Cached) {
            return Ok(());
        }
        let from = inner.primary;
        let allowed = matches!(
            from,
            Some(PrimaryState::Precious) | Some(PrimaryState::ReceivingFromStore)
        );
        if !force && !allowed {
            return Err(EntryError::IllegalTransition {
                id: self.id.clone(),
                detail: format!("{} -> cached", state_name(from)),
            });
        }
        self.write_control(ControlRecord {
            state: PrimaryState::Cached,
            sticky: inner.sticky,
        })?;
        inner.primary = Some(PrimaryState::Cached);
        inner.to_store = false;

        let mut events = Vec::with_capacity(2);
        match from {
            Some(PrimaryState::Precious) => {
                drop(inner);
                self.shared.precious_sub(self.size());
            }
            Some(PrimaryState::ReceivingFromStore) => {
                // Freshly restored replicas get a grace period before the
                // sweeper may take them, and become available before they
                // are announced as cached.
                Self::extend_lock(&mut inner, self.shared.grace_lock);
                events.push(ReplicaEvent::Available);
                drop(inner);
            }
            _ => drop(inner),
        }
        events.push(ReplicaEvent::Cached);
        self.emit(&events);
        Ok(())
    }

    pub fn set_sending_to_store(&self, sending: bool) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if inner.primary != Some(PrimaryState::Precious) {
            return Err(EntryError::IllegalTransition {
                id: self.id.clone(),
                detail: format!(
                    "to_store only applies to precious replicas, state is {}",
                    state_name(inner.primary)
                ),
            });
        }
        inner.to_store = sending;
        Ok(())
    }

    /// Idempotent: a no-op change performs no write and fires no event.
    pub fn set_sticky(&self, sticky: bool) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if inner.sticky == sticky {
            return Ok(());
        }
        if let Some(state) = inner.primary {
            self.write_control(ControlRecord { state, sticky })?;
        }
        inner.sticky = sticky;
        drop(inner);
        self.emit(&[ReplicaEvent::Sticky]);
        Ok(())
    }

    pub fn lock(&self, locked: bool) {
        self.lock_inner().locked = locked;
    }

    /// Hold the entry for at least `duration`. Deadlines only extend;
    /// a shorter request never shortens an existing one.
    pub fn lock_for(&self, duration: Duration) {
        let mut inner = self.lock_inner();
        Self::extend_lock(&mut inner, duration);
    }

    fn extend_lock(inner: &mut EntryInner, duration: Duration) {
        let until = Instant::now() + duration;
        match inner.locked_until {
            Some(existing) if existing >= until => {}
            _ => inner.locked_until = Some(until),
        }
    }

    pub fn increment_link_count(&self) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        inner.link_count += 1;
        drop(inner);
        self.emit(&[ReplicaEvent::Touched]);
        Ok(())
    }

    pub fn decrement_link_count(&self) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        inner.link_count = inner.link_count.saturating_sub(1);
        let destroy_now = inner.link_count == 0 && inner.removed;
        drop(inner);
        if destroy_now {
            self.destroy();
        }
        Ok(())
    }

    /// Make the data file exist and record an access.
    pub fn touch(&self) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        let path = self.data_path();
        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| EntryError::Io {
                path: path.clone(),
                source,
            })?;
        let now = SystemTime::now();
        file.set_modified(now)
            .map_err(|source| EntryError::Io { path, source })?;
        inner.last_access = now;
        Ok(())
    }

    pub fn set_bad(&self, bad: bool) {
        self.lock_inner().bad = bad;
    }

    /// Storage metadata, loaded from disk on first use.
    pub fn storage_metadata(&self) -> Result<Option<StorageMetadata>, EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        if !inner.metadata_loaded {
            inner.metadata = self.read_metadata_file()?;
            inner.metadata_loaded = true;
        }
        Ok(inner.metadata.clone())
    }

    pub fn set_storage_metadata(&self, metadata: StorageMetadata) -> Result<(), EntryError> {
        let mut inner = self.lock_inner();
        self.check_destroyed(&inner)?;
        self.write_metadata_file(&metadata)?;
        inner.metadata = Some(metadata);
        inner.metadata_loaded = true;
        Ok(())
    }

    fn read_metadata_file(&self) -> Result<Option<StorageMetadata>, EntryError> {
        let path = self.metadata_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(EntryError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| EntryError::CorruptMetadata {
                id: self.id.clone(),
                source,
            })
    }

    // ---- removal and destruction ----------------------------------------

    pub(crate) fn mark_removed(&self) -> RemoveDisposition {
        let mut inner = self.lock_inner();
        if inner.destroyed || inner.removed {
            return RemoveDisposition::AlreadyRemoved;
        }
        if Self::locked_now(&inner) {
            return RemoveDisposition::Locked;
        }
        inner.removed = true;
        RemoveDisposition::Removed {
            destroy_now: inner.link_count == 0,
        }
    }

    /// Delete every on-disk artifact, release the space, and retire the
    /// entry. Idempotent; file deletion failures are logged, not fatal.
    pub(crate) fn destroy(&self) {
        let mut inner = self.lock_inner();
        if inner.destroyed {
            return;
        }

        remove_artifact(&self.control_path());
        remove_artifact(&self.metadata_path());

        let data = self.data_path();
        if let Ok(meta) = fs::metadata(&data) {
            let size = meta.len();
            self.shared.monitor.free(size);
            if inner.primary == Some(PrimaryState::Precious) {
                self.shared.precious_sub(size);
            }
            remove_artifact(&data);
        }

        inner.removed = true;
        inner.destroyed = true;
        drop(inner);

        self.shared.forget_removed(&self.id);
        self.emit(&[ReplicaEvent::Destroyed]);
    }

    // ---- recovery --------------------------------------------------------

    /// Ask the authority for the canonical record and commit it.
    ///
    /// Timeouts are retried until the authority answers; every other
    /// outcome is classified for the inventory's repair policy. Does
    /// not touch the precious-space counter; the caller accounts for
    /// the entry when admitting it.
    pub(crate) fn recover(
        &self,
        authority: &dyn MetadataAuthority,
        retry: Duration,
    ) -> Result<(), RecoveryFailure> {
        let metadata = loop {
            match authority.storage_metadata(&self.id) {
                Ok(metadata) => break metadata,
                Err(AuthorityError::Timeout) => {
                    warn!(id = %self.id, "authority timed out, retrying recovery");
                    std::thread::sleep(retry);
                }
                Err(AuthorityError::NotFound) => return Err(RecoveryFailure::FileNotFound),
                Err(AuthorityError::Failed(reason)) => {
                    return Err(RecoveryFailure::Failed(reason));
                }
            }
        };

        let actual = self.size();
        let recorded = match metadata.size {
            Some(size) => size,
            None => return Err(RecoveryFailure::SizeUnknown),
        };
        if recorded != actual {
            return Err(RecoveryFailure::SizeMismatch { recorded, actual });
        }

        let state = if metadata.hsm_stored {
            PrimaryState::Cached
        } else {
            PrimaryState::Precious
        };

        let mut inner = self.lock_inner();
        self.write_metadata_file(&metadata)
            .map_err(RecoveryFailure::Io)?;
        self.write_control(ControlRecord {
            state,
            sticky: inner.sticky,
        })
        .map_err(RecoveryFailure::Io)?;
        inner.primary = Some(state);
        inner.metadata = Some(metadata);
        inner.metadata_loaded = true;
        Ok(())
    }
}

fn state_name(state: Option<PrimaryState>) -> &'static str {
    state.map(PrimaryState::as_str).unwrap_or("none")
}

fn remove_artifact(path: &std::path::Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove replica artifact");
    }
}

impl fmt::Display for ReplicaEntry {
    /// Compact operator-facing status line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        let primary = match inner.primary {
            Some(PrimaryState::Cached) => 'C',
            Some(PrimaryState::Precious) => 'P',
            Some(PrimaryState::ReceivingFromClient) => 'c',
            Some(PrimaryState::ReceivingFromStore) => 's',
            None => '-',
        };
        let lock = if inner.locked {
            "L(*)".to_string()
        } else {
            match inner.locked_until {
                Some(until) => {
                    let left = until.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        "-".to_string()
                    } else {
                        format!("L({}ms)", left.as_millis())
                    }
                }
                None => "-".to_string(),
            }
        };
        write!(
            f,
            "<{}{}{}{}{}> links={} size={} {}",
            primary,
            if inner.sticky { 'S' } else { '-' },
            if inner.to_store { 'T' } else { '-' },
            if inner.removed { 'R' } else { '-' },
            if inner.bad { 'B' } else { '-' },
            inner.link_count,
            fs::metadata(self.shared.layout.data_path(&self.id))
                .map(|m| m.len())
                .unwrap_or(0),
            lock,
        )
    }
}
