//! The pool repository: replica maps, reservations, space delegation.
//!
//! The repository-wide lock guards only map membership. Entry state has
//! its own per-entry mutex and space allocation never runs under the
//! map lock, so a blocked allocation cannot stall lookups.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::core::{PrimaryState, ReplicaId};
use crate::entry::{EntryError, RemoveDisposition, ReplicaEntry};
use crate::events::{ListenerSet, ReplicaEvent, RepositoryListener};
use crate::fsutil;
use crate::paths::PoolLayout;
use crate::space::{SpaceError, SpaceMonitor, SpaceRequestListener};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("replica {id} already exists")]
    AlreadyExists { id: ReplicaId },
    #[error("replica {id} not found")]
    NotFound { id: ReplicaId },
    #[error("replica {id} is already removed or destroyed")]
    AlreadyRemoved { id: ReplicaId },
    #[error("cannot release {requested} reserved bytes, only {reserved} are reserved")]
    ReservationUnderflow { requested: u64, reserved: u64 },
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// State shared between the repository and its entries, so an entry can
/// finish its own destruction without going back through the facade.
pub(crate) struct RepoShared {
    pub(crate) layout: PoolLayout,
    pub(crate) monitor: Arc<dyn SpaceMonitor>,
    pub(crate) listeners: ListenerSet,
    /// Running total of precious bytes; kept equal to the sum of the
    /// sizes of precious entries.
    pub(crate) precious: Mutex<u64>,
    /// Removed but not yet destroyed entries (links still open).
    pub(crate) removed: Mutex<HashMap<ReplicaId, Arc<ReplicaEntry>>>,
    pub(crate) grace_lock: Duration,
    pub(crate) authority_retry: Duration,
}

impl RepoShared {
    pub(crate) fn precious_add(&self, bytes: u64) {
        *self.precious.lock().unwrap_or_else(PoisonError::into_inner) += bytes;
    }

    pub(crate) fn precious_sub(&self, bytes: u64) {
        let mut precious = self.precious.lock().unwrap_or_else(PoisonError::into_inner);
        if bytes > *precious {
            warn!(
                bytes,
                precious = *precious,
                "precious accounting underflow, clamping to zero"
            );
            *precious = 0;
        } else {
            *precious -= bytes;
        }
    }

    pub(crate) fn precious_total(&self) -> u64 {
        *self.precious.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn forget_removed(&self, id: &ReplicaId) {
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

struct NeedSpaceForwarder {
    shared: Weak<RepoShared>,
}

impl SpaceRequestListener for NeedSpaceForwarder {
    fn need_space(&self, requested: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.need_space(requested);
        }
    }
}

pub struct Repository {
    pub(crate) shared: Arc<RepoShared>,
    pub(crate) active: Mutex<HashMap<ReplicaId, Arc<ReplicaEntry>>>,
    /// Durable reserved-space counter, mirrored to disk on every change.
    pub(crate) reserved: Mutex<u64>,
    pub(crate) inventory_running: AtomicBool,
    /// Bytes the last inventory allocated from the monitor; released
    /// before a rescan.
    pub(crate) inventoried: Mutex<u64>,
}

impl Repository {
    /// Open (or initialize) the pool tree and wire up the monitor.
    pub fn open(
        config: &PoolConfig,
        monitor: Arc<dyn SpaceMonitor>,
    ) -> Result<Self, RepositoryError> {
        let layout = PoolLayout::new(&config.base_dir);
        ensure_layout(&layout)?;
        monitor.set_total(config.total_space)?;

        let shared = Arc::new(RepoShared {
            layout,
            monitor,
            listeners: ListenerSet::default(),
            precious: Mutex::new(0),
            removed: Mutex::new(HashMap::new()),
            grace_lock: Duration::from_millis(config.grace_lock_ms),
            authority_retry: Duration::from_millis(config.authority_retry_ms),
        });
        shared.monitor.add_listener(Arc::new(NeedSpaceForwarder {
            shared: Arc::downgrade(&shared),
        }));

        let repository = Self {
            shared,
            active: Mutex::new(HashMap::new()),
            reserved: Mutex::new(0),
            inventory_running: AtomicBool::new(false),
            inventoried: Mutex::new(0),
        };
        repository.init_reserved_space()?;
        Ok(repository)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<ReplicaId, Arc<ReplicaEntry>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reserved(&self) -> MutexGuard<'_, u64> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- entry lifecycle -------------------------------------------------

    /// Register a new replica. The control file on disk is the arbiter:
    /// a stale leftover from a previous life also counts as existing.
    pub fn create(&self, id: ReplicaId) -> Result<Arc<ReplicaEntry>, RepositoryError> {
        if self.lookup(&id).is_some() {
            return Err(RepositoryError::AlreadyExists { id });
        }
        let entry = match ReplicaEntry::create(id.clone(), self.shared.clone()) {
            Ok(entry) => entry,
            Err(EntryError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RepositoryError::AlreadyExists { id });
            }
            Err(err) => return Err(err.into()),
        };
        self.lock_active().insert(id, entry.clone());
        Ok(entry)
    }

    fn lookup(&self, id: &ReplicaId) -> Option<Arc<ReplicaEntry>> {
        if let Some(entry) = self.lock_active().get(id) {
            return Some(entry.clone());
        }
        self.shared
            .removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &ReplicaId) -> Result<Arc<ReplicaEntry>, RepositoryError> {
        self.lock_active()
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound { id: id.clone() })
    }

    pub fn get_including_removed(
        &self,
        id: &ReplicaId,
    ) -> Result<Arc<ReplicaEntry>, RepositoryError> {
        self.lookup(id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.clone() })
    }

    pub fn contains(&self, id: &ReplicaId) -> bool {
        self.lock_active().contains_key(id)
    }

    /// Mark an entry removed.
    ///
    /// Returns `Ok(false)` when the entry is locked and cannot be
    /// removed right now. When the last link is already gone the entry
    /// is destroyed immediately.
    pub fn remove(&self, entry: &Arc<ReplicaEntry>) -> Result<bool, RepositoryError> {
        let id = entry.id().clone();
        match entry.mark_removed() {
            RemoveDisposition::AlreadyRemoved => Err(RepositoryError::AlreadyRemoved { id }),
            RemoveDisposition::Locked => Ok(false),
            RemoveDisposition::Removed { destroy_now } => {
                // Insert before removing so the entry stays reachable
                // through one of the maps at every point of the move.
                self.shared
                    .removed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), entry.clone());
                self.lock_active().remove(&id);
                self.shared.listeners.emit(ReplicaEvent::Removed, &id);
                if destroy_now {
                    entry.destroy();
                }
                Ok(true)
            }
        }
    }

    // ---- reserved-space sub-pool ----------------------------------------

    fn init_reserved_space(&self) -> Result<(), RepositoryError> {
        let path = self.shared.layout.reserved_space_path();
        let value = match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "unreadable reserved-space counter, resetting to zero"
                    );
                    self.persist_reserved(0)?;
                    0
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(source) => return Err(RepositoryError::Io { path, source }),
        };
        *self.lock_reserved() = value;
        if value > 0 {
            info!(reserved = value, "restored reserved-space counter");
        }
        Ok(())
    }

    fn persist_reserved(&self, value: u64) -> Result<(), RepositoryError> {
        let path = self.shared.layout.reserved_space_path();
        fsutil::atomic_write(&path, format!("{value}\n").as_bytes())
            .map_err(|source| RepositoryError::Io { path, source })
    }

    /// Take `bytes` from the pool and add them to the reservation
    /// counter. If the counter cannot be persisted the allocation is
    /// returned and nothing changes.
    pub fn reserve_space(
        &self,
        bytes: u64,
        timeout: Option<Duration>,
    ) -> Result<(), RepositoryError> {
        match timeout {
            Some(timeout) => self.shared.monitor.allocate_within(bytes, timeout)?,
            None => self.shared.monitor.allocate(bytes)?,
        }
        let mut reserved = self.lock_reserved();
        let next = *reserved + bytes;
        if let Err(err) = self.persist_reserved(next) {
            drop(reserved);
            self.shared.monitor.free(bytes);
            return Err(err);
        }
        *reserved = next;
        Ok(())
    }

    /// Return `bytes` of reservation to the free pool.
    pub fn free_reserved_space(&self, bytes: u64) -> Result<(), RepositoryError> {
        let mut reserved = self.lock_reserved();
        if bytes > *reserved {
            return Err(RepositoryError::ReservationUnderflow {
                requested: bytes,
                reserved: *reserved,
            });
        }
        let next = *reserved - bytes;
        self.persist_reserved(next)?;
        *reserved = next;
        drop(reserved);
        self.shared.monitor.free(bytes);
        Ok(())
    }

    /// Convert `bytes` of reservation into regular usage; the space
    /// stays allocated, now backing an actual replica.
    pub fn apply_reserved_space(&self, bytes: u64) -> Result<(), RepositoryError> {
        let mut reserved = self.lock_reserved();
        if bytes > *reserved {
            return Err(RepositoryError::ReservationUnderflow {
                requested: bytes,
                reserved: *reserved,
            });
        }
        let next = *reserved - bytes;
        self.persist_reserved(next)?;
        *reserved = next;
        Ok(())
    }

    // ---- space delegation ------------------------------------------------

    pub fn allocate(&self, bytes: u64) -> Result<(), RepositoryError> {
        Ok(self.shared.monitor.allocate(bytes)?)
    }

    pub fn allocate_within(&self, bytes: u64, timeout: Duration) -> Result<(), RepositoryError> {
        Ok(self.shared.monitor.allocate_within(bytes, timeout)?)
    }

    pub fn free(&self, bytes: u64) {
        self.shared.monitor.free(bytes);
    }

    pub fn set_total_space(&self, bytes: u64) -> Result<(), RepositoryError> {
        Ok(self.shared.monitor.set_total(bytes)?)
    }

    pub fn total_space(&self) -> u64 {
        self.shared.monitor.total()
    }

    pub fn free_space(&self) -> u64 {
        self.shared.monitor.free_space()
    }

    pub fn precious_space(&self) -> u64 {
        self.shared.precious_total()
    }

    pub fn reserved_space(&self) -> u64 {
        *self.lock_reserved()
    }

    // ---- iteration and observation ---------------------------------------

    /// Snapshot of every known replica id, removed ones included.
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<_> = self.lock_active().keys().cloned().collect();
        ids.extend(
            self.shared
                .removed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        ids
    }

    /// Snapshot of committed (cached or precious) replica ids.
    pub fn active_ids(&self) -> Vec<ReplicaId> {
        self.lock_active()
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.state(),
                    Some(PrimaryState::Cached) | Some(PrimaryState::Precious)
                )
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn RepositoryListener>) {
        self.shared.listeners.add(listener);
    }
}

fn ensure_layout(layout: &PoolLayout) -> Result<(), RepositoryError> {
    for dir in [layout.data_dir(), layout.control_dir()] {
        fsutil::ensure_dir(&dir).map_err(|source| RepositoryError::Io { path: dir, source })?;
    }
    Ok(())
}
