//! Startup inventory: rebuild the in-memory view from the pool tree,
//! repair what policy allows, and fail hard on what it does not.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authority::MetadataAuthority;
use crate::core::{ControlRecord, PrimaryState, ReplicaId, StorageMetadata};
use crate::entry::{EntryError, RecoveryFailure, ReplicaEntry};
use crate::events::ReplicaEvent;
use crate::paths::{PoolLayout, METADATA_SUFFIX, RESERVED_SPACE_FILE};
use crate::repository::Repository;

/// How long the final bulk allocation may wait before the inventory
/// concludes the accounting cannot be satisfied.
const COMMIT_ALLOCATE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct InventoryOptions {
    /// Needed for any repair; without it a violation is a hard failure.
    pub authority: Option<Arc<dyn MetadataAuthority>>,
    pub allow_recovery: bool,
    /// Keep unrepairable replicas flagged bad instead of failing.
    pub allow_recover_anyway: bool,
    /// Permit LRU eviction when committed space exceeds capacity.
    pub allow_space_recovery: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InventoryReport {
    /// Data files examined.
    pub scanned: usize,
    /// Entries committed to the active map.
    pub admitted: usize,
    /// Control or metadata files without a data file, deleted.
    pub orphans_removed: usize,
    /// Entries whose state was rebuilt from the authority.
    pub recovered: usize,
    /// Entries admitted with the bad flag because repair failed.
    pub kept_bad: usize,
    /// Replicas deleted because no healthy state could be established.
    pub purged: usize,
    /// Replicas evicted to bring committed space within capacity.
    pub evicted: usize,
    pub committed: u64,
    pub precious: u64,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory is already running")]
    AlreadyRunning,
    #[error("replica {id} is inconsistent on disk: {detail}")]
    InconsistentOnDisk { id: ReplicaId, detail: String },
    #[error("committed space {committed} exceeds pool capacity {total}")]
    CapacityExceeded { committed: u64, total: u64 },
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct Candidate {
    entry: Arc<ReplicaEntry>,
    size: u64,
    last_access: SystemTime,
}

impl Candidate {
    fn is_precious(&self) -> bool {
        self.entry.state() == Some(PrimaryState::Precious)
    }
}

/// What the scan found on disk for one data file.
struct ScanRecord {
    id: ReplicaId,
    size: u64,
    last_access: SystemTime,
    control: Option<ControlRecord>,
    metadata: Option<StorageMetadata>,
    violation: Option<String>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Repository {
    /// Scan the pool tree and rebuild the repository state.
    ///
    /// Single-flight: a concurrent call fails with `AlreadyRunning`. A
    /// later sequential call starts from scratch, dropping whatever the
    /// previous run established.
    pub fn run_inventory(&self, opts: &InventoryOptions) -> Result<InventoryReport, InventoryError> {
        if self
            .inventory_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(InventoryError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.inventory_running);

        self.reset_previous_inventory();

        let layout = self.shared.layout.clone();
        let mut report = InventoryReport::default();

        info!(base = %layout.base_dir().display(), "inventory started");
        self.control_crosscheck(&layout, &mut report)?;

        let mut candidates = self.collect_candidates(&layout, opts, &mut report)?;

        // Oldest access first; ids break ties so the order is stable.
        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.entry.id().cmp(b.entry.id()))
        });

        let mut committed: u64 = self.reserved_space()
            + candidates.iter().map(|c| c.size).sum::<u64>();
        let total = self.total_space();

        if committed > total {
            candidates = self.repair_overbooking(candidates, &mut committed, total, opts, &mut report)?;
        }

        // Claim the accounted space before exposing any entry.
        if let Err(err) = self
            .shared
            .monitor
            .allocate_within(committed, COMMIT_ALLOCATE_TIMEOUT)
        {
            error!(committed, total, error = %err, "inventory could not allocate committed space");
            return Err(InventoryError::CapacityExceeded { committed, total });
        }
        *self
            .inventoried
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = committed;

        let mut precious: u64 = 0;
        {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for candidate in &candidates {
                if candidate.is_precious() {
                    precious += candidate.size;
                }
                active.insert(candidate.entry.id().clone(), candidate.entry.clone());
            }
        }
        self.shared.precious_add(precious);
        for candidate in &candidates {
            self.shared
                .listeners
                .emit(ReplicaEvent::Scanned, candidate.entry.id());
        }

        report.admitted = candidates.len();
        report.committed = committed;
        report.precious = precious;
        info!(
            scanned = report.scanned,
            admitted = report.admitted,
            orphans = report.orphans_removed,
            recovered = report.recovered,
            kept_bad = report.kept_bad,
            purged = report.purged,
            evicted = report.evicted,
            committed = report.committed,
            precious = report.precious,
            "inventory finished"
        );
        Ok(report)
    }

    /// Drop everything a previous run established so the rescan starts
    /// from a clean slate.
    fn reset_previous_inventory(&self) {
        let previous = {
            let mut inventoried = self
                .inventoried
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *inventoried)
        };
        if previous > 0 {
            self.shared.monitor.free(previous);
        }
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared
            .removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let mut precious = self
            .shared
            .precious
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *precious = 0;
    }

    /// Delete control-side files that no longer describe a data file,
    /// plus leftovers from interrupted atomic writes.
    fn control_crosscheck(
        &self,
        layout: &PoolLayout,
        report: &mut InventoryReport,
    ) -> Result<(), InventoryError> {
        let control_dir = layout.control_dir();
        let entries = fs::read_dir(&control_dir).map_err(|source| InventoryError::Io {
            path: control_dir.clone(),
            source,
        })?;
        for dir_entry in entries {
            let dir_entry = dir_entry.map_err(|source| InventoryError::Io {
                path: control_dir.clone(),
                source,
            })?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name == RESERVED_SPACE_FILE {
                continue;
            }
            if name.starts_with(".tmp") {
                debug!(file = %name, "sweeping stale temp file");
                remove_file_logged(&dir_entry.path());
                continue;
            }
            let stem = name.strip_suffix(METADATA_SUFFIX).unwrap_or(&name);
            match ReplicaId::parse(stem) {
                Ok(id) => {
                    if !layout.data_path(&id).exists() {
                        warn!(%id, file = %name, "removing orphaned control file");
                        remove_file_logged(&dir_entry.path());
                        report.orphans_removed += 1;
                    }
                }
                Err(_) => {
                    warn!(file = %name, "unrecognized file in control directory, skipping");
                }
            }
        }
        Ok(())
    }

    fn collect_candidates(
        &self,
        layout: &PoolLayout,
        opts: &InventoryOptions,
        report: &mut InventoryReport,
    ) -> Result<Vec<Candidate>, InventoryError> {
        let data_dir = layout.data_dir();
        let entries = fs::read_dir(&data_dir).map_err(|source| InventoryError::Io {
            path: data_dir.clone(),
            source,
        })?;

        let mut candidates = Vec::new();
        for dir_entry in entries {
            let dir_entry = dir_entry.map_err(|source| InventoryError::Io {
                path: data_dir.clone(),
                source,
            })?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let id = match ReplicaId::parse(&name) {
                Ok(id) => id,
                Err(_) => {
                    warn!(file = %name, "unrecognized file in data directory, skipping");
                    continue;
                }
            };
            report.scanned += 1;

            let record = self.scan_one(layout, id)?;
            if let Some(candidate) = self.admit_or_recover(record, opts, report)? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    fn scan_one(&self, layout: &PoolLayout, id: ReplicaId) -> Result<ScanRecord, InventoryError> {
        let data_path = layout.data_path(&id);
        let meta = fs::metadata(&data_path).map_err(|source| InventoryError::Io {
            path: data_path,
            source,
        })?;
        let size = meta.len();
        let last_access = meta.modified().unwrap_or_else(|_| SystemTime::now());

        let mut violation = None;

        let control = match fs::read_to_string(layout.control_path(&id)) {
            Ok(text) => match ControlRecord::parse(&text) {
                Ok(record) => {
                    if record.state.is_transient() {
                        violation.get_or_insert(format!(
                            "transient persisted state {}",
                            record.state
                        ));
                    }
                    Some(record)
                }
                Err(err) => {
                    violation.get_or_insert(format!("corrupt control file: {err}"));
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                violation.get_or_insert("data file without control file".to_string());
                None
            }
            Err(err) => {
                violation.get_or_insert(format!("unreadable control file: {err}"));
                None
            }
        };

        let metadata = match fs::read(layout.metadata_path(&id)) {
            Ok(bytes) => match serde_json::from_slice::<StorageMetadata>(&bytes) {
                Ok(metadata) => {
                    if let Some(recorded) = metadata.size
                        && recorded != size
                    {
                        violation.get_or_insert(format!(
                            "recorded size {recorded} does not match data length {size}"
                        ));
                    }
                    Some(metadata)
                }
                Err(err) => {
                    violation.get_or_insert(format!("corrupt metadata file: {err}"));
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                violation.get_or_insert("missing metadata file".to_string());
                None
            }
            Err(err) => {
                violation.get_or_insert(format!("unreadable metadata file: {err}"));
                None
            }
        };

        Ok(ScanRecord {
            id,
            size,
            last_access,
            control,
            metadata,
            violation,
        })
    }

    /// Turn one scan record into an admitted candidate, a repair, a
    /// purge, or a hard failure, per the recovery policy.
    fn admit_or_recover(
        &self,
        mut record: ScanRecord,
        opts: &InventoryOptions,
        report: &mut InventoryReport,
    ) -> Result<Option<Candidate>, InventoryError> {
        let persisted = record.control.map(|c| c.state);
        let sticky = record.control.map(|c| c.sticky).unwrap_or(false);

        let Some(detail) = record.violation.take() else {
            let entry = ReplicaEntry::from_scan(
                record.id,
                self.shared.clone(),
                persisted,
                sticky,
                false,
                record.metadata,
                record.last_access,
            );
            return Ok(Some(Candidate {
                entry,
                size: record.size,
                last_access: record.last_access,
            }));
        };

        let authority = match (&opts.authority, opts.allow_recovery) {
            (Some(authority), true) => authority.as_ref(),
            _ => {
                return Err(InventoryError::InconsistentOnDisk {
                    id: record.id,
                    detail,
                });
            }
        };

        info!(id = %record.id, %detail, "recovering replica");
        let entry = ReplicaEntry::from_scan(
            record.id.clone(),
            self.shared.clone(),
            persisted,
            sticky,
            false,
            record.metadata.clone(),
            record.last_access,
        );

        match entry.recover(authority, self.shared.authority_retry) {
            Ok(()) => {
                report.recovered += 1;
                Ok(Some(Candidate {
                    size: entry.size(),
                    last_access: record.last_access,
                    entry,
                }))
            }
            Err(RecoveryFailure::FileNotFound) => {
                warn!(id = %record.id, "authority has no record, purging replica");
                self.purge_artifacts(&record.id);
                report.purged += 1;
                Ok(None)
            }
            Err(RecoveryFailure::SizeMismatch { recorded, actual }) => {
                // A committed replica with the wrong length has a good
                // copy elsewhere; throwing it away is safe.
                let committed_before = matches!(
                    persisted,
                    Some(PrimaryState::Cached) | Some(PrimaryState::ReceivingFromStore)
                );
                if committed_before {
                    warn!(
                        id = %record.id,
                        recorded, actual,
                        "size mismatch on committed replica, purging"
                    );
                    self.purge_artifacts(&record.id);
                    report.purged += 1;
                    Ok(None)
                } else {
                    self.keep_bad_or_fail(
                        record,
                        opts,
                        report,
                        format!("size mismatch: recorded {recorded}, actual {actual}"),
                    )
                }
            }
            Err(RecoveryFailure::SizeUnknown) => {
                self.keep_bad_or_fail(record, opts, report, "authoritative size unknown".into())
            }
            Err(RecoveryFailure::Failed(reason)) => {
                self.keep_bad_or_fail(record, opts, report, format!("authority failure: {reason}"))
            }
            Err(RecoveryFailure::Io(err)) => Err(err.into()),
        }
    }

    fn keep_bad_or_fail(
        &self,
        record: ScanRecord,
        opts: &InventoryOptions,
        report: &mut InventoryReport,
        detail: String,
    ) -> Result<Option<Candidate>, InventoryError> {
        if !opts.allow_recover_anyway {
            return Err(InventoryError::InconsistentOnDisk {
                id: record.id,
                detail,
            });
        }
        // Keep the replica visible but flagged; a persisted committed
        // state survives, anything else degrades to cached.
        let state = match record.control.map(|c| c.state) {
            Some(state @ (PrimaryState::Cached | PrimaryState::Precious)) => state,
            _ => PrimaryState::Cached,
        };
        warn!(id = %record.id, %detail, "keeping unrepaired replica flagged bad");
        let sticky = record.control.map(|c| c.sticky).unwrap_or(false);
        let entry = ReplicaEntry::from_scan(
            record.id,
            self.shared.clone(),
            Some(state),
            sticky,
            true,
            record.metadata,
            record.last_access,
        );
        report.kept_bad += 1;
        Ok(Some(Candidate {
            entry,
            size: record.size,
            last_access: record.last_access,
        }))
    }

    /// Evict non-precious replicas in LRU order until the accounting
    /// fits, within the bounded-repair policy.
    fn repair_overbooking(
        &self,
        candidates: Vec<Candidate>,
        committed: &mut u64,
        total: u64,
        opts: &InventoryOptions,
        report: &mut InventoryReport,
    ) -> Result<Vec<Candidate>, InventoryError> {
        let overbooked = *committed - total;
        error!(
            committed = *committed,
            total, overbooked, "inventory found pool overbooked"
        );
        if !opts.allow_space_recovery {
            return Err(InventoryError::CapacityExceeded {
                committed: *committed,
                total,
            });
        }
        if overbooked * 10 > *committed {
            error!("overbooked by more than 10%, refusing to repair");
            return Err(InventoryError::CapacityExceeded {
                committed: *committed,
                total,
            });
        }

        let mut survivors = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if *committed > total && !candidate.is_precious() {
                let id = candidate.entry.id().clone();
                warn!(%id, size = candidate.size, "evicting replica to recover space");
                self.shared.listeners.emit(ReplicaEvent::Removed, &id);
                self.purge_artifacts(&id);
                *committed -= candidate.size;
                report.evicted += 1;
            } else {
                survivors.push(candidate);
            }
        }
        if *committed > total {
            return Err(InventoryError::CapacityExceeded {
                committed: *committed,
                total,
            });
        }
        Ok(survivors)
    }

    fn purge_artifacts(&self, id: &ReplicaId) {
        let layout = &self.shared.layout;
        remove_file_logged(&layout.data_path(id));
        remove_file_logged(&layout.control_path(id));
        remove_file_logged(&layout.metadata_path(id));
    }
}

fn remove_file_logged(path: &std::path::Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove file");
    }
}
