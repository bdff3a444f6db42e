#![allow(dead_code)]

//! Shared helpers for integration tests: an isolated pool directory,
//! a recording listener, and scripted authorities.

use std::fs;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use spool_rs::{
    AuthorityError, ControlRecord, FairQueueAllocation, MetadataAuthority, PoolConfig, PoolLayout,
    PrimaryState, ReplicaId, Repository, RepositoryListener, StorageMetadata,
};

pub struct PoolFixture {
    pub dir: TempDir,
    pub monitor: Arc<FairQueueAllocation>,
    pub repo: Repository,
}

impl PoolFixture {
    pub fn layout(&self) -> PoolLayout {
        PoolLayout::new(self.dir.path())
    }
}

pub fn pool(total: u64) -> PoolFixture {
    pool_with(total, |_| {})
}

pub fn pool_with(total: u64, tweak: impl FnOnce(&mut PoolConfig)) -> PoolFixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = PoolConfig::new(dir.path(), total);
    tweak(&mut config);
    let monitor = Arc::new(FairQueueAllocation::new(0));
    let repo = Repository::open(&config, monitor.clone()).expect("open repository");
    PoolFixture { dir, monitor, repo }
}

pub fn id(n: u64) -> ReplicaId {
    ReplicaId::parse(&format!("{n:024x}")).expect("valid id")
}

/// Allocate space for `bytes` and write them as the replica's data
/// file, the way a transfer would.
pub fn write_data(fx: &PoolFixture, id: &ReplicaId, bytes: &[u8]) {
    fx.repo.allocate(bytes.len() as u64).expect("allocate");
    fs::write(fx.layout().data_path(id), bytes).expect("write data");
}

/// Lay down a complete committed replica directly on disk, bypassing
/// the repository, as input for inventory tests.
pub fn seed_replica(fx: &PoolFixture, id: &ReplicaId, bytes: &[u8], state: PrimaryState, sticky: bool) {
    let meta = StorageMetadata::new(Some(bytes.len() as u64), state == PrimaryState::Cached);
    seed_replica_with_metadata(fx, id, bytes, state, sticky, &meta);
}

pub fn seed_replica_with_metadata(
    fx: &PoolFixture,
    id: &ReplicaId,
    bytes: &[u8],
    state: PrimaryState,
    sticky: bool,
    meta: &StorageMetadata,
) {
    let layout = fx.layout();
    fs::write(layout.data_path(id), bytes).expect("write data");
    fs::write(
        layout.control_path(id),
        ControlRecord { state, sticky }.encode(),
    )
    .expect("write control");
    fs::write(
        layout.metadata_path(id),
        serde_json::to_vec(meta).expect("encode metadata"),
    )
    .expect("write metadata");
}

/// Push a data file's mtime into the past so LRU ordering is testable.
pub fn age_data_file(fx: &PoolFixture, id: &ReplicaId, seconds_ago: u64) {
    let path = fx.layout().data_path(id);
    let file = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .expect("open data file");
    let then = std::time::SystemTime::now() - std::time::Duration::from_secs(seconds_ago);
    file.set_modified(then).expect("set mtime");
}

/// Records every event it sees, in order, as (event, detail) pairs.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingListener {
    fn push(&self, event: &str, detail: String) {
        self.events.lock().unwrap().push((event.to_string(), detail));
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .count()
    }

    pub fn ids_for(&self, event: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl RepositoryListener for RecordingListener {
    fn created(&self, id: &ReplicaId) {
        self.push("created", id.to_string());
    }
    fn touched(&self, id: &ReplicaId) {
        self.push("touched", id.to_string());
    }
    fn cached(&self, id: &ReplicaId) {
        self.push("cached", id.to_string());
    }
    fn precious(&self, id: &ReplicaId) {
        self.push("precious", id.to_string());
    }
    fn sticky(&self, id: &ReplicaId) {
        self.push("sticky", id.to_string());
    }
    fn removed(&self, id: &ReplicaId) {
        self.push("removed", id.to_string());
    }
    fn destroyed(&self, id: &ReplicaId) {
        self.push("destroyed", id.to_string());
    }
    fn scanned(&self, id: &ReplicaId) {
        self.push("scanned", id.to_string());
    }
    fn available(&self, id: &ReplicaId) {
        self.push("available", id.to_string());
    }
    fn need_space(&self, requested: u64) {
        self.push("need_space", requested.to_string());
    }
}

/// Authority backed by a closure.
pub struct FnAuthority<F>(F);

impl<F> MetadataAuthority for FnAuthority<F>
where
    F: Fn(&ReplicaId) -> Result<StorageMetadata, AuthorityError> + Send + Sync,
{
    fn storage_metadata(&self, id: &ReplicaId) -> Result<StorageMetadata, AuthorityError> {
        (self.0)(id)
    }
}

pub fn authority_fn<F>(f: F) -> Arc<dyn MetadataAuthority>
where
    F: Fn(&ReplicaId) -> Result<StorageMetadata, AuthorityError> + Send + Sync + 'static,
{
    Arc::new(FnAuthority(f))
}
