//! Repository event fan-out.
//!
//! Events are delivered in listener registration order, best effort:
//! they describe transitions that have already committed and are never
//! rolled back, whatever a listener does with them.

use std::sync::{Arc, Mutex, PoisonError};

use crate::core::ReplicaId;

/// Per-replica lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaEvent {
    Created,
    Touched,
    Cached,
    Precious,
    Sticky,
    Removed,
    Destroyed,
    Scanned,
    Available,
}

/// Observer of repository activity. Every method defaults to a no-op so
/// implementations pick only what they care about.
pub trait RepositoryListener: Send + Sync {
    fn created(&self, _id: &ReplicaId) {}
    fn touched(&self, _id: &ReplicaId) {}
    fn cached(&self, _id: &ReplicaId) {}
    fn precious(&self, _id: &ReplicaId) {}
    fn sticky(&self, _id: &ReplicaId) {}
    fn removed(&self, _id: &ReplicaId) {}
    fn destroyed(&self, _id: &ReplicaId) {}
    fn scanned(&self, _id: &ReplicaId) {}
    fn available(&self, _id: &ReplicaId) {}

    /// An allocation could not be satisfied from free space;
    /// `requested` is the full size of the blocked request.
    fn need_space(&self, _requested: u64) {}
}

/// Ordered listener registry.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn RepositoryListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn RepositoryListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn RepositoryListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit(&self, event: ReplicaEvent, id: &ReplicaId) {
        for listener in self.snapshot() {
            match event {
                ReplicaEvent::Created => listener.created(id),
                ReplicaEvent::Touched => listener.touched(id),
                ReplicaEvent::Cached => listener.cached(id),
                ReplicaEvent::Precious => listener.precious(id),
                ReplicaEvent::Sticky => listener.sticky(id),
                ReplicaEvent::Removed => listener.removed(id),
                ReplicaEvent::Destroyed => listener.destroyed(id),
                ReplicaEvent::Scanned => listener.scanned(id),
                ReplicaEvent::Available => listener.available(id),
            }
        }
    }

    pub(crate) fn emit_all(&self, events: &[ReplicaEvent], id: &ReplicaId) {
        for event in events {
            self.emit(*event, id);
        }
    }

    pub(crate) fn need_space(&self, requested: u64) {
        for listener in self.snapshot() {
            listener.need_space(requested);
        }
    }
}
