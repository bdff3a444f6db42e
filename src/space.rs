//! Space accounting with FIFO-fair blocking allocation.
//!
//! `FairQueueAllocation` grants space strictly in arrival order: a
//! request proceeds only when no earlier request is still waiting, even
//! if the newcomer would fit into the current free space. This keeps a
//! large waiter from starving behind a stream of small ones.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("timed out waiting for {requested} bytes (total {total}, used {used})")]
    Timeout { requested: u64, total: u64, used: u64 },
    #[error("cannot shrink total to {requested} bytes while {used} bytes are in use")]
    TotalBelowUsed { requested: u64, used: u64 },
}

/// Notified when an allocation cannot be satisfied from free space.
///
/// Called synchronously on the allocating thread, outside the monitor's
/// internal lock, with the full requested size. Implementations must
/// not call back into `allocate` on the same monitor from this thread;
/// eviction work has to be handed off.
pub trait SpaceRequestListener: Send + Sync {
    fn need_space(&self, requested: u64);
}

/// Byte-level space bookkeeping for one pool.
pub trait SpaceMonitor: Send + Sync {
    /// Block until `bytes` can be taken from free space.
    fn allocate(&self, bytes: u64) -> Result<(), SpaceError>;

    /// Like [`allocate`](SpaceMonitor::allocate) but gives up after
    /// `timeout`, leaving no space consumed and no queue entry behind.
    fn allocate_within(&self, bytes: u64, timeout: Duration) -> Result<(), SpaceError>;

    /// Return `bytes` to free space.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the amount currently in use. That is
    /// an accounting bug in the caller, not a runtime condition.
    fn free(&self, bytes: u64);

    /// Adjust total capacity. Fails when shrinking below current usage.
    fn set_total(&self, bytes: u64) -> Result<(), SpaceError>;

    fn total(&self) -> u64;
    fn used(&self) -> u64;
    fn free_space(&self) -> u64;

    fn add_listener(&self, listener: Arc<dyn SpaceRequestListener>);
}

struct QueueState {
    total: u64,
    used: u64,
    /// Tickets of waiting allocations, oldest first.
    queue: VecDeque<u64>,
    next_ticket: u64,
}

impl QueueState {
    fn fits(&self, bytes: u64) -> bool {
        self.used.saturating_add(bytes) <= self.total
    }
}

pub struct FairQueueAllocation {
    state: Mutex<QueueState>,
    space_changed: Condvar,
    listeners: Mutex<Vec<Arc<dyn SpaceRequestListener>>>,
}

impl FairQueueAllocation {
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                total,
                used: 0,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            space_changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_need_space(&self, requested: u64) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.need_space(requested);
        }
    }

    fn allocate_inner(&self, bytes: u64, deadline: Option<Instant>) -> Result<(), SpaceError> {
        let mut state = self.lock_state();
        if state.queue.is_empty() && state.fits(bytes) {
            state.used += bytes;
            return Ok(());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        drop(state);

        // One scarcity notification per attempt, with the full size.
        self.notify_need_space(bytes);

        let mut state = self.lock_state();
        loop {
            if state.queue.front() == Some(&ticket) && state.fits(bytes) {
                state.queue.pop_front();
                state.used += bytes;
                // The next waiter may fit into what remains.
                self.space_changed.notify_all();
                return Ok(());
            }

            match deadline {
                None => {
                    state = self
                        .space_changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.queue.retain(|t| *t != ticket);
                        let err = SpaceError::Timeout {
                            requested: bytes,
                            total: state.total,
                            used: state.used,
                        };
                        drop(state);
                        // Our departure may unblock whoever was behind us.
                        self.space_changed.notify_all();
                        return Err(err);
                    }
                    state = self
                        .space_changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

impl SpaceMonitor for FairQueueAllocation {
    fn allocate(&self, bytes: u64) -> Result<(), SpaceError> {
        self.allocate_inner(bytes, None)
    }

    fn allocate_within(&self, bytes: u64, timeout: Duration) -> Result<(), SpaceError> {
        self.allocate_inner(bytes, Some(Instant::now() + timeout))
    }

    fn free(&self, bytes: u64) {
        let mut state = self.lock_state();
        assert!(
            bytes <= state.used,
            "freeing {bytes} bytes with only {} in use",
            state.used
        );
        state.used -= bytes;
        drop(state);
        self.space_changed.notify_all();
    }

    fn set_total(&self, bytes: u64) -> Result<(), SpaceError> {
        let mut state = self.lock_state();
        if bytes < state.used {
            return Err(SpaceError::TotalBelowUsed {
                requested: bytes,
                used: state.used,
            });
        }
        state.total = bytes;
        drop(state);
        self.space_changed.notify_all();
        Ok(())
    }

    fn total(&self) -> u64 {
        self.lock_state().total
    }

    fn used(&self) -> u64 {
        self.lock_state().used
    }

    fn free_space(&self) -> u64 {
        let state = self.lock_state();
        state.total - state.used
    }

    fn add_listener(&self, listener: Arc<dyn SpaceRequestListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}
