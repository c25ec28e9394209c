// Resolution queue.
//
// A per-database FIFO of waiter descriptors under the resolution lock, the
// outermost of the three coordination locks. Backends enqueue themselves
// when they need a distributed transaction finalized and block on their
// own latch; a resolver pops due waiters, works, and wakes them. A waiter
// whose resolution attempt failed is re-enqueued with an exponentially
// backed-off deadline so a flapping foreign server is not hammered.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::common::{BackendId, DatabaseId, TransactionId};

/// One backend waiting for a distributed transaction to be finalized.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub dbid: DatabaseId,
    pub xid: TransactionId,
    pub backend: BackendId,
    /// True to finalize toward commit, false toward rollback.
    pub commit_requested: bool,
    /// The waiter is not handed out before this point.
    pub deadline: Instant,
    /// Failed resolution attempts so far, driving the backoff.
    pub attempts: u32,
}

/// Base delay after the first failed attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// The per-database waiter FIFOs (FdwXactResolutionLock).
pub struct ResolutionQueue {
    queues: RwLock<HashMap<DatabaseId, VecDeque<Waiter>>>,
}

impl ResolutionQueue {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, waiter: Waiter) {
        self.queues
            .write()
            .entry(waiter.dbid)
            .or_default()
            .push_back(waiter);
    }

    /// Pops the first waiter for `dbid` whose deadline is due. FIFO order
    /// is preserved among due waiters.
    pub fn get_waiter(&self, dbid: DatabaseId, now: Instant) -> Option<Waiter> {
        let mut queues = self.queues.write();
        let queue = queues.get_mut(&dbid)?;
        let pos = queue.iter().position(|w| w.deadline <= now)?;
        queue.remove(pos)
    }

    /// Re-enqueues a waiter after a failed attempt, doubling the delay
    /// each time up to `ceiling`.
    pub fn requeue_with_backoff(&self, mut waiter: Waiter, ceiling: Duration) {
        let exp = waiter.attempts.min(16);
        let delay = RETRY_BASE
            .checked_mul(1u32 << exp)
            .unwrap_or(ceiling)
            .min(ceiling);
        waiter.attempts = waiter.attempts.saturating_add(1);
        waiter.deadline = Instant::now() + delay;
        self.enqueue(waiter);
    }

    pub fn has_waiter(&self, dbid: DatabaseId) -> bool {
        self.queues
            .read()
            .get(&dbid)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Databases with at least one queued waiter, for the launcher scan.
    pub fn databases_with_waiters(&self) -> Vec<DatabaseId> {
        self.queues
            .read()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&dbid, _)| dbid)
            .collect()
    }

    /// Earliest deadline among waiters for `dbid`; the resolver sleeps no
    /// longer than this.
    pub fn next_deadline(&self, dbid: DatabaseId) -> Option<Instant> {
        self.queues
            .read()
            .get(&dbid)?
            .iter()
            .map(|w| w.deadline)
            .min()
    }

    /// Drops every waiter belonging to a backend, for cancellation.
    pub fn remove_backend(&self, backend: BackendId) {
        let mut queues = self.queues.write();
        for queue in queues.values_mut() {
            queue.retain(|w| w.backend != backend);
        }
    }

    pub fn total_len(&self) -> usize {
        self.queues.read().values().map(|q| q.len()).sum()
    }
}

impl Default for ResolutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResolutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionQueue")
            .field("total_len", &self.total_len())
            .finish()
    }
}
