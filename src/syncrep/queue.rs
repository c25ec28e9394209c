// Synchronous replication wait queues.
//
// Two LSN-ordered doubly linked lists, one per wait mode, realized as an
// index-linked arena sized by max_backends: each backend owns exactly one
// wait node, and a node is in at most one queue at a time. All structural
// mutation happens under the syncrep lock; the per-backend wait state is
// an atomic readable from the wait loop without the lock.
//
// The queue invariant is strict ascending order by `wait_lsn` with no
// duplicates. Insertion walks backward from the tail and stops at the
// first node with a smaller LSN, which is O(1) for the common
// arrive-in-LSN-order case.

use serde::{Deserialize, Serialize};

use crate::common::{BackendId, Lsn, INVALID_LSN};

/// Number of wait modes (and queues).
pub const NUM_SYNC_REP_WAIT_MODES: usize = 2;

/// Which replication progress a committing backend waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRepWaitMode {
    /// Standby has written the commit record.
    Write,
    /// Standby has flushed the commit record.
    Flush,
}

impl SyncRepWaitMode {
    pub const ALL: [SyncRepWaitMode; NUM_SYNC_REP_WAIT_MODES] =
        [SyncRepWaitMode::Write, SyncRepWaitMode::Flush];

    pub fn index(self) -> usize {
        match self {
            SyncRepWaitMode::Write => 0,
            SyncRepWaitMode::Flush => 1,
        }
    }
}

/// Wait progress of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRepState {
    NotWaiting,
    Waiting,
    WaitComplete,
}

impl SyncRepState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SyncRepState::NotWaiting => 0,
            SyncRepState::Waiting => 1,
            SyncRepState::WaitComplete => 2,
        }
    }

    pub(crate) fn from_u8(code: u8) -> Self {
        match code {
            1 => SyncRepState::Waiting,
            2 => SyncRepState::WaitComplete,
            _ => SyncRepState::NotWaiting,
        }
    }
}

/// One backend's wait node, embedded in the arena.
#[derive(Debug, Clone, Copy)]
struct WaitNode {
    wait_lsn: Lsn,
    prev: Option<BackendId>,
    next: Option<BackendId>,
    queued: Option<SyncRepWaitMode>,
}

impl WaitNode {
    fn empty() -> Self {
        Self {
            wait_lsn: INVALID_LSN,
            prev: None,
            next: None,
            queued: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct QueueHead {
    head: Option<BackendId>,
    tail: Option<BackendId>,
    len: usize,
}

/// The two wait queues over a fixed node arena.
pub struct SyncRepQueues {
    queues: [QueueHead; NUM_SYNC_REP_WAIT_MODES],
    nodes: Box<[WaitNode]>,
}

impl SyncRepQueues {
    pub fn new(max_backends: usize) -> Self {
        Self {
            queues: [QueueHead::default(); NUM_SYNC_REP_WAIT_MODES],
            nodes: vec![WaitNode::empty(); max_backends].into_boxed_slice(),
        }
    }

    pub fn len(&self, mode: SyncRepWaitMode) -> usize {
        self.queues[mode.index()].len
    }

    pub fn is_empty(&self, mode: SyncRepWaitMode) -> bool {
        self.len(mode) == 0
    }

    pub fn is_queued(&self, backend: BackendId) -> bool {
        self.nodes[backend].queued.is_some()
    }

    pub fn wait_lsn_of(&self, backend: BackendId) -> Lsn {
        self.nodes[backend].wait_lsn
    }

    /// Links a backend into the queue for `mode`, keeping ascending LSN
    /// order: walk backward from the tail to the first node with a smaller
    /// LSN and insert after it, or at the head if none.
    pub fn insert(&mut self, mode: SyncRepWaitMode, backend: BackendId, lsn: Lsn) {
        debug_assert!(self.nodes[backend].queued.is_none());
        let m = mode.index();
        self.nodes[backend].wait_lsn = lsn;
        self.nodes[backend].queued = Some(mode);

        let mut after = self.queues[m].tail;
        while let Some(cur) = after {
            if self.nodes[cur].wait_lsn < lsn {
                break;
            }
            after = self.nodes[cur].prev;
        }

        match after {
            Some(prev) => {
                let next = self.nodes[prev].next;
                self.nodes[backend].prev = Some(prev);
                self.nodes[backend].next = next;
                self.nodes[prev].next = Some(backend);
                match next {
                    Some(next) => self.nodes[next].prev = Some(backend),
                    None => self.queues[m].tail = Some(backend),
                }
            }
            None => {
                let old_head = self.queues[m].head;
                self.nodes[backend].prev = None;
                self.nodes[backend].next = old_head;
                match old_head {
                    Some(head) => self.nodes[head].prev = Some(backend),
                    None => self.queues[m].tail = Some(backend),
                }
                self.queues[m].head = Some(backend);
            }
        }
        self.queues[m].len += 1;
        debug_assert!(self.is_strictly_ascending(mode));
    }

    /// Unlinks a backend from whichever queue holds it. Returns false if
    /// it was not queued (already released, or never inserted).
    pub fn unlink(&mut self, backend: BackendId) -> bool {
        let Some(mode) = self.nodes[backend].queued.take() else {
            return false;
        };
        let m = mode.index();
        let prev = self.nodes[backend].prev.take();
        let next = self.nodes[backend].next.take();
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.queues[m].head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.queues[m].tail = prev,
        }
        self.queues[m].len -= 1;
        self.nodes[backend].wait_lsn = INVALID_LSN;
        true
    }

    /// Unlinks and returns, in queue order, every backend waiting at or
    /// below `lsn`.
    pub fn drain_upto(&mut self, mode: SyncRepWaitMode, lsn: Lsn) -> Vec<BackendId> {
        let mut released = Vec::new();
        while let Some(head) = self.queues[mode.index()].head {
            if self.nodes[head].wait_lsn > lsn {
                break;
            }
            self.unlink(head);
            released.push(head);
        }
        released
    }

    /// Unlinks and returns every waiter of the mode.
    pub fn drain_all(&mut self, mode: SyncRepWaitMode) -> Vec<BackendId> {
        self.drain_upto(mode, Lsn::MAX)
    }

    /// Queue-order check used by debug assertions and tests.
    pub fn is_strictly_ascending(&self, mode: SyncRepWaitMode) -> bool {
        let mut cursor = self.queues[mode.index()].head;
        let mut last: Option<Lsn> = None;
        while let Some(backend) = cursor {
            let lsn = self.nodes[backend].wait_lsn;
            if let Some(prev) = last {
                if lsn <= prev {
                    return false;
                }
            }
            last = Some(lsn);
            cursor = self.nodes[backend].next;
        }
        true
    }
}

impl std::fmt::Debug for SyncRepQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRepQueues")
            .field("write_len", &self.len(SyncRepWaitMode::Write))
            .field("flush_len", &self.len(SyncRepWaitMode::Flush))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_arrivals_append_at_tail() {
        let mut q = SyncRepQueues::new(8);
        q.insert(SyncRepWaitMode::Flush, 0, 100);
        q.insert(SyncRepWaitMode::Flush, 1, 200);
        q.insert(SyncRepWaitMode::Flush, 2, 300);
        assert_eq!(q.len(SyncRepWaitMode::Flush), 3);
        assert!(q.is_strictly_ascending(SyncRepWaitMode::Flush));
        assert_eq!(q.drain_all(SyncRepWaitMode::Flush), vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_order_arrival_is_placed_by_lsn() {
        let mut q = SyncRepQueues::new(8);
        q.insert(SyncRepWaitMode::Flush, 0, 300);
        q.insert(SyncRepWaitMode::Flush, 1, 100);
        q.insert(SyncRepWaitMode::Flush, 2, 200);
        assert!(q.is_strictly_ascending(SyncRepWaitMode::Flush));
        assert_eq!(q.drain_all(SyncRepWaitMode::Flush), vec![1, 2, 0]);
    }

    #[test]
    fn test_drain_upto_stops_at_boundary() {
        let mut q = SyncRepQueues::new(8);
        q.insert(SyncRepWaitMode::Write, 0, 100);
        q.insert(SyncRepWaitMode::Write, 1, 200);
        q.insert(SyncRepWaitMode::Write, 2, 300);

        assert_eq!(q.drain_upto(SyncRepWaitMode::Write, 250), vec![0, 1]);
        assert_eq!(q.len(SyncRepWaitMode::Write), 1);
        assert!(q.is_queued(2));
        assert_eq!(q.drain_upto(SyncRepWaitMode::Write, 299), Vec::<BackendId>::new());
    }

    #[test]
    fn test_unlink_middle_preserves_links() {
        let mut q = SyncRepQueues::new(8);
        q.insert(SyncRepWaitMode::Flush, 0, 100);
        q.insert(SyncRepWaitMode::Flush, 1, 200);
        q.insert(SyncRepWaitMode::Flush, 2, 300);

        assert!(q.unlink(1));
        assert!(!q.unlink(1));
        assert!(q.is_strictly_ascending(SyncRepWaitMode::Flush));
        assert_eq!(q.drain_all(SyncRepWaitMode::Flush), vec![0, 2]);
    }

    #[test]
    fn test_modes_are_independent() {
        let mut q = SyncRepQueues::new(8);
        q.insert(SyncRepWaitMode::Write, 0, 100);
        q.insert(SyncRepWaitMode::Flush, 1, 100);
        assert_eq!(q.len(SyncRepWaitMode::Write), 1);
        assert_eq!(q.len(SyncRepWaitMode::Flush), 1);
        assert_eq!(q.drain_all(SyncRepWaitMode::Write), vec![0]);
        assert_eq!(q.len(SyncRepWaitMode::Flush), 1);
    }
}
