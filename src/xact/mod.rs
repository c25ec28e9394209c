// Local transaction collaborator.
//
// The coordination core assumes a local ACID transaction manager that
// durably assigns monotone transaction ids and emits commit/abort events
// with a commit LSN. This module is that surface, reduced to what the
// foreign transaction manager and recovery consume: xid assignment, the
// commit log, and the oldest-active clamp.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{Lsn, TransactionId};
use crate::error::Result;
use crate::wal::{Wal, WalRecord};

/// Known outcome of a local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactOutcome {
    /// Still running, or unknown to the commit log.
    InProgress,
    Committed,
    Aborted,
}

#[derive(Default)]
struct CommitLog {
    // xid -> committed?
    outcomes: HashMap<TransactionId, bool>,
}

/// Assigns transaction ids and records terminal outcomes.
pub struct XactManager {
    next_xid: AtomicU32,
    oldest_active: AtomicU32,
    log: Mutex<CommitLog>,
}

impl XactManager {
    /// Transaction ids start above the invalid id.
    const FIRST_XID: TransactionId = 3;

    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(Self::FIRST_XID),
            oldest_active: AtomicU32::new(Self::FIRST_XID),
            log: Mutex::new(CommitLog::default()),
        }
    }

    /// Assigns the next transaction id. Monotone for the life of the
    /// manager.
    pub fn assign_xid(&self) -> TransactionId {
        self.next_xid.fetch_add(1, Ordering::AcqRel)
    }

    /// Writes and flushes the commit record; returns the commit LSN.
    pub fn commit(&self, wal: &Wal, xid: TransactionId) -> Result<Lsn> {
        wal.append(&WalRecord::XactCommit { xid })?;
        let lsn = wal.flush()?;
        self.log.lock().outcomes.insert(xid, true);
        Ok(lsn)
    }

    /// Writes and flushes the abort record.
    pub fn abort(&self, wal: &Wal, xid: TransactionId) -> Result<Lsn> {
        wal.append(&WalRecord::XactAbort { xid })?;
        let lsn = wal.flush()?;
        self.log.lock().outcomes.insert(xid, false);
        Ok(lsn)
    }

    pub fn outcome(&self, xid: TransactionId) -> XactOutcome {
        match self.log.lock().outcomes.get(&xid) {
            Some(true) => XactOutcome::Committed,
            Some(false) => XactOutcome::Aborted,
            None => XactOutcome::InProgress,
        }
    }

    /// Replay hook: records an outcome observed in the log without writing
    /// a new record.
    pub fn note_recovered_outcome(&self, xid: TransactionId, committed: bool) {
        self.log.lock().outcomes.insert(xid, committed);
        // Keep xid assignment ahead of everything seen in the log.
        self.next_xid.fetch_max(xid + 1, Ordering::AcqRel);
    }

    /// Clamps the oldest-active boundary downwards. Recovery feeds the
    /// oldest xid among surviving prepared foreign transactions here so
    /// the id horizon cannot advance past an unresolved participant.
    pub fn clamp_oldest_active(&self, xid: TransactionId) {
        self.oldest_active.fetch_min(xid, Ordering::AcqRel);
    }

    pub fn oldest_active(&self) -> TransactionId {
        self.oldest_active.load(Ordering::Acquire)
    }
}

impl Default for XactManager {
    fn default() -> Self {
        Self::new()
    }
}
