// Foreign transaction entry.
//
// One durable record per prepared participant. Identity fields are written
// when the slot is allocated under the exclusive pool lock and never change
// afterwards; the status/flags region is guarded by the per-entry lock and
// may be updated by whoever holds the entry (owner backend or a resolver).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{
    BackendId, DatabaseId, FdwXactId, Lsn, ServerId, TransactionId, UserId, UserMappingId,
    INVALID_LSN,
};

/// Lifecycle status of a foreign transaction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdwXactStatus {
    /// Allocated; the insertion record may not be flushed yet.
    Preparing,
    /// Durable and awaiting resolution.
    Prepared,
    /// Resolution toward commit in progress.
    Committing,
    /// Resolution toward rollback in progress.
    Aborting,
    /// Slot content is dead; pending release.
    Invalid,
}

impl FdwXactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FdwXactStatus::Preparing => "preparing",
            FdwXactStatus::Prepared => "prepared",
            FdwXactStatus::Committing => "committing",
            FdwXactStatus::Aborting => "aborting",
            FdwXactStatus::Invalid => "invalid",
        }
    }

    pub(crate) fn to_u16(self) -> u16 {
        match self {
            FdwXactStatus::Preparing => 0,
            FdwXactStatus::Prepared => 1,
            FdwXactStatus::Committing => 2,
            FdwXactStatus::Aborting => 3,
            FdwXactStatus::Invalid => 4,
        }
    }

    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => FdwXactStatus::Preparing,
            1 => FdwXactStatus::Prepared,
            2 => FdwXactStatus::Committing,
            3 => FdwXactStatus::Aborting,
            4 => FdwXactStatus::Invalid,
            _ => return None,
        })
    }
}

impl fmt::Display for FdwXactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable status/flags region of an entry, updated under the
/// per-entry lock.
#[derive(Debug, Clone)]
pub struct FdwXactState {
    pub status: FdwXactStatus,
    /// True once the insertion record is flushed.
    pub valid: bool,
    /// True once spilled to the state file directory.
    pub ondisk: bool,
    /// True if reconstructed from the log during recovery.
    pub inredo: bool,
    /// True if orphaned: the owner is gone and nobody resolved it yet.
    pub indoubt: bool,
    /// A resolver has claimed this entry for one finalize attempt.
    pub inprocessing: bool,
    /// Backend currently working on the entry, if any.
    pub owner: Option<BackendId>,
}

/// A foreign transaction entry: one prepared participant of one local
/// distributed transaction.
#[derive(Debug, Clone)]
pub struct FdwXactEntry {
    pub local_xid: TransactionId,
    pub dbid: DatabaseId,
    pub serverid: ServerId,
    pub userid: UserId,
    pub umid: UserMappingId,
    pub fdwxact_id: FdwXactId,
    /// WAL extent of the insertion record.
    pub insert_start_lsn: Lsn,
    pub insert_end_lsn: Lsn,
    pub state: FdwXactState,
}

impl FdwXactEntry {
    pub fn new(
        local_xid: TransactionId,
        dbid: DatabaseId,
        serverid: ServerId,
        userid: UserId,
        umid: UserMappingId,
        fdwxact_id: FdwXactId,
        owner: Option<BackendId>,
    ) -> Self {
        Self {
            local_xid,
            dbid,
            serverid,
            userid,
            umid,
            fdwxact_id,
            insert_start_lsn: INVALID_LSN,
            insert_end_lsn: INVALID_LSN,
            state: FdwXactState {
                status: FdwXactStatus::Preparing,
                valid: false,
                ondisk: false,
                inredo: false,
                indoubt: false,
                inprocessing: false,
                owner,
            },
        }
    }

    /// The participant key under which at most one non-invalid entry may
    /// exist at any time.
    pub fn key(&self) -> (DatabaseId, ServerId, UserId) {
        (self.dbid, self.serverid, self.userid)
    }

    /// An entry whose status left `Prepared` but whose owner died must be
    /// picked up by a resolver; `ondisk` additionally requires `valid`.
    pub fn check_flag_invariants(&self) -> bool {
        if self.state.ondisk && !self.state.valid {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> FdwXactEntry {
        FdwXactEntry::new(
            7,
            1,
            2,
            3,
            4,
            FdwXactId::new(&b"fx_7_2_3"[..]).unwrap(),
            Some(0),
        )
    }

    #[test]
    fn test_new_entry_starts_preparing_and_invalid_flags_clear() {
        let e = entry();
        assert_eq!(e.state.status, FdwXactStatus::Preparing);
        assert!(!e.state.valid);
        assert!(!e.state.ondisk);
        assert!(!e.state.indoubt);
        assert_eq!(e.state.owner, Some(0));
        assert!(e.check_flag_invariants());
    }

    #[test]
    fn test_ondisk_requires_valid() {
        let mut e = entry();
        e.state.ondisk = true;
        assert!(!e.check_flag_invariants());
        e.state.valid = true;
        assert!(e.check_flag_invariants());
    }

    #[test]
    fn test_status_round_trips_through_wire_code() {
        for status in [
            FdwXactStatus::Preparing,
            FdwXactStatus::Prepared,
            FdwXactStatus::Committing,
            FdwXactStatus::Aborting,
            FdwXactStatus::Invalid,
        ] {
            assert_eq!(FdwXactStatus::from_u16(status.to_u16()), Some(status));
        }
        assert_eq!(FdwXactStatus::from_u16(99), None);
    }
}
