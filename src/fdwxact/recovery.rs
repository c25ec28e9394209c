// Crash recovery for foreign transactions.
//
// Startup order:
//
// 1. Scan the state file directory; every file becomes a `Prepared` entry
//    with `inredo` and `ondisk` set and no owner.
// 2. Replay the WAL. Insertion records create entries, or upgrade ones
//    rebuilt from state files (restoring the database id and the WAL
//    extent); removal records destroy entries and unlink their files.
//    Local commit/abort records feed the commit log so resolvers can
//    recover the commit intent.
// 3. Prescan: the oldest surviving local xid clamps the transaction
//    manager's oldest-active boundary.
// 4. Surviving entries whose transaction is not in the still-in-progress
//    set are marked in doubt; a resolver finishes them.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::common::{Lsn, SharedState, TransactionId};
use crate::error::Result;
use crate::fdwxact::entry::FdwXactEntry;
use crate::fdwxact::state_file;
use crate::wal::WalRecord;

/// What recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    /// Entries rebuilt from state files.
    pub from_state_files: usize,
    /// Entries created from insertion records.
    pub from_wal: usize,
    /// Entries destroyed by removal records.
    pub removed: usize,
    /// Entries left in doubt for a resolver.
    pub indoubt: usize,
    /// Oldest surviving local xid, if any entry survived.
    pub oldest_xid: Option<TransactionId>,
}

/// Rebuilds the foreign transaction state after a crash. Must run before
/// any backend registers participants.
pub fn startup(state: &SharedState) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    // Pass 1: state files.
    for data in state_file::scan_state_dir(state.fdwxact.state_dir())? {
        let mut entry = FdwXactEntry::new(
            data.local_xid,
            0, // restored by the insertion record during replay
            data.serverid,
            data.userid,
            data.umid,
            data.fdwxact_id.clone(),
            None,
        );
        entry.state.inredo = true;
        let idx = state.fdwxact.insert_unchecked(entry)?;
        state.fdwxact.mark_valid(idx);
        // Only a valid entry may be flagged as spilled.
        state.fdwxact.with_entry(idx, |e| {
            e.state.ondisk = true;
            debug_assert!(e.check_flag_invariants());
        });
        stats.from_state_files += 1;
    }

    // Pass 2: WAL replay.
    for (start, end, record) in state.wal.reader()? {
        match record {
            WalRecord::FdwXactInsert {
                dbid,
                serverid,
                userid,
                umid,
                local_xid,
                fdwxact_id,
            } => {
                if redo_insert(
                    state, dbid, serverid, userid, umid, local_xid, fdwxact_id, start, end,
                )? {
                    stats.from_wal += 1;
                }
            }
            WalRecord::FdwXactRemove {
                serverid,
                userid,
                local_xid,
                ..
            } => {
                if redo_remove(state, local_xid, serverid, userid)? {
                    stats.removed += 1;
                }
            }
            WalRecord::XactCommit { xid } => state.xact.note_recovered_outcome(xid, true),
            WalRecord::XactAbort { xid } => state.xact.note_recovered_outcome(xid, false),
            WalRecord::Checkpoint { redo_horizon } => {
                debug!(redo_horizon, "checkpoint record replayed");
            }
        }
    }

    // Pass 3: prescan.
    stats.oldest_xid = prescan_fdwxacts(state);
    if let Some(oldest) = stats.oldest_xid {
        state.xact.clamp_oldest_active(oldest);
    }

    // Pass 4: in-doubt marking. Nothing survives a crash still owning an
    // entry, so the in-progress set here is whatever the local transaction
    // manager reports as still prepared locally; this core has none.
    stats.indoubt = state.fdwxact.mark_indoubt_orphans(&HashSet::new());

    info!(
        from_state_files = stats.from_state_files,
        from_wal = stats.from_wal,
        removed = stats.removed,
        indoubt = stats.indoubt,
        "foreign transaction recovery complete"
    );
    Ok(stats)
}

/// Oldest local xid among surviving entries, for the oldest-active clamp.
pub fn prescan_fdwxacts(state: &SharedState) -> Option<TransactionId> {
    state.fdwxact.oldest_xid()
}

/// Checkpoint hook: flush, log a checkpoint, and spill every qualifying
/// entry to its state file so older WAL becomes recyclable. Returns the
/// number of files written.
pub fn checkpoint_fdwxacts(state: &SharedState) -> Result<usize> {
    let horizon = state.wal.checkpoint()?;
    let written = state.fdwxact.checkpoint(horizon)?;
    if written > 0 {
        debug!(written, horizon, "spilled foreign transaction entries at checkpoint");
    }
    Ok(written)
}

#[allow(clippy::too_many_arguments)]
fn redo_insert(
    state: &SharedState,
    dbid: u32,
    serverid: u32,
    userid: u32,
    umid: u32,
    local_xid: TransactionId,
    fdwxact_id: crate::common::FdwXactId,
    start: Lsn,
    end: Lsn,
) -> Result<bool> {
    if let Some(idx) = state.fdwxact.find_by_file_key(local_xid, serverid, userid) {
        // Rebuilt from a state file already; restore what the file lacks.
        state.fdwxact.with_entry(idx, |e| {
            e.dbid = dbid;
            e.umid = umid;
            e.insert_start_lsn = start;
            e.insert_end_lsn = end;
        });
        return Ok(false);
    }
    let mut entry = FdwXactEntry::new(
        local_xid,
        dbid,
        serverid,
        userid,
        umid,
        fdwxact_id,
        None,
    );
    entry.state.inredo = true;
    entry.insert_start_lsn = start;
    entry.insert_end_lsn = end;
    let idx = state.fdwxact.insert(entry)?;
    state.fdwxact.mark_valid(idx);
    Ok(true)
}

fn redo_remove(
    state: &SharedState,
    local_xid: TransactionId,
    serverid: u32,
    userid: u32,
) -> Result<bool> {
    match state.fdwxact.find_by_file_key(local_xid, serverid, userid) {
        Some(idx) => {
            state.fdwxact.release(idx);
            state_file::remove_state_file(
                state.fdwxact.state_dir(),
                local_xid,
                serverid,
                userid,
            )?;
            Ok(true)
        }
        None => {
            // Replay is idempotent: the entry may already be gone.
            warn!(
                xid = local_xid,
                serverid, "removal record for an unknown entry, skipping"
            );
            state_file::remove_state_file(
                state.fdwxact.state_dir(),
                local_xid,
                serverid,
                userid,
            )?;
            Ok(false)
        }
    }
}
