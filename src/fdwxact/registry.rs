// Foreign transaction manager.
//
// Two halves live here. `FdwXactControl` is the shared entry pool: a fixed
// arena with a free list under the exclusive/shared pool lock, one small
// per-entry lock guarding each entry's status region. `FdwXactParticipants`
// is the per-backend side: the in-memory participant list populated as
// statements touch foreign servers, and the commit-time orchestration that
// turns that list into prepared entries, WAL records and driver calls.
//
// Locking: structural pool mutation (allocate, release, claim) takes the
// pool lock exclusively; iteration takes it shared; per-entry locks nest
// inside. No WAL or driver I/O happens under either.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::common::{
    BackendId, DatabaseId, FdwXactId, Lsn, ServerId, SharedState, TransactionId, UserId,
};
use crate::config::ForeignTwophaseCommit;
use crate::error::{FedXactError, Result};
use crate::fdwxact::driver::{ParticipantDriver, ParticipantHandle, ResolveOutcome};
use crate::fdwxact::entry::{FdwXactEntry, FdwXactStatus};
use crate::fdwxact::launcher;
use crate::fdwxact::queue::Waiter;
use crate::fdwxact::state_file;
use crate::wal::{Wal, WalRecord};

// ============================================================================
// Shared entry pool
// ============================================================================

struct PoolState {
    free: Vec<usize>,
    used: Vec<usize>,
}

/// The shared foreign transaction entry pool (FdwXactLock).
pub struct FdwXactControl {
    pool: RwLock<PoolState>,
    slots: Box<[Mutex<Option<FdwXactEntry>>]>,
    num_valid: AtomicUsize,
    fdwxact_dir: PathBuf,
}

impl FdwXactControl {
    pub fn new(capacity: usize, fdwxact_dir: PathBuf) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Mutex::new(None));
        Self {
            pool: RwLock::new(PoolState {
                free: (0..capacity).rev().collect(),
                used: Vec::with_capacity(capacity),
            }),
            slots: slots.into_boxed_slice(),
            num_valid: AtomicUsize::new(0),
            fdwxact_dir,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Count of entries whose insertion record has been flushed.
    pub fn num_valid(&self) -> usize {
        self.num_valid.load(Ordering::Acquire)
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.fdwxact_dir
    }

    /// Allocates a slot for the entry. At most one non-invalid entry may
    /// exist per `(dbid, serverid, userid)`.
    pub fn insert(&self, entry: FdwXactEntry) -> Result<usize> {
        let mut pool = self.pool.write();
        for &idx in &pool.used {
            let slot = self.slots[idx].lock();
            if let Some(existing) = slot.as_ref() {
                if existing.key() == entry.key()
                    && existing.state.status != FdwXactStatus::Invalid
                {
                    return Err(FedXactError::DuplicateEntry {
                        dbid: entry.dbid,
                        serverid: entry.serverid,
                    });
                }
            }
        }
        let idx = pool
            .free
            .pop()
            .ok_or(FedXactError::SlotExhausted { kind: "entry" })?;
        *self.slots[idx].lock() = Some(entry);
        pool.used.push(idx);
        Ok(idx)
    }

    /// Allocation without the duplicate-key check, for recovery only.
    ///
    /// State files do not carry the database id, so entries rebuilt from
    /// them sit on a placeholder database until the insertion record is
    /// replayed; the uniqueness invariant is re-established by that
    /// upgrade.
    pub(crate) fn insert_unchecked(&self, entry: FdwXactEntry) -> Result<usize> {
        let mut pool = self.pool.write();
        let idx = pool
            .free
            .pop()
            .ok_or(FedXactError::SlotExhausted { kind: "entry" })?;
        *self.slots[idx].lock() = Some(entry);
        pool.used.push(idx);
        Ok(idx)
    }

    /// Releases a slot back to the free list.
    pub fn release(&self, idx: usize) {
        let mut pool = self.pool.write();
        let was_valid = {
            let mut slot = self.slots[idx].lock();
            let was_valid = slot.as_ref().map(|e| e.state.valid).unwrap_or(false);
            *slot = None;
            was_valid
        };
        pool.used.retain(|&u| u != idx);
        pool.free.push(idx);
        if was_valid {
            self.num_valid.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Runs `f` on the entry at `idx` under its per-entry lock.
    pub fn with_entry<R>(&self, idx: usize, f: impl FnOnce(&mut FdwXactEntry) -> R) -> Option<R> {
        let mut slot = self.slots[idx].lock();
        slot.as_mut().map(f)
    }

    /// Flips an entry valid after its insertion record is flushed.
    pub fn mark_valid(&self, idx: usize) {
        let flipped = self
            .with_entry(idx, |e| {
                if e.state.valid {
                    false
                } else {
                    e.state.valid = true;
                    e.state.status = FdwXactStatus::Prepared;
                    true
                }
            })
            .unwrap_or(false);
        if flipped {
            self.num_valid.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clones every live entry, for iteration without holding locks.
    pub fn snapshot(&self) -> Vec<(usize, FdwXactEntry)> {
        let pool = self.pool.read();
        pool.used
            .iter()
            .filter_map(|&idx| {
                self.slots[idx]
                    .lock()
                    .as_ref()
                    .map(|e| (idx, e.clone()))
            })
            .collect()
    }

    pub fn has_entries_for(&self, dbid: DatabaseId, xid: TransactionId) -> bool {
        let pool = self.pool.read();
        pool.used.iter().any(|&idx| {
            self.slots[idx]
                .lock()
                .as_ref()
                .map(|e| e.dbid == dbid && e.local_xid == xid)
                .unwrap_or(false)
        })
    }

    /// Databases holding at least one valid entry that is not in doubt.
    /// The launcher scans this to decide where resolvers are needed.
    pub fn databases_needing_resolver(&self) -> Vec<DatabaseId> {
        let mut dbs = Vec::new();
        for (_, entry) in self.snapshot() {
            if entry.state.valid && !entry.state.indoubt && !dbs.contains(&entry.dbid) {
                dbs.push(entry.dbid);
            }
        }
        dbs
    }

    /// Claims every valid entry of `(dbid, xid)` for one finalize attempt.
    /// Takes the pool lock exclusively; entries already claimed by another
    /// attempt are skipped.
    pub fn claim_for_resolution(&self, dbid: DatabaseId, xid: TransactionId) -> Vec<usize> {
        let pool = self.pool.write();
        let mut held = Vec::new();
        for &idx in &pool.used {
            let mut slot = self.slots[idx].lock();
            if let Some(entry) = slot.as_mut() {
                if entry.dbid == dbid
                    && entry.local_xid == xid
                    && entry.state.valid
                    && !entry.state.inprocessing
                {
                    entry.state.inprocessing = true;
                    held.push(idx);
                }
            }
        }
        held
    }

    /// Claims every in-doubt entry of the database.
    pub fn claim_indoubt(&self, dbid: DatabaseId) -> Vec<usize> {
        let pool = self.pool.write();
        let mut held = Vec::new();
        for &idx in &pool.used {
            let mut slot = self.slots[idx].lock();
            if let Some(entry) = slot.as_mut() {
                if entry.dbid == dbid && entry.state.indoubt && !entry.state.inprocessing {
                    entry.state.inprocessing = true;
                    held.push(idx);
                }
            }
        }
        held
    }

    pub fn clear_inprocessing(&self, idx: usize) {
        self.with_entry(idx, |e| e.state.inprocessing = false);
    }

    /// Finds the slot matching the state-file key.
    pub fn find_by_file_key(
        &self,
        xid: TransactionId,
        serverid: ServerId,
        userid: UserId,
    ) -> Option<usize> {
        let pool = self.pool.read();
        pool.used.iter().copied().find(|&idx| {
            self.slots[idx]
                .lock()
                .as_ref()
                .map(|e| e.local_xid == xid && e.serverid == serverid && e.userid == userid)
                .unwrap_or(false)
        })
    }

    /// Oldest local xid among surviving entries, for the oldest-active
    /// clamp during recovery.
    pub fn oldest_xid(&self) -> Option<TransactionId> {
        self.snapshot()
            .into_iter()
            .map(|(_, e)| e.local_xid)
            .min()
    }

    /// Marks every surviving ownerless entry whose transaction is not in
    /// the still-in-progress set as in doubt.
    pub fn mark_indoubt_orphans(&self, in_progress: &HashSet<TransactionId>) -> usize {
        let pool = self.pool.read();
        let mut marked = 0;
        for &idx in &pool.used {
            let mut slot = self.slots[idx].lock();
            if let Some(entry) = slot.as_mut() {
                if entry.state.owner.is_none()
                    && !entry.state.indoubt
                    && !in_progress.contains(&entry.local_xid)
                {
                    entry.state.indoubt = true;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Appends the insertion record for a freshly allocated entry and
    /// captures its WAL extent. The entry becomes valid only after a later
    /// flush covers `insert_end_lsn`.
    pub fn log_insert(&self, wal: &Wal, idx: usize) -> Result<(Lsn, Lsn)> {
        let record = self
            .with_entry(idx, |e| WalRecord::FdwXactInsert {
                dbid: e.dbid,
                serverid: e.serverid,
                userid: e.userid,
                umid: e.umid,
                local_xid: e.local_xid,
                fdwxact_id: e.fdwxact_id.clone(),
            })
            .ok_or(FedXactError::EntryNotFound { xid: 0 })?;
        let (start, end) = wal.append(&record)?;
        self.with_entry(idx, |e| {
            e.insert_start_lsn = start;
            e.insert_end_lsn = end;
        });
        Ok((start, end))
    }

    /// Terminal resolution: logs the removal, flushes it, releases the
    /// slot and unlinks any state file. Only called after the driver
    /// reported success or `missing`.
    pub fn remove_entry(&self, wal: &Wal, idx: usize) -> Result<()> {
        let Some(entry) = self.with_entry(idx, |e| e.clone()) else {
            return Ok(());
        };
        wal.append(&WalRecord::FdwXactRemove {
            dbid: entry.dbid,
            serverid: entry.serverid,
            userid: entry.userid,
            local_xid: entry.local_xid,
        })?;
        wal.flush()?;
        self.release(idx);
        state_file::remove_state_file(
            &self.fdwxact_dir,
            entry.local_xid,
            entry.serverid,
            entry.userid,
        )?;
        debug!(
            xid = entry.local_xid,
            serverid = entry.serverid,
            "foreign transaction entry removed"
        );
        Ok(())
    }

    /// Spills every valid entry inserted at or below the redo horizon to
    /// its state file. Returns the number written.
    pub fn checkpoint(&self, redo_horizon: Lsn) -> Result<usize> {
        let mut written = 0;
        for (idx, entry) in self.snapshot() {
            if !entry.state.valid || entry.state.ondisk || entry.insert_end_lsn > redo_horizon {
                continue;
            }
            state_file::write_state_file(
                &self.fdwxact_dir,
                &state_file::StateFileData {
                    status: entry.state.status,
                    local_xid: entry.local_xid,
                    serverid: entry.serverid,
                    userid: entry.userid,
                    umid: entry.umid,
                    fdwxact_id: entry.fdwxact_id.clone(),
                },
            )?;
            self.with_entry(idx, |e| {
                e.state.ondisk = true;
                debug_assert!(e.check_flag_invariants());
            });
            written += 1;
        }
        Ok(written)
    }
}

impl std::fmt::Debug for FdwXactControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdwXactControl")
            .field("capacity", &self.capacity())
            .field("num_valid", &self.num_valid())
            .finish()
    }
}

// ============================================================================
// Per-backend participant list and commit orchestration
// ============================================================================

struct Participant {
    serverid: ServerId,
    userid: UserId,
    umid: u32,
    modified: bool,
    driver: Arc<dyn ParticipantDriver>,
    prepared: Option<PreparedParticipant>,
}

struct PreparedParticipant {
    entry_idx: usize,
    id: FdwXactId,
}

/// The participants a backend has registered for its current local
/// transaction, and the commit-time operations over them.
pub struct FdwXactParticipants {
    backend: BackendId,
    dbid: DatabaseId,
    participants: Vec<Participant>,
}

impl FdwXactParticipants {
    pub fn new(backend: BackendId, dbid: DatabaseId) -> Self {
        Self {
            backend,
            dbid,
            participants: Vec::new(),
        }
    }

    /// Records a participant the statement touched. Repeated registration
    /// of the same (server, user) only widens the modified flag.
    pub fn register(
        &mut self,
        state: &SharedState,
        serverid: ServerId,
        userid: UserId,
        modified: bool,
    ) -> Result<()> {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.serverid == serverid && p.userid == userid)
        {
            existing.modified |= modified;
            return Ok(());
        }
        let driver = state.drivers.driver_for(serverid)?;
        let umid = state.drivers.user_mapping_id(serverid, userid);
        self.participants.push(Participant {
            serverid,
            userid,
            umid,
            modified,
            driver,
            prepared: None,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn modifying_count(&self) -> usize {
        self.participants.iter().filter(|p| p.modified).count()
    }

    fn handle_for(&self, xid: TransactionId, p: &Participant) -> ParticipantHandle {
        ParticipantHandle {
            xid,
            serverid: p.serverid,
            userid: p.userid,
            umid: p.umid,
        }
    }

    /// Commit-path gate. Decides whether atomic commit across participants
    /// is required and, if so, prepares the participants the configured
    /// mode allows.
    pub fn pre_commit(
        &mut self,
        state: &SharedState,
        xid: TransactionId,
        local_modified: bool,
    ) -> Result<()> {
        let modifying = self.modifying_count();
        let need_two_phase = modifying >= 2 || (local_modified && modifying >= 1);
        if !need_two_phase {
            return Ok(());
        }
        let mode = state.config.read().foreign_twophase_commit;
        match mode {
            ForeignTwophaseCommit::Disabled => Err(FedXactError::TwoPhaseNotAllowed {
                participants: modifying,
            }),
            ForeignTwophaseCommit::Required => {
                if let Some(p) = self
                    .participants
                    .iter()
                    .find(|p| p.modified && !p.driver.caps().supports_two_phase())
                {
                    return Err(FedXactError::TwoPhaseUnsupported {
                        serverid: p.serverid,
                    });
                }
                self.prepare_targets(state, xid, |p| p.modified)
            }
            ForeignTwophaseCommit::Prefer => self.prepare_targets(state, xid, |p| {
                p.modified && p.driver.caps().supports_two_phase()
            }),
        }
    }

    /// Prepares every participant selected by `targets`, inserting one
    /// entry and one insertion record each. A prepare failure mid-flight
    /// aborts everything prepared so far and fails the commit.
    fn prepare_targets(
        &mut self,
        state: &SharedState,
        xid: TransactionId,
        targets: impl Fn(&Participant) -> bool,
    ) -> Result<()> {
        for i in 0..self.participants.len() {
            if !targets(&self.participants[i]) || self.participants[i].prepared.is_some() {
                continue;
            }
            let handle = self.handle_for(xid, &self.participants[i]);
            let id = self.participants[i].driver.make_prepare_id(&handle);

            let entry = FdwXactEntry::new(
                xid,
                self.dbid,
                handle.serverid,
                handle.userid,
                handle.umid,
                id.clone(),
                Some(self.backend),
            );
            let idx = match state.fdwxact.insert(entry) {
                Ok(idx) => idx,
                Err(err) => {
                    self.abort_prepared(state, xid);
                    return Err(err);
                }
            };
            if let Err(err) = state.fdwxact.log_insert(&state.wal, idx) {
                state.fdwxact.release(idx);
                self.abort_prepared(state, xid);
                return Err(err);
            }

            match self.participants[i].driver.prepare(&handle, &id) {
                Ok(()) => {
                    self.participants[i].prepared = Some(PreparedParticipant { entry_idx: idx, id });
                }
                Err(err) => {
                    let serverid = handle.serverid;
                    warn!(
                        serverid,
                        xid, "prepare failed on foreign server, aborting all participants: {err}"
                    );
                    // Nothing was prepared remotely for this one.
                    state.fdwxact.release(idx);
                    self.abort_prepared(state, xid);
                    return Err(FedXactError::driver_failed(
                        serverid,
                        "prepare",
                        err.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Best-effort abort of everything prepared so far. Entries whose
    /// driver cannot currently abort are left for a resolver.
    fn abort_prepared(&mut self, state: &SharedState, xid: TransactionId) {
        for p in &mut self.participants {
            let Some(prep) = p.prepared.take() else {
                continue;
            };
            let handle = ParticipantHandle {
                xid,
                serverid: p.serverid,
                userid: p.userid,
                umid: p.umid,
            };
            state
                .fdwxact
                .with_entry(prep.entry_idx, |e| e.state.status = FdwXactStatus::Aborting);
            match p.driver.resolve(&handle, &prep.id, false) {
                Ok(_) => {
                    if let Err(err) = state.fdwxact.remove_entry(&state.wal, prep.entry_idx) {
                        warn!(serverid = p.serverid, "failed to remove aborted entry: {err}");
                    }
                }
                Err(err) => {
                    warn!(
                        serverid = p.serverid,
                        xid, "could not abort prepared foreign transaction: {err}"
                    );
                    state.fdwxact.with_entry(prep.entry_idx, |e| {
                        e.state.owner = None;
                        e.state.indoubt = true;
                    });
                    launcher::launch_or_wakeup(state, self.dbid);
                }
            }
        }
    }

    /// End-of-transaction processing. For prepared participants: flush the
    /// insertion records, resolve each in line, and log the removal of
    /// every participant that finalized. For the rest: one-phase commit or
    /// rollback. Driver failures after the entries are durable are
    /// warnings; a resolver inherits the entry.
    pub fn at_eoxact(
        &mut self,
        state: &SharedState,
        xid: TransactionId,
        is_commit: bool,
    ) -> Result<()> {
        if self.participants.iter().any(|p| p.prepared.is_some()) {
            state.wal.flush()?;
            for p in &self.participants {
                if let Some(prep) = &p.prepared {
                    state.fdwxact.mark_valid(prep.entry_idx);
                }
            }
        }

        let mut needs_resolver = false;
        for p in &mut self.participants {
            let handle = ParticipantHandle {
                xid,
                serverid: p.serverid,
                userid: p.userid,
                umid: p.umid,
            };
            match p.prepared.take() {
                Some(prep) => {
                    state.fdwxact.with_entry(prep.entry_idx, |e| {
                        e.state.status = if is_commit {
                            FdwXactStatus::Committing
                        } else {
                            FdwXactStatus::Aborting
                        };
                    });
                    match p.driver.resolve(&handle, &prep.id, is_commit) {
                        Ok(outcome) => {
                            if outcome == ResolveOutcome::Missing {
                                debug!(
                                    serverid = p.serverid,
                                    xid, "prepared foreign transaction already gone; treating as resolved"
                                );
                            }
                            state.fdwxact.remove_entry(&state.wal, prep.entry_idx)?;
                        }
                        Err(err) => {
                            warn!(
                                serverid = p.serverid,
                                xid,
                                commit = is_commit,
                                "failed to resolve prepared foreign transaction, a resolver will retry: {err}"
                            );
                            state.fdwxact.with_entry(prep.entry_idx, |e| {
                                e.state.status = FdwXactStatus::Prepared;
                                e.state.owner = None;
                                e.state.indoubt = true;
                            });
                            needs_resolver = true;
                        }
                    }
                }
                None => {
                    let result = if is_commit {
                        p.driver.commit(&handle)
                    } else {
                        p.driver.rollback(&handle)
                    };
                    if let Err(err) = result {
                        warn!(
                            serverid = p.serverid,
                            xid,
                            commit = is_commit,
                            "one-phase completion failed on foreign server: {err}"
                        );
                    }
                }
            }
        }
        if needs_resolver {
            launcher::launch_or_wakeup(state, self.dbid);
        }
        self.participants.clear();
        Ok(())
    }

    /// The PREPARE TRANSACTION path: every modifying participant must be
    /// two-phase capable; prepared entries are left behind with no owner
    /// for a resolver to finalize.
    pub fn prepare_participants(&mut self, state: &SharedState, xid: TransactionId) -> Result<()> {
        let incapable = self
            .participants
            .iter()
            .find(|p| p.modified && !p.driver.caps().supports_two_phase())
            .map(|p| p.serverid);
        if let Some(serverid) = incapable {
            let modifying = self.modifying_count();
            self.abort_prepared(state, xid);
            let mode = state.config.read().foreign_twophase_commit;
            return Err(match mode {
                ForeignTwophaseCommit::Disabled => FedXactError::TwoPhaseNotAllowed {
                    participants: modifying,
                },
                _ => FedXactError::TwoPhaseUnsupported { serverid },
            });
        }
        self.prepare_targets(state, xid, |p| p.modified)?;
        state.wal.flush()?;
        for p in &mut self.participants {
            if let Some(prep) = p.prepared.take() {
                state.fdwxact.mark_valid(prep.entry_idx);
                state.fdwxact.with_entry(prep.entry_idx, |e| e.state.owner = None);
            } else {
                // Read-only participants just end their remote transaction.
                let handle = ParticipantHandle {
                    xid,
                    serverid: p.serverid,
                    userid: p.userid,
                    umid: p.umid,
                };
                if let Err(err) = p.driver.commit(&handle) {
                    warn!(serverid = p.serverid, "closing read-only participant failed: {err}");
                }
            }
        }
        self.participants.clear();
        Ok(())
    }
}

/// Blocks the backend until every entry of `(dbid, xid)` is resolved, by
/// enqueueing a waiter and handing the work to a resolver.
pub fn wait_for_resolution(
    state: &SharedState,
    backend: BackendId,
    dbid: DatabaseId,
    xid: TransactionId,
    commit: bool,
    timeout: Duration,
) -> Result<()> {
    if !state.fdwxact.has_entries_for(dbid, xid) {
        return Ok(());
    }
    state.resolution_queue.enqueue(Waiter {
        dbid,
        xid,
        backend,
        commit_requested: commit,
        deadline: Instant::now(),
        attempts: 0,
    });
    launcher::launch_or_wakeup(state, dbid);

    let deadline = Instant::now() + timeout;
    let proc = state.procs.get(backend);
    loop {
        proc.latch.reset();
        if !state.fdwxact.has_entries_for(dbid, xid) {
            return Ok(());
        }
        if proc.pending.proc_die_pending() || proc.pending.take_query_cancel() {
            state.resolution_queue.remove_backend(backend);
            warn!(
                xid,
                "canceling wait for foreign transaction resolution; resolution continues in the background"
            );
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            state.resolution_queue.remove_backend(backend);
            return Err(FedXactError::WaitTimeout {
                what: "foreign transaction resolution",
            });
        }
        let remaining = deadline - now;
        proc.latch
            .wait(remaining.min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fdwxact::driver::{DriverCaps, DriverError};
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockDriver {
        two_phase: bool,
        fail_prepare: bool,
        fail_resolve: bool,
        prepares: AtomicU32,
        resolves: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
    }

    impl MockDriver {
        fn two_phase() -> Self {
            Self {
                two_phase: true,
                ..Self::default()
            }
        }
    }

    impl ParticipantDriver for MockDriver {
        fn name(&self) -> &str {
            "mock"
        }

        fn caps(&self) -> DriverCaps {
            if self.two_phase {
                DriverCaps::two_phase()
            } else {
                DriverCaps::one_phase()
            }
        }

        fn commit(&self, _p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&self, _p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn prepare(
            &self,
            _p: &ParticipantHandle,
            _id: &FdwXactId,
        ) -> std::result::Result<(), DriverError> {
            if self.fail_prepare {
                return Err(DriverError::Transient("prepare refused".into()));
            }
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resolve(
            &self,
            _p: &ParticipantHandle,
            _id: &FdwXactId,
            _commit: bool,
        ) -> std::result::Result<ResolveOutcome, DriverError> {
            if self.fail_resolve {
                return Err(DriverError::Transient("resolve refused".into()));
            }
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(ResolveOutcome::Resolved)
        }
    }

    fn test_state(dir: &std::path::Path) -> Arc<SharedState> {
        SharedState::new(Config {
            data_dir: dir.to_path_buf(),
            max_prepared_foreign_xacts: 8,
            max_foreign_xact_resolvers: 2,
            foreign_twophase_commit: ForeignTwophaseCommit::Required,
            ..Config::default()
        })
        .unwrap()
    }

    fn bind(state: &SharedState, driver: Arc<MockDriver>, serverid: ServerId) {
        // Each server gets a distinctly named adapter so the registry can
        // hold differently-behaving mocks side by side.
        struct Named(Arc<MockDriver>, String);
        impl ParticipantDriver for Named {
            fn name(&self) -> &str {
                &self.1
            }
            fn caps(&self) -> DriverCaps {
                self.0.caps()
            }
            fn commit(&self, p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
                self.0.commit(p)
            }
            fn rollback(&self, p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
                self.0.rollback(p)
            }
            fn prepare(
                &self,
                p: &ParticipantHandle,
                id: &FdwXactId,
            ) -> std::result::Result<(), DriverError> {
                self.0.prepare(p, id)
            }
            fn resolve(
                &self,
                p: &ParticipantHandle,
                id: &FdwXactId,
                commit: bool,
            ) -> std::result::Result<ResolveOutcome, DriverError> {
                self.0.resolve(p, id, commit)
            }
        }
        let name = format!("mock_{serverid}");
        state.drivers.register(Arc::new(Named(driver, name.clone())));
        state.drivers.bind_server(serverid, &name).unwrap();
    }

    #[test]
    fn test_single_readonly_participant_skips_two_phase() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let driver = Arc::new(MockDriver::two_phase());
        bind(&state, Arc::clone(&driver), 1);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, false).unwrap();
        let xid = state.xact.assign_xid();
        parts.pre_commit(&state, xid, true).unwrap();
        parts.at_eoxact(&state, xid, true).unwrap();

        assert_eq!(driver.prepares.load(Ordering::SeqCst), 0);
        assert_eq!(driver.commits.load(Ordering::SeqCst), 1);
        assert_eq!(state.fdwxact.snapshot().len(), 0);
    }

    #[test]
    fn test_two_modifying_participants_are_prepared_and_resolved() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let d1 = Arc::new(MockDriver::two_phase());
        let d2 = Arc::new(MockDriver::two_phase());
        bind(&state, Arc::clone(&d1), 1);
        bind(&state, Arc::clone(&d2), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        parts.pre_commit(&state, xid, false).unwrap();
        assert_eq!(state.fdwxact.snapshot().len(), 2);

        state.xact.commit(&state.wal, xid).unwrap();
        parts.at_eoxact(&state, xid, true).unwrap();

        assert_eq!(d1.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(d1.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(d2.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(state.fdwxact.snapshot().len(), 0);
    }

    #[test]
    fn test_required_mode_rejects_one_phase_only_participant() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        bind(&state, Arc::new(MockDriver::two_phase()), 1);
        bind(&state, Arc::new(MockDriver::default()), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        match parts.pre_commit(&state, xid, false) {
            Err(FedXactError::TwoPhaseUnsupported { serverid: 2 }) => {}
            other => panic!("expected TwoPhaseUnsupported, got {:?}", other),
        }
        assert_eq!(state.fdwxact.snapshot().len(), 0);
    }

    #[test]
    fn test_disabled_mode_rejects_distributed_modification() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        {
            state.config.write().foreign_twophase_commit = ForeignTwophaseCommit::Disabled;
        }
        bind(&state, Arc::new(MockDriver::two_phase()), 1);
        bind(&state, Arc::new(MockDriver::two_phase()), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        assert!(matches!(
            parts.pre_commit(&state, xid, false),
            Err(FedXactError::TwoPhaseNotAllowed { participants: 2 })
        ));
    }

    #[test]
    fn test_prefer_mode_mixes_prepare_and_one_phase() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        {
            state.config.write().foreign_twophase_commit = ForeignTwophaseCommit::Prefer;
        }
        let capable = Arc::new(MockDriver::two_phase());
        let plain = Arc::new(MockDriver::default());
        bind(&state, Arc::clone(&capable), 1);
        bind(&state, Arc::clone(&plain), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        parts.pre_commit(&state, xid, false).unwrap();
        parts.at_eoxact(&state, xid, true).unwrap();

        assert_eq!(capable.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(capable.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(plain.commits.load(Ordering::SeqCst), 1);
        assert_eq!(state.fdwxact.snapshot().len(), 0);
    }

    #[test]
    fn test_prepare_failure_aborts_everything() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let good = Arc::new(MockDriver::two_phase());
        let bad = Arc::new(MockDriver {
            two_phase: true,
            fail_prepare: true,
            ..MockDriver::default()
        });
        bind(&state, Arc::clone(&good), 1);
        bind(&state, Arc::clone(&bad), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        assert!(parts.pre_commit(&state, xid, false).is_err());
        // The successfully prepared participant was rolled back and no
        // entries survive.
        assert_eq!(good.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(state.fdwxact.snapshot().len(), 0);
    }

    #[test]
    fn test_resolve_failure_leaves_indoubt_entry() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let flaky = Arc::new(MockDriver {
            two_phase: true,
            fail_resolve: true,
            ..MockDriver::default()
        });
        bind(&state, Arc::clone(&flaky), 1);
        bind(&state, Arc::new(MockDriver::two_phase()), 2);

        let mut parts = FdwXactParticipants::new(0, 1);
        parts.register(&state, 1, 10, true).unwrap();
        parts.register(&state, 2, 10, true).unwrap();

        let xid = state.xact.assign_xid();
        parts.pre_commit(&state, xid, false).unwrap();
        state.xact.commit(&state.wal, xid).unwrap();
        parts.at_eoxact(&state, xid, true).unwrap();

        let survivors = state.fdwxact.snapshot();
        assert_eq!(survivors.len(), 1);
        let entry = &survivors[0].1;
        assert_eq!(entry.serverid, 1);
        assert_eq!(entry.state.status, FdwXactStatus::Prepared);
        assert!(entry.state.indoubt);
        assert!(entry.state.owner.is_none());
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let entry = |sid| {
            FdwXactEntry::new(7, 1, sid, 3, 4, FdwXactId::new(&b"x"[..]).unwrap(), None)
        };
        state.fdwxact.insert(entry(2)).unwrap();
        assert!(matches!(
            state.fdwxact.insert(entry(2)),
            Err(FedXactError::DuplicateEntry { .. })
        ));
        state.fdwxact.insert(entry(3)).unwrap();
    }

    #[test]
    fn test_pool_exhaustion_reports_slot_error() {
        let dir = tempdir().unwrap();
        let control = FdwXactControl::new(1, dir.path().to_path_buf());
        let entry = |sid| {
            FdwXactEntry::new(7, 1, sid, 3, 4, FdwXactId::new(&b"x"[..]).unwrap(), None)
        };
        control.insert(entry(1)).unwrap();
        assert!(matches!(
            control.insert(entry(2)),
            Err(FedXactError::SlotExhausted { kind: "entry" })
        ));
    }
}
