// Synchronous replication commit wait.
//
// After a backend's commit record is flushed locally it may not return to
// the client until enough standbys acknowledge the commit LSN. The backend
// parks on its latch in an LSN-ordered queue; replication senders release
// waiters as the safe LSN advances. The wait can only delay the
// acknowledgement: the transaction is already locally durable, so every
// cancellation path degrades to local-only durability with a warning,
// never an error.
//
// Safe LSNs are recomputed under the syncrep lock on every release pass
// (never cached across passes), so a waiter above the advertised LSN is
// never released early.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{BackendId, Lsn, SharedState};
use crate::syncrep::queue::{
    SyncRepQueues, SyncRepState, SyncRepWaitMode, NUM_SYNC_REP_WAIT_MODES,
};
use crate::syncrep::standby::{parse_standby_names, synced_lsns, StandbyGroup};

/// Poll granularity of the wait loop; bounds how late postmaster death is
/// noticed, since the dead have no latch to set.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How a commit wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRepWaitResult {
    /// Released by a sender (or by standbys becoming undefined).
    Completed,
    /// Fast path: no wait was needed.
    NotNeeded,
    /// Canceled by termination, query cancel, or postmaster death; the
    /// commit stands with local durability only.
    Canceled,
}

struct SyncRepShared {
    queues: SyncRepQueues,
    /// Per mode: the LSN at or below which every waiter has been released.
    advertised_lsn: [Lsn; NUM_SYNC_REP_WAIT_MODES],
    standbys_defined: bool,
    group: Option<StandbyGroup>,
}

/// The synchronous replication control structure (SyncRepLock inside).
pub struct SyncRepControl {
    shared: Mutex<SyncRepShared>,
    /// Per-backend wait state, readable from the wait loop without the
    /// lock; transitions happen under it.
    states: Box<[AtomicU8]>,
}

impl SyncRepControl {
    pub fn new(max_backends: usize, standby_names: &str) -> Self {
        let group = match parse_standby_names(standby_names) {
            Ok(group) => group,
            Err(err) => {
                warn!("ignoring synchronous_standby_names: {err}");
                None
            }
        };
        let mut states = Vec::with_capacity(max_backends);
        states.resize_with(max_backends, || AtomicU8::new(SyncRepState::NotWaiting.to_u8()));
        Self {
            shared: Mutex::new(SyncRepShared {
                queues: SyncRepQueues::new(max_backends),
                advertised_lsn: [0; NUM_SYNC_REP_WAIT_MODES],
                standbys_defined: group.is_some(),
                group,
            }),
            states: states.into_boxed_slice(),
        }
    }

    pub fn state_of(&self, backend: BackendId) -> SyncRepState {
        SyncRepState::from_u8(self.states[backend].load(Ordering::Acquire))
    }

    fn set_state(&self, backend: BackendId, state: SyncRepState) {
        self.states[backend].store(state.to_u8(), Ordering::Release);
    }

    pub fn advertised_lsn(&self, mode: SyncRepWaitMode) -> Lsn {
        self.shared.lock().advertised_lsn[mode.index()]
    }

    pub fn queue_len(&self, mode: SyncRepWaitMode) -> usize {
        self.shared.lock().queues.len(mode)
    }

    pub fn standbys_defined(&self) -> bool {
        self.shared.lock().standbys_defined
    }

    /// Queue-order invariant check for tests.
    pub fn queue_is_ordered(&self, mode: SyncRepWaitMode) -> bool {
        self.shared.lock().queues.is_strictly_ascending(mode)
    }

    /// Detaches a backend from its queue, clearing its state. Safe to call
    /// whether or not it is still queued.
    fn detach(&self, backend: BackendId) {
        let mut shared = self.shared.lock();
        shared.queues.unlink(backend);
        self.set_state(backend, SyncRepState::NotWaiting);
    }
}

impl std::fmt::Debug for SyncRepControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("SyncRepControl")
            .field("standbys_defined", &shared.standbys_defined)
            .field("advertised_lsn", &shared.advertised_lsn)
            .finish()
    }
}

/// Blocks the backend until the commit LSN is acknowledged under the
/// current wait mode.
///
/// Fast path: returns immediately when no wait mode is configured, no
/// synchronous standbys are defined, or the mode's advertised LSN already
/// covers the commit.
pub fn wait_for_lsn(state: &SharedState, backend: BackendId, commit_lsn: Lsn) -> SyncRepWaitResult {
    let Some(mode) = state.config.read().synchronous_commit.wait_mode() else {
        return SyncRepWaitResult::NotNeeded;
    };

    {
        let mut shared = state.syncrep.shared.lock();
        if !shared.standbys_defined || shared.advertised_lsn[mode.index()] >= commit_lsn {
            return SyncRepWaitResult::NotNeeded;
        }
        state.syncrep.set_state(backend, SyncRepState::Waiting);
        shared.queues.insert(mode, backend, commit_lsn);
    }
    debug!(backend, commit_lsn, ?mode, "waiting for synchronous replication");

    let proc = state.procs.get(backend);
    loop {
        proc.latch.reset();

        if state.syncrep.state_of(backend) == SyncRepState::WaitComplete {
            break;
        }
        if proc.pending.proc_die_pending() {
            // Keep the termination pending; only the wait is abandoned.
            state.syncrep.detach(backend);
            warn!(
                backend,
                commit_lsn,
                "canceling the wait for synchronous replication and terminating the connection; \
                 the transaction committed locally but might not have been replicated"
            );
            return SyncRepWaitResult::Canceled;
        }
        if proc.pending.take_query_cancel() {
            state.syncrep.detach(backend);
            warn!(
                backend,
                commit_lsn,
                "canceling wait for synchronous replication due to user request; \
                 the transaction committed locally but might not have been replicated"
            );
            return SyncRepWaitResult::Canceled;
        }
        if !state.postmaster_alive() {
            proc.pending.set_proc_die();
            state.syncrep.detach(backend);
            return SyncRepWaitResult::Canceled;
        }

        proc.latch.wait(WAIT_SLICE);
    }

    state.syncrep.set_state(backend, SyncRepState::NotWaiting);
    SyncRepWaitResult::Completed
}

/// Called by a replication sender after advancing its reported positions.
/// Recomputes the safe LSNs for the configured group under the lock,
/// promotes the advertised LSN for each mode the sender itself has
/// reached, and wakes every waiter at or below it.
pub fn release_waiters(state: &SharedState, sender_idx: usize) {
    let mut shared = state.syncrep.shared.lock();
    if !shared.standbys_defined {
        return;
    }
    let Some(group) = shared.group.clone() else {
        return;
    };

    let senders = state.walsenders.snapshot();
    let Some((safe_write, safe_flush)) = synced_lsns(&group, &senders) else {
        return;
    };
    let me = &senders[sender_idx];

    let passes = [
        (SyncRepWaitMode::Write, safe_write, me.write_lsn),
        (SyncRepWaitMode::Flush, safe_flush, me.flush_lsn),
    ];
    for (mode, safe_lsn, own_lsn) in passes {
        // A sender never advertises an LSN it has not itself reached.
        if own_lsn < safe_lsn {
            continue;
        }
        let m = mode.index();
        if safe_lsn <= shared.advertised_lsn[m] {
            continue;
        }
        shared.advertised_lsn[m] = safe_lsn;
        let released = shared.queues.drain_upto(mode, safe_lsn);
        if !released.is_empty() {
            debug!(?mode, safe_lsn, count = released.len(), "releasing syncrep waiters");
        }
        for backend in released {
            state.syncrep.set_state(backend, SyncRepState::WaitComplete);
            state.procs.get(backend).latch.set();
        }
    }
}

/// Called when the standby configuration changes. Rebuilds the group tree
/// from the current configuration; when synchronous standbys transition to
/// none, every waiter on every mode is woken unconditionally so it can
/// exit.
pub fn update_sync_standbys_defined(state: &SharedState) {
    let spec = state.config.read().synchronous_standby_names.clone();
    let group = match parse_standby_names(&spec) {
        Ok(group) => group,
        Err(err) => {
            warn!("ignoring synchronous_standby_names on reload: {err}");
            None
        }
    };

    let mut shared = state.syncrep.shared.lock();
    let was_defined = shared.standbys_defined;
    shared.standbys_defined = group.is_some();
    shared.group = group;

    if was_defined && !shared.standbys_defined {
        for mode in SyncRepWaitMode::ALL {
            for backend in shared.queues.drain_all(mode) {
                state.syncrep.set_state(backend, SyncRepState::WaitComplete);
                state.procs.get(backend).latch.set();
            }
        }
        debug!("synchronous standbys undefined; all waiters released");
    }
}
