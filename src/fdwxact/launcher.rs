// Resolver launcher.
//
// A single long-lived worker that owns the resolver slot table. On wakeup
// it scans for databases that need a resolver (queued waiters, or valid
// entries not yet in doubt) and launches at most one worker per pass,
// throttled by the resolution retry interval. Explicit requests from
// backends bypass the throttle. Reload requests are honored between
// passes.
//
// The slot table itself (FdwXactResolverLock level) is a fixed array of
// per-slot locks; the launcher is the only structural claimer, resolvers
// detach their own slot on exit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{DatabaseId, InterruptFlags, Latch, SharedState};
use crate::error::{FedXactError, Result};
use crate::fdwxact::resolver;

/// Work counters for one resolver slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverStats {
    pub resolutions: u64,
    pub failures: u64,
}

/// One resolver worker slot.
pub struct ResolverSlot {
    /// Worker token; zero when the slot is free.
    pub pid: u64,
    pub dbid: DatabaseId,
    pub in_use: bool,
    pub latch: Arc<Latch>,
    pub flags: Arc<InterruptFlags>,
    pub last_resolved_time: Option<SystemTime>,
    pub stats: ResolverStats,
}

impl ResolverSlot {
    fn empty() -> Self {
        Self {
            pid: 0,
            dbid: 0,
            in_use: false,
            latch: Arc::new(Latch::new()),
            flags: Arc::new(InterruptFlags::new()),
            last_resolved_time: None,
            stats: ResolverStats::default(),
        }
    }
}

/// Snapshot row for the observability surface.
#[derive(Debug, Clone)]
pub struct ResolverSlotInfo {
    pub pid: u64,
    pub dbid: DatabaseId,
    pub last_resolved_time: Option<SystemTime>,
    pub stats: ResolverStats,
}

/// The resolver slot table plus the launcher's own control handles.
pub struct ResolverTable {
    slots: Box<[Mutex<ResolverSlot>]>,
    pub launcher_latch: Latch,
    pub launcher_flags: InterruptFlags,
    pending_requests: Mutex<HashSet<DatabaseId>>,
    last_launch: Mutex<Option<Instant>>,
    next_pid: AtomicU64,
}

impl ResolverTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Mutex::new(ResolverSlot::empty()));
        Self {
            slots: slots.into_boxed_slice(),
            launcher_latch: Latch::new(),
            launcher_flags: InterruptFlags::new(),
            pending_requests: Mutex::new(HashSet::new()),
            last_launch: Mutex::new(None),
            next_pid: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the in-use slot covering `dbid`, if any.
    pub fn slot_for_db(&self, dbid: DatabaseId) -> Option<usize> {
        (0..self.slots.len()).find(|&i| {
            let slot = self.slots[i].lock();
            slot.in_use && slot.dbid == dbid
        })
    }

    /// Sets the latch of the resolver covering `dbid`. Returns false when
    /// none is running.
    pub fn wakeup_resolver(&self, dbid: DatabaseId) -> bool {
        match self.slot_for_db(dbid) {
            Some(idx) => {
                self.slots[idx].lock().latch.set();
                true
            }
            None => false,
        }
    }

    /// Claims a free slot for a new resolver. At most one slot per
    /// database may be in use.
    fn claim(&self, dbid: DatabaseId) -> Result<(usize, Arc<Latch>, Arc<InterruptFlags>)> {
        if self.slot_for_db(dbid).is_some() {
            // Raced with an already-running resolver; nothing to do.
            return Err(FedXactError::ResolverNotRunning { dbid });
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.in_use {
                continue;
            }
            slot.pid = self.next_pid.fetch_add(1, Ordering::AcqRel);
            slot.dbid = dbid;
            slot.in_use = true;
            slot.latch = Arc::new(Latch::new());
            slot.flags = Arc::new(InterruptFlags::new());
            slot.last_resolved_time = None;
            slot.stats = ResolverStats::default();
            return Ok((idx, Arc::clone(&slot.latch), Arc::clone(&slot.flags)));
        }
        Err(FedXactError::SlotExhausted { kind: "resolver" })
    }

    /// Releases a slot; called by the resolver itself on exit.
    pub fn detach(&self, idx: usize) {
        let mut slot = self.slots[idx].lock();
        slot.in_use = false;
        slot.pid = 0;
    }

    /// The context a resolver worker needs for its main loop.
    pub fn slot_context(&self, idx: usize) -> (DatabaseId, Arc<Latch>, Arc<InterruptFlags>) {
        let slot = self.slots[idx].lock();
        (slot.dbid, Arc::clone(&slot.latch), Arc::clone(&slot.flags))
    }

    /// Records the outcome of one finalize attempt.
    pub fn record_resolution(&self, idx: usize, success: bool) {
        let mut slot = self.slots[idx].lock();
        if success {
            slot.stats.resolutions += 1;
            slot.last_resolved_time = Some(SystemTime::now());
        } else {
            slot.stats.failures += 1;
        }
    }

    /// Rows for the active slots.
    pub fn snapshot(&self) -> Vec<ResolverSlotInfo> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                slot.in_use.then(|| ResolverSlotInfo {
                    pid: slot.pid,
                    dbid: slot.dbid,
                    last_resolved_time: slot.last_resolved_time,
                    stats: slot.stats,
                })
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().in_use).count()
    }

    fn add_pending_request(&self, dbid: DatabaseId) {
        self.pending_requests.lock().insert(dbid);
    }

    fn drain_pending_requests(&self) -> Vec<DatabaseId> {
        self.pending_requests.lock().drain().collect()
    }

    fn throttle_open(&self, interval: Duration) -> bool {
        self.last_launch
            .lock()
            .map_or(true, |at| at.elapsed() >= interval)
    }

    fn note_launch(&self) {
        *self.last_launch.lock() = Some(Instant::now());
    }
}

impl std::fmt::Debug for ResolverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverTable")
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}

// ============================================================================
// Launcher worker
// ============================================================================

/// Handle to the running launcher thread.
pub struct LauncherHandle {
    thread: Option<JoinHandle<()>>,
}

impl LauncherHandle {
    /// Requests shutdown of the launcher and every resolver, then joins
    /// the launcher. Resolver slots are waited out for up to `grace`.
    pub fn stop(mut self, state: &SharedState, grace: Duration) -> Result<()> {
        state.resolvers.launcher_flags.request_shutdown();
        state.resolvers.launcher_latch.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        stop_all_resolvers(state, grace)
    }
}

/// Spawns the launcher.
pub fn start_launcher(state: Arc<SharedState>) -> Result<LauncherHandle> {
    let thread = thread::Builder::new()
        .name("fdwxact-launcher".into())
        .spawn(move || launcher_main(state))?;
    Ok(LauncherHandle {
        thread: Some(thread),
    })
}

fn launcher_main(state: Arc<SharedState>) {
    info!("foreign transaction resolver launcher started");
    loop {
        state.resolvers.launcher_latch.reset();
        if state.resolvers.launcher_flags.shutdown_requested() || !state.postmaster_alive() {
            break;
        }
        if state.resolvers.launcher_flags.take_reload() {
            let config = state.config.read().clone();
            match config.validate() {
                Ok(()) => info!("launcher reloaded configuration"),
                Err(err) => warn!("configuration reload rejected: {err}"),
            }
        }
        state.resolvers.launcher_flags.take_wakeup();

        let retry_interval = state.config.read().foreign_xact_resolution_retry_interval;

        // Explicit requests bypass the launch throttle.
        for dbid in state.resolvers.drain_pending_requests() {
            ensure_resolver(&state, dbid);
        }

        // Scan pass: one throttled launch per wakeup.
        if state.resolvers.throttle_open(retry_interval) {
            let mut candidates = state.resolution_queue.databases_with_waiters();
            for dbid in state.fdwxact.databases_needing_resolver() {
                if !candidates.contains(&dbid) {
                    candidates.push(dbid);
                }
            }
            for dbid in candidates {
                if state.resolvers.slot_for_db(dbid).is_none() {
                    ensure_resolver(&state, dbid);
                    break;
                }
            }
        }

        state
            .resolvers
            .launcher_latch
            .wait(retry_interval.min(Duration::from_secs(1)));
    }
    info!("foreign transaction resolver launcher shutting down");
}

/// Launches a resolver for `dbid` unless one is already covering it.
fn ensure_resolver(state: &Arc<SharedState>, dbid: DatabaseId) {
    if state.resolvers.wakeup_resolver(dbid) {
        return;
    }
    let (idx, _latch, _flags) = match state.resolvers.claim(dbid) {
        Ok(claimed) => claimed,
        Err(FedXactError::ResolverNotRunning { .. }) => return,
        Err(err) => {
            warn!(dbid, "cannot launch foreign transaction resolver: {err}");
            return;
        }
    };
    state.resolvers.note_launch();
    let worker_state = Arc::clone(state);
    let spawned = thread::Builder::new()
        .name(format!("fdwxact-resolver-{dbid}"))
        .spawn(move || resolver::resolver_main(worker_state, idx));
    match spawned {
        Ok(_) => debug!(dbid, slot = idx, "launched foreign transaction resolver"),
        Err(err) => {
            warn!(dbid, "failed to spawn resolver thread: {err}");
            state.resolvers.detach(idx);
        }
    }
}

/// Wakes the resolver covering `dbid`, or asks the launcher to start one.
/// The launcher treats such requests as explicit and skips the throttle.
pub fn launch_or_wakeup(state: &SharedState, dbid: DatabaseId) {
    if state.resolvers.wakeup_resolver(dbid) {
        return;
    }
    state.resolvers.add_pending_request(dbid);
    state.resolvers.launcher_flags.request_wakeup();
    state.resolvers.launcher_latch.set();
}

/// Requests shutdown of every running resolver and waits for the slots to
/// clear.
pub fn stop_all_resolvers(state: &SharedState, grace: Duration) -> Result<()> {
    for idx in 0..state.resolvers.capacity() {
        let (_, latch, flags) = state.resolvers.slot_context(idx);
        flags.request_shutdown();
        latch.set();
    }
    let deadline = Instant::now() + grace;
    while state.resolvers.active_count() > 0 {
        if Instant::now() >= deadline {
            return Err(FedXactError::WaitTimeout {
                what: "resolver shutdown",
            });
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}
