// Shared harness for the integration tests: an instrumented mock
// participant driver and shared-state construction over a temporary
// directory.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fedxact::fdwxact::{DriverCaps, DriverError, ParticipantDriver, ParticipantHandle, ResolveOutcome};
use fedxact::{Config, FdwXactId, ForeignTwophaseCommit, SharedState};

/// A scriptable participant driver that tracks the prepared-transaction
/// set it would hold remotely, so resolve is genuinely idempotent: a
/// second resolve of the same identifier reports `Missing`.
pub struct MockDriver {
    name: String,
    two_phase: bool,
    /// While set, resolve reports a transient failure.
    pub fail_resolve: AtomicBool,
    pub prepares: AtomicU32,
    pub resolves: AtomicU32,
    pub missing: AtomicU32,
    pub commits: AtomicU32,
    pub rollbacks: AtomicU32,
    /// Commit flags seen by successful resolves, in order.
    pub resolved_commits: Mutex<Vec<bool>>,
    prepared: Mutex<HashSet<Vec<u8>>>,
}

impl MockDriver {
    pub fn two_phase(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name, true))
    }

    pub fn one_phase(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name, false))
    }

    fn new(name: &str, two_phase: bool) -> Self {
        Self {
            name: name.to_string(),
            two_phase,
            fail_resolve: AtomicBool::new(false),
            prepares: AtomicU32::new(0),
            resolves: AtomicU32::new(0),
            missing: AtomicU32::new(0),
            commits: AtomicU32::new(0),
            rollbacks: AtomicU32::new(0),
            resolved_commits: Mutex::new(Vec::new()),
            prepared: Mutex::new(HashSet::new()),
        }
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.lock().len()
    }
}

impl ParticipantDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> DriverCaps {
        if self.two_phase {
            DriverCaps::two_phase()
        } else {
            DriverCaps::one_phase()
        }
    }

    fn commit(&self, _p: &ParticipantHandle) -> Result<(), DriverError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self, _p: &ParticipantHandle) -> Result<(), DriverError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn prepare(&self, _p: &ParticipantHandle, id: &FdwXactId) -> Result<(), DriverError> {
        if !self.two_phase {
            return Err(DriverError::Unsupported);
        }
        self.prepares.fetch_add(1, Ordering::SeqCst);
        self.prepared.lock().insert(id.as_bytes().to_vec());
        Ok(())
    }

    fn resolve(
        &self,
        _p: &ParticipantHandle,
        id: &FdwXactId,
        commit: bool,
    ) -> Result<ResolveOutcome, DriverError> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(DriverError::Transient("injected resolve failure".into()));
        }
        if self.prepared.lock().remove(id.as_bytes()) {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            self.resolved_commits.lock().push(commit);
            Ok(ResolveOutcome::Resolved)
        } else {
            self.missing.fetch_add(1, Ordering::SeqCst);
            Ok(ResolveOutcome::Missing)
        }
    }
}

/// Shared state over `dir` with two-phase commit required and snappy
/// worker intervals, suitable for end-to-end tests.
pub fn test_state(dir: &Path) -> Arc<SharedState> {
    state_with(dir, |_| {})
}

pub fn state_with(dir: &Path, adjust: impl FnOnce(&mut Config)) -> Arc<SharedState> {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        max_prepared_foreign_xacts: 16,
        max_foreign_xact_resolvers: 4,
        foreign_twophase_commit: ForeignTwophaseCommit::Required,
        foreign_xact_resolution_retry_interval: Duration::from_millis(50),
        foreign_xact_resolver_timeout: Duration::from_millis(60_000),
        ..Config::default()
    };
    adjust(&mut config);
    SharedState::new(config).expect("shared state construction")
}

/// Registers the driver under its own name and binds the server to it.
pub fn bind(state: &SharedState, driver: Arc<MockDriver>, serverid: u32) {
    let name = driver.name.clone();
    state.drivers.register(driver);
    state.drivers.bind_server(serverid, &name).expect("bind server");
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
