// # Common Types and Shared State
//
// Shared identifier types, the latch primitive, interrupt flags, the
// backend descriptor arena, and the top-level `SharedState` control object
// that every subsystem hangs off.
//
// ## Lock ordering
//
// Three named reader/writer locks protect the coordination structures.
// They are always acquired outer to inner:
//
// ```text
// FdwXactResolutionLock (resolution queue)
//   > FdwXactResolverLock (resolver slot table)
//     > FdwXactLock (foreign transaction pool)
// ```
//
// `SyncRepLock` is disjoint from the chain above. Per-entry and per-slot
// locks nest inside their enclosing lock, and nothing suspends or performs
// I/O while holding one.

use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{FedXactError, Result};
use crate::fdwxact::driver::DriverRegistry;
use crate::fdwxact::launcher::ResolverTable;
use crate::fdwxact::queue::ResolutionQueue;
use crate::fdwxact::registry::FdwXactControl;
use crate::fdwxact::state_file::FDWXACT_DIR;
use crate::syncrep::standby::WalSenderArray;
use crate::syncrep::SyncRepControl;
use crate::wal::Wal;
use crate::xact::XactManager;

pub mod latch;
pub use latch::{Latch, LatchWait};

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Local transaction identifier, durably assigned and monotone.
pub type TransactionId = u32;

/// Database owning a distributed transaction.
pub type DatabaseId = u32;

/// Foreign-server identity.
pub type ServerId = u32;

/// Authenticating principal.
pub type UserId = u32;

/// User-mapping identity, the key for driver lookups.
pub type UserMappingId = u32;

/// Log sequence number: a monotone byte position in the WAL.
pub type Lsn = u64;

/// Index of a backend descriptor in the process arena.
pub type BackendId = usize;

/// The zero LSN never names a real WAL position.
pub const INVALID_LSN: Lsn = 0;

/// An unassigned transaction id.
pub const INVALID_XID: TransactionId = 0;

// ============================================================================
// Bounded prepared-transaction identifier
// ============================================================================

/// A participant-unique prepared-transaction name, at most 200 bytes.
///
/// The bound is part of the on-disk and WAL formats, so it is enforced at
/// construction rather than at serialization time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FdwXactId(Vec<u8>);

impl FdwXactId {
    /// Upper bound on the identifier length, in bytes.
    pub const MAX_LEN: usize = 200;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > Self::MAX_LEN {
            return Err(FedXactError::IdentifierTooLong { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FdwXactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// ============================================================================
// Interrupt flags
// ============================================================================

/// Control flags for a long-lived worker (launcher, resolver).
///
/// The portable stand-in for signal handlers: producers flip a flag and set
/// the worker's latch; no work happens in the producer's context.
#[derive(Debug, Default)]
pub struct InterruptFlags {
    shutdown: AtomicBool,
    reload: AtomicBool,
    wakeup: AtomicBool,
}

impl InterruptFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Shutdown is sticky; once requested it stays requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    pub fn request_wakeup(&self) {
        self.wakeup.store(true, Ordering::Release);
    }

    pub fn take_wakeup(&self) -> bool {
        self.wakeup.swap(false, Ordering::AcqRel)
    }
}

/// Pending cancellation state for a backend.
#[derive(Debug, Default)]
pub struct BackendFlags {
    query_cancel: AtomicBool,
    proc_die: AtomicBool,
}

impl BackendFlags {
    pub fn set_query_cancel(&self) {
        self.query_cancel.store(true, Ordering::Release);
    }

    pub fn take_query_cancel(&self) -> bool {
        self.query_cancel.swap(false, Ordering::AcqRel)
    }

    pub fn query_cancel_pending(&self) -> bool {
        self.query_cancel.load(Ordering::Acquire)
    }

    pub fn set_proc_die(&self) {
        self.proc_die.store(true, Ordering::Release);
    }

    /// Termination is never cleared by waiting code; the backend's top
    /// level loop is responsible for acting on it.
    pub fn proc_die_pending(&self) -> bool {
        self.proc_die.load(Ordering::Acquire)
    }
}

// ============================================================================
// Process arena
// ============================================================================

/// Descriptor for one backend: its latch and pending interrupt flags.
#[derive(Debug, Default)]
pub struct ProcSlot {
    pub latch: Latch,
    pub pending: BackendFlags,
}

/// Fixed arena of backend descriptors, sized once at startup.
///
/// Waiters and foreign transaction entries refer to backends by index into
/// this arena rather than by owning pointers.
pub struct ProcArena {
    slots: Box<[ProcSlot]>,
}

impl ProcArena {
    pub fn new(max_backends: usize) -> Self {
        let mut slots = Vec::with_capacity(max_backends);
        slots.resize_with(max_backends, ProcSlot::default);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn get(&self, backend: BackendId) -> &ProcSlot {
        &self.slots[backend]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for ProcArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcArena")
            .field("len", &self.slots.len())
            .finish()
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// The process-wide control object.
///
/// Constructed once at initialization time and passed by handle; tests
/// construct private instances over temporary directories. All shared
/// coordination structures are pre-sized here from the configuration, with
/// no dynamic shared allocation afterwards.
pub struct SharedState {
    /// Runtime configuration, reloaded in place.
    pub config: RwLock<Config>,
    /// The write-ahead log.
    pub wal: Wal,
    /// Local-transaction collaborator: xid assignment and the commit log.
    pub xact: XactManager,
    /// Participant driver registry and server bindings.
    pub drivers: DriverRegistry,
    /// Foreign transaction entry pool (FdwXactLock inside).
    pub fdwxact: FdwXactControl,
    /// Resolver slot table and launcher control (FdwXactResolverLock inside).
    pub resolvers: ResolverTable,
    /// Per-database waiter queue (FdwXactResolutionLock inside).
    pub resolution_queue: ResolutionQueue,
    /// Synchronous replication wait queues (SyncRepLock inside).
    pub syncrep: SyncRepControl,
    /// Replication sender slots.
    pub walsenders: WalSenderArray,
    /// Backend descriptors.
    pub procs: ProcArena,
    /// Cleared when the supervising process dies; every blocking loop
    /// checks it.
    postmaster_alive: AtomicBool,
}

impl SharedState {
    /// Builds the control object, creating the data directory, the WAL and
    /// the foreign transaction state directory as needed.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let fdwxact_dir = config.data_dir.join(FDWXACT_DIR);
        fs::create_dir_all(&fdwxact_dir)?;
        let wal = Wal::open_or_create(config.data_dir.join("wal"))?;
        let state = Self {
            wal,
            xact: XactManager::new(),
            drivers: DriverRegistry::new(),
            fdwxact: FdwXactControl::new(config.max_prepared_foreign_xacts, fdwxact_dir),
            resolvers: ResolverTable::new(config.max_foreign_xact_resolvers),
            resolution_queue: ResolutionQueue::new(),
            syncrep: SyncRepControl::new(config.max_backends, &config.synchronous_standby_names),
            walsenders: WalSenderArray::new(config.max_wal_senders),
            procs: ProcArena::new(config.max_backends),
            postmaster_alive: AtomicBool::new(true),
            config: RwLock::new(config),
        };
        Ok(Arc::new(state))
    }

    pub fn postmaster_alive(&self) -> bool {
        self.postmaster_alive.load(Ordering::Acquire)
    }

    /// Simulates loss of the supervising process. Blocking loops notice on
    /// their next pass; there is no waker to rely on once it is gone.
    pub fn declare_postmaster_dead(&self) {
        self.postmaster_alive.store(false, Ordering::Release);
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("postmaster_alive", &self.postmaster_alive())
            .finish()
    }
}
