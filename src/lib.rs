// FedXact: federated transaction coordination for database engines.
//
// Two cooperating subsystems around one design idiom (a primary-side wait
// queue drained by a background worker):
//
// - **Foreign transaction management**: atomic commit across foreign data
//   sources via two-phase commit, with durable participant entries, WAL
//   and state-file persistence, crash recovery, and a launcher/resolver
//   worker pair that finalizes prepared participants.
// - **Synchronous replication commit wait**: committing backends park on
//   LSN-ordered queues after the local flush; replication senders release
//   them as the standby group acknowledges progress.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`common`] | Identifier types, latch, interrupt flags, shared state |
// | [`config`] | Runtime configuration and validation |
// | [`error`] | Crate-wide error types |
// | [`wal`] | Append-only log: records, flush, replay |
// | [`xact`] | Local-transaction collaborator (xids, commit log) |
// | [`fdwxact`] | Foreign transaction manager, resolver, launcher |
// | [`syncrep`] | Synchronous replication wait engine |
// | [`views`] | Observability rows and privileged controls |
//
// # Quick Start
//
// ```rust,ignore
// use fedxact::{Config, SharedState};
// use fedxact::fdwxact::{self, FdwXactParticipants};
//
// let state = SharedState::new(config)?;
// fdwxact::startup(&state)?;                    // crash recovery
// let launcher = fdwxact::start_launcher(Arc::clone(&state))?;
//
// // Per backend, per local transaction:
// let mut parts = FdwXactParticipants::new(backend_id, dbid);
// parts.register(&state, serverid, userid, /*modified*/ true)?;
// parts.pre_commit(&state, xid, /*local_modified*/ true)?;
// let commit_lsn = state.xact.commit(&state.wal, xid)?;
// parts.at_eoxact(&state, xid, /*is_commit*/ true)?;
// fedxact::syncrep::wait_for_lsn(&state, backend_id, commit_lsn);
// ```

pub mod common;
pub mod config;
pub mod error;
pub mod fdwxact;
pub mod syncrep;
pub mod views;
pub mod wal;
pub mod xact;

// Core types
pub use common::{
    BackendId, DatabaseId, FdwXactId, Latch, LatchWait, Lsn, ProcArena, ServerId, SharedState,
    TransactionId, UserId, UserMappingId, INVALID_LSN, INVALID_XID,
};

// Configuration
pub use config::{Config, ForeignTwophaseCommit, SynchronousCommit};

// Error types
pub use error::{FedXactError, Result};

// Foreign transaction management
pub use fdwxact::{
    DriverCaps, DriverError, FdwXactParticipants, FdwXactStatus, ParticipantDriver,
    ParticipantHandle, ResolveOutcome,
};

// Synchronous replication
pub use syncrep::{SyncRepState, SyncRepWaitMode, SyncRepWaitResult};

// Observability
pub use views::{foreign_xacts, resolver_stats, stop_foreign_xact_resolver};
