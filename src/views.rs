//! Observability surface.
//!
//! Set-returning accessors over the shared state, shaped the way a SQL
//! layer would expose them, plus the privileged resolver stop.

use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::common::{DatabaseId, ServerId, SharedState, TransactionId, UserId};
use crate::error::{FedXactError, Result};
use crate::fdwxact::entry::FdwXactStatus;

/// One row per foreign transaction entry.
#[derive(Debug, Clone, Serialize)]
pub struct ForeignXactRow {
    pub xid: TransactionId,
    pub dbid: DatabaseId,
    pub serverid: ServerId,
    pub userid: UserId,
    pub status: FdwXactStatus,
    pub indoubt: bool,
    pub ondisk: bool,
}

/// Every live foreign transaction entry.
pub fn foreign_xacts(state: &SharedState) -> Vec<ForeignXactRow> {
    state
        .fdwxact
        .snapshot()
        .into_iter()
        .map(|(_, entry)| ForeignXactRow {
            xid: entry.local_xid,
            dbid: entry.dbid,
            serverid: entry.serverid,
            userid: entry.userid,
            status: entry.state.status,
            indoubt: entry.state.indoubt,
            ondisk: entry.state.ondisk,
        })
        .collect()
}

/// One row per active resolver slot.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverRow {
    pub pid: u64,
    pub dbid: DatabaseId,
    #[serde(skip)]
    pub last_resolved_time: Option<SystemTime>,
    pub resolutions: u64,
    pub failures: u64,
}

/// Statistics for the running resolvers.
pub fn resolver_stats(state: &SharedState) -> Vec<ResolverRow> {
    state
        .resolvers
        .snapshot()
        .into_iter()
        .map(|info| ResolverRow {
            pid: info.pid,
            dbid: info.dbid,
            last_resolved_time: info.last_resolved_time,
            resolutions: info.stats.resolutions,
            failures: info.stats.failures,
        })
        .collect()
}

/// Privileged: asks the resolver for `dbid` to terminate and waits for its
/// slot to clear.
pub fn stop_foreign_xact_resolver(
    state: &SharedState,
    dbid: DatabaseId,
    timeout: Duration,
) -> Result<()> {
    let Some(idx) = state.resolvers.slot_for_db(dbid) else {
        return Err(FedXactError::ResolverNotRunning { dbid });
    };
    let (_, latch, flags) = state.resolvers.slot_context(idx);
    flags.request_shutdown();
    latch.set();

    let deadline = Instant::now() + timeout;
    while state.resolvers.slot_for_db(dbid).is_some() {
        if Instant::now() >= deadline {
            return Err(FedXactError::WaitTimeout {
                what: "resolver stop",
            });
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}
