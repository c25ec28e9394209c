// Resolver worker.
//
// One per database, launched on demand. The main loop drains due waiters
// from the resolution queue, claims the matching entries for exclusive
// finalize attempts, drives the participant drivers, and wakes the
// waiting backends. After the queue is drained it runs an in-doubt pass
// over orphaned entries, recovering the commit/abort intent from the
// local commit log. A resolver with no work for the configured timeout
// detaches its slot and exits; the launcher restarts it when needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::common::{DatabaseId, SharedState};
use crate::error::{FedXactError, Result};
use crate::fdwxact::entry::FdwXactStatus;
use crate::fdwxact::driver::ParticipantHandle;
use crate::fdwxact::queue::Waiter;
use crate::xact::XactOutcome;

/// Upper bound on one latch sleep, so postmaster death and shutdown flags
/// are noticed promptly.
const MAX_SLEEP: Duration = Duration::from_secs(1);

pub fn resolver_main(state: Arc<SharedState>, slot_idx: usize) {
    let (dbid, latch, flags) = state.resolvers.slot_context(slot_idx);
    info!(dbid, "foreign transaction resolver started");

    let mut last_work = Instant::now();
    loop {
        latch.reset();
        if flags.shutdown_requested() || !state.postmaster_alive() {
            break;
        }

        // Drain every waiter whose deadline is due.
        loop {
            if flags.shutdown_requested() {
                break;
            }
            let Some(waiter) = state.resolution_queue.get_waiter(dbid, Instant::now()) else {
                break;
            };
            match resolve_for_waiter(&state, slot_idx, &waiter) {
                Ok(resolved) => {
                    if resolved > 0 {
                        last_work = Instant::now();
                    }
                    state.procs.get(waiter.backend).latch.set();
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(dbid, "fatal failure in resolver: {err}");
                    state.procs.get(waiter.backend).latch.set();
                    state.resolvers.detach(slot_idx);
                    return;
                }
                Err(err) if err.is_retriable() => {
                    warn!(
                        dbid,
                        xid = waiter.xid,
                        attempts = waiter.attempts,
                        "resolution attempt failed, backing off: {err}"
                    );
                    let ceiling = state.config.read().foreign_xact_resolution_retry_interval;
                    state.resolution_queue.requeue_with_backoff(waiter, ceiling);
                }
                Err(err) => {
                    // Retrying cannot help (e.g. no driver is bound for
                    // the server). Drop the waiter instead of looping on
                    // backoff; the backend surfaces its own timeout and
                    // the entries stay for operator intervention.
                    tracing::error!(
                        dbid,
                        xid = waiter.xid,
                        "resolution failed with a non-retriable error: {err}"
                    );
                    state.procs.get(waiter.backend).latch.set();
                }
            }
        }

        // In-doubt pass for orphaned entries of this database.
        match resolve_indoubt(&state, slot_idx, dbid) {
            Ok(resolved) if resolved > 0 => last_work = Instant::now(),
            Ok(_) => {}
            Err(err) => warn!(dbid, "in-doubt resolution pass failed: {err}"),
        }

        // Idle exit.
        let (timeout_enabled, timeout) = {
            let config = state.config.read();
            (
                config.resolver_timeout_enabled(),
                config.foreign_xact_resolver_timeout,
            )
        };
        if timeout_enabled
            && last_work.elapsed() >= timeout
            && !state.resolution_queue.has_waiter(dbid)
        {
            debug!(dbid, "resolver idle timeout reached");
            break;
        }

        let mut sleep = if timeout_enabled {
            timeout.saturating_sub(last_work.elapsed())
        } else {
            MAX_SLEEP
        };
        if let Some(deadline) = state.resolution_queue.next_deadline(dbid) {
            sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
        }
        latch.wait(sleep.clamp(Duration::from_millis(10), MAX_SLEEP));
    }

    state.resolvers.detach(slot_idx);
    info!(dbid, "foreign transaction resolver exiting");
}

/// Claims and finalizes every entry of the waiter's transaction. Returns
/// the number of entries resolved; on a driver failure every claimed entry
/// is released for a later attempt.
fn resolve_for_waiter(state: &SharedState, slot_idx: usize, waiter: &Waiter) -> Result<usize> {
    let held = state.fdwxact.claim_for_resolution(waiter.dbid, waiter.xid);
    resolve_held(state, slot_idx, &held, waiter.commit_requested)
}

/// Finalizes the in-doubt entries of the database, one attempt each. The
/// commit decision comes from the local commit log; an entry whose
/// transaction has no recorded outcome is committed on resurrection.
fn resolve_indoubt(state: &SharedState, slot_idx: usize, dbid: DatabaseId) -> Result<usize> {
    let (_, _, flags) = state.resolvers.slot_context(slot_idx);
    let held = state.fdwxact.claim_indoubt(dbid);
    let mut resolved = 0;
    for idx in held {
        if flags.shutdown_requested() {
            state.fdwxact.clear_inprocessing(idx);
            continue;
        }
        let Some(entry) = state.fdwxact.with_entry(idx, |e| e.clone()) else {
            continue;
        };
        let commit = recovered_intent(state, &entry.state.status, entry.local_xid);
        match finalize_entry(state, slot_idx, idx, commit) {
            Ok(()) => resolved += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) if err.is_retriable() => {
                warn!(
                    dbid,
                    xid = entry.local_xid,
                    serverid = entry.serverid,
                    "in-doubt entry left for the next pass: {err}"
                );
                state.fdwxact.clear_inprocessing(idx);
            }
            Err(err) => {
                tracing::error!(
                    dbid,
                    xid = entry.local_xid,
                    serverid = entry.serverid,
                    "in-doubt entry cannot be resolved without intervention: {err}"
                );
                state.fdwxact.clear_inprocessing(idx);
            }
        }
    }
    Ok(resolved)
}

/// The commit/abort decision for an orphaned entry.
fn recovered_intent(state: &SharedState, status: &FdwXactStatus, xid: u32) -> bool {
    match state.xact.outcome(xid) {
        XactOutcome::Committed => true,
        XactOutcome::Aborted => false,
        XactOutcome::InProgress => match status {
            FdwXactStatus::Committing => true,
            FdwXactStatus::Aborting => false,
            // No recorded outcome and no recorded intent: the participant
            // durably prepared, so the distributed transaction is taken to
            // have committed (commit on resurrection).
            _ => true,
        },
    }
}

fn resolve_held(
    state: &SharedState,
    slot_idx: usize,
    held: &[usize],
    commit: bool,
) -> Result<usize> {
    let mut resolved = 0;
    for (pos, &idx) in held.iter().enumerate() {
        match finalize_entry(state, slot_idx, idx, commit) {
            Ok(()) => resolved += 1,
            Err(err) => {
                // Release this and every remaining claim before bailing.
                for &rest in &held[pos..] {
                    state.fdwxact.clear_inprocessing(rest);
                }
                return Err(err);
            }
        }
    }
    Ok(resolved)
}

/// One finalize attempt on one claimed entry.
fn finalize_entry(state: &SharedState, slot_idx: usize, idx: usize, commit: bool) -> Result<()> {
    let Some(entry) = state.fdwxact.with_entry(idx, |e| e.clone()) else {
        return Ok(());
    };
    let driver = state.drivers.driver_for(entry.serverid)?;

    state.fdwxact.with_entry(idx, |e| {
        e.state.status = if commit {
            FdwXactStatus::Committing
        } else {
            FdwXactStatus::Aborting
        };
    });
    let handle = ParticipantHandle {
        xid: entry.local_xid,
        serverid: entry.serverid,
        userid: entry.userid,
        umid: entry.umid,
    };
    match driver.resolve(&handle, &entry.fdwxact_id, commit) {
        Ok(_) => {
            state.fdwxact.remove_entry(&state.wal, idx)?;
            state.resolvers.record_resolution(slot_idx, true);
            debug!(
                xid = entry.local_xid,
                serverid = entry.serverid,
                commit,
                "resolved prepared foreign transaction"
            );
            Ok(())
        }
        Err(err) => {
            state.fdwxact.with_entry(idx, |e| {
                e.state.status = FdwXactStatus::Prepared;
            });
            state.resolvers.record_resolution(slot_idx, false);
            Err(FedXactError::driver_failed(
                entry.serverid,
                "resolve",
                err.to_string(),
            ))
        }
    }
}
