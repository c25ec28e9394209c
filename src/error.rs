//! Crate-wide error types.
//!
//! Structured error handling for the coordination subsystems using
//! `thiserror`. Each variant captures the context needed to decide the
//! handling policy: fatal errors abort the local commit (or the server),
//! retriable ones are downgraded to warnings and inherited by a resolver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::{DatabaseId, ServerId, TransactionId};

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, FedXactError>;

/// Comprehensive error type for the foreign transaction and commit-wait
/// subsystems.
#[derive(Debug, Error)]
pub enum FedXactError {
    // =========================================================================
    // Two-phase commit eligibility
    // =========================================================================
    /// A modifying participant cannot prepare, yet two-phase commit is
    /// required.
    #[error("cannot commit: foreign server {serverid} does not support two-phase commit")]
    TwoPhaseUnsupported { serverid: ServerId },

    /// The transaction needs atomic commit across participants but
    /// two-phase commit is disabled.
    #[error("cannot commit: transaction touched {participants} modifying participants but foreign_twophase_commit is disabled")]
    TwoPhaseNotAllowed { participants: usize },

    // =========================================================================
    // Driver failures
    // =========================================================================
    /// A participant driver reported a retryable failure.
    #[error("foreign server {serverid} failed to {action}: {reason}")]
    DriverFailed {
        serverid: ServerId,
        action: &'static str,
        reason: String,
    },

    /// No driver is bound for the foreign server.
    #[error("no participant driver bound for foreign server {serverid}")]
    DriverNotBound { serverid: ServerId },

    // =========================================================================
    // Capacity
    // =========================================================================
    /// The entry pool or resolver slot table is full.
    #[error("maximum number of foreign transaction {kind}s reached; increase the corresponding setting")]
    SlotExhausted { kind: &'static str },

    /// A non-invalid entry already exists for the same participant key.
    #[error("foreign transaction for (database {dbid}, server {serverid}) already exists")]
    DuplicateEntry { dbid: DatabaseId, serverid: ServerId },

    /// No entry matches the requested transaction.
    #[error("no foreign transaction entry for transaction {xid}")]
    EntryNotFound { xid: TransactionId },

    // =========================================================================
    // Persistence
    // =========================================================================
    /// WAL append/flush or state-directory I/O failure. Fatal.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// A state file failed its CRC check during recovery. Fatal.
    #[error("corrupt foreign transaction state file {path}: CRC expected {expected:08x}, found {actual:08x}")]
    StateFileCorrupt {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    /// A state file is structurally invalid. Fatal.
    #[error("invalid foreign transaction state file {path}: {reason}")]
    StateFileInvalid { path: PathBuf, reason: String },

    /// A prepared-transaction identifier exceeds the wire bound.
    #[error("prepared transaction identifier is {len} bytes, above the 200 byte limit")]
    IdentifierTooLong { len: usize },

    // =========================================================================
    // Workers
    // =========================================================================
    // Synchronous replication cancellation is deliberately absent here:
    // once the local flush happened the transaction is durable, so the
    // wait engine reports cancellation as a result, never as an error.
    /// No resolver is running for the database.
    #[error("no foreign transaction resolver is running for database {dbid}")]
    ResolverNotRunning { dbid: DatabaseId },

    /// Waiting for a resolver or its slot timed out.
    #[error("timed out waiting for {what}")]
    WaitTimeout { what: &'static str },

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Invalid configuration value or combination.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FedXactError {
    pub fn driver_failed(serverid: ServerId, action: &'static str, reason: impl Into<String>) -> Self {
        FedXactError::DriverFailed {
            serverid,
            action,
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        FedXactError::Config(message.into())
    }

    /// Fatal errors abort the server (or, before an entry is valid, the
    /// local commit). Everything else is downgraded to a warning once the
    /// entry is durable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FedXactError::Io(_)
                | FedXactError::StateFileCorrupt { .. }
                | FedXactError::StateFileInvalid { .. }
        )
    }

    /// True if a resolver retry can make progress on this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FedXactError::DriverFailed { .. })
    }
}
