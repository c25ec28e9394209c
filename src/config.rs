//! Runtime configuration.
//!
//! All knobs that size the shared structures or steer commit-time behavior
//! live here. Capacity settings are read once at `SharedState` construction
//! (the shared structures are pre-sized and never grow); behavior settings
//! are consulted on each use and may be reloaded in place.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FedXactError, Result};
use crate::syncrep::queue::SyncRepWaitMode;

/// Behavior of distributed commit across foreign servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignTwophaseCommit {
    /// Never use two-phase commit; fail commits that would need it.
    Disabled,
    /// Require every modifying participant to support prepare.
    Required,
    /// Prepare the participants that can; one-phase the rest.
    Prefer,
}

impl Default for ForeignTwophaseCommit {
    fn default() -> Self {
        ForeignTwophaseCommit::Disabled
    }
}

/// Synchronous commit level. Selects the replication wait mode applied
/// after the local commit flush, or disables the wait entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronousCommit {
    /// No replication wait; local flush only.
    Off,
    /// Same as `Off` for the wait engine; named for configuration parity.
    Local,
    /// Wait until sync standbys have written the commit record.
    RemoteWrite,
    /// Wait until sync standbys have flushed the commit record.
    On,
}

impl Default for SynchronousCommit {
    fn default() -> Self {
        SynchronousCommit::On
    }
}

impl SynchronousCommit {
    /// The wait mode this level maps to, if it waits at all.
    pub fn wait_mode(self) -> Option<SyncRepWaitMode> {
        match self {
            SynchronousCommit::Off | SynchronousCommit::Local => None,
            SynchronousCommit::RemoteWrite => Some(SyncRepWaitMode::Write),
            SynchronousCommit::On => Some(SyncRepWaitMode::Flush),
        }
    }
}

/// Runtime configuration for the coordination subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the data directory; the WAL and the foreign transaction
    /// state directory live under it.
    pub data_dir: PathBuf,

    /// Capacity of the foreign transaction entry pool.
    pub max_prepared_foreign_xacts: usize,

    /// Capacity of the resolver slot table. Must not exceed
    /// `max_prepared_foreign_xacts`.
    pub max_foreign_xact_resolvers: usize,

    /// Minimum interval between resolver launches for the same scan pass.
    /// Explicit launch requests bypass the throttle.
    pub foreign_xact_resolution_retry_interval: Duration,

    /// Resolver idle lifetime; a resolver with no work for this long
    /// detaches its slot and exits. Zero disables the idle exit.
    pub foreign_xact_resolver_timeout: Duration,

    /// Distributed commit behavior.
    pub foreign_twophase_commit: ForeignTwophaseCommit,

    /// Replication wait level for committing backends.
    pub synchronous_commit: SynchronousCommit,

    /// Standby group specification. Empty means no synchronous standbys.
    pub synchronous_standby_names: String,

    /// Size of the backend descriptor arena.
    pub max_backends: usize,

    /// Size of the replication sender slot array.
    pub max_wal_senders: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_prepared_foreign_xacts: 0,
            max_foreign_xact_resolvers: 0,
            foreign_xact_resolution_retry_interval: Duration::from_millis(60_000),
            foreign_xact_resolver_timeout: Duration::from_millis(60_000),
            foreign_twophase_commit: ForeignTwophaseCommit::Disabled,
            synchronous_commit: SynchronousCommit::On,
            synchronous_standby_names: String::new(),
            max_backends: 64,
            max_wal_senders: 8,
        }
    }
}

impl Config {
    /// Checks cross-field constraints. Called once at `SharedState`
    /// construction and again on reload.
    pub fn validate(&self) -> Result<()> {
        if self.max_foreign_xact_resolvers > self.max_prepared_foreign_xacts {
            return Err(FedXactError::config(format!(
                "max_foreign_xact_resolvers ({}) must not exceed max_prepared_foreign_xacts ({})",
                self.max_foreign_xact_resolvers, self.max_prepared_foreign_xacts
            )));
        }
        if self.max_backends == 0 {
            return Err(FedXactError::config("max_backends must be at least 1"));
        }
        if self.foreign_xact_resolution_retry_interval.is_zero() {
            return Err(FedXactError::config(
                "foreign_xact_resolution_retry_interval must be positive",
            ));
        }
        Ok(())
    }

    /// True when the idle exit for resolvers is enabled.
    pub fn resolver_timeout_enabled(&self) -> bool {
        !self.foreign_xact_resolver_timeout.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_prepared_foreign_xacts, 0);
        assert_eq!(cfg.max_foreign_xact_resolvers, 0);
        assert_eq!(
            cfg.foreign_xact_resolution_retry_interval,
            Duration::from_millis(60_000)
        );
        assert_eq!(cfg.foreign_twophase_commit, ForeignTwophaseCommit::Disabled);
        assert_eq!(cfg.synchronous_commit, SynchronousCommit::On);
        assert!(cfg.synchronous_standby_names.is_empty());
    }

    #[test]
    fn test_resolver_cap_validation() {
        let cfg = Config {
            max_prepared_foreign_xacts: 2,
            max_foreign_xact_resolvers: 4,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_wait_mode_mapping() {
        assert_eq!(SynchronousCommit::Off.wait_mode(), None);
        assert_eq!(SynchronousCommit::Local.wait_mode(), None);
        assert_eq!(
            SynchronousCommit::RemoteWrite.wait_mode(),
            Some(SyncRepWaitMode::Write)
        );
        assert_eq!(SynchronousCommit::On.wait_mode(), Some(SyncRepWaitMode::Flush));
    }
}
