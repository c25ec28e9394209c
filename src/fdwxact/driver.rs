// Participant driver contract.
//
// A foreign-data-source adapter plugs into the foreign transaction manager
// by implementing `ParticipantDriver`. One-phase commit and rollback are
// mandatory; prepare/resolve are a capability, and adapters without them
// are simply not two-phase capable. Drivers are looked up through a static
// registry keyed by adapter name, with foreign servers bound to an adapter
// at registration time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::common::{FdwXactId, ServerId, TransactionId, UserId, UserMappingId};
use crate::error::{FedXactError, Result};

/// Identity of one participant within a distributed transaction, as handed
/// to driver callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantHandle {
    pub xid: TransactionId,
    pub serverid: ServerId,
    pub userid: UserId,
    pub umid: UserMappingId,
}

/// Error surface of a driver callback.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The adapter does not implement this capability.
    #[error("operation not supported by this adapter")]
    Unsupported,

    /// Retryable failure; a resolver will try again later.
    #[error("{0}")]
    Transient(String),
}

/// Outcome of a `resolve` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The prepared transaction was finalized.
    Resolved,
    /// The participant no longer has the prepared transaction. Treated as
    /// success: resolve is idempotent and someone already finished it.
    Missing,
}

/// Capability record for an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCaps {
    pub prepare: bool,
    pub resolve: bool,
    pub make_prepare_id: bool,
}

impl DriverCaps {
    pub fn one_phase() -> Self {
        Self::default()
    }

    pub fn two_phase() -> Self {
        Self {
            prepare: true,
            resolve: true,
            make_prepare_id: false,
        }
    }

    /// An adapter can participate in two-phase commit only with both the
    /// prepare and resolve callbacks.
    pub fn supports_two_phase(&self) -> bool {
        self.prepare && self.resolve
    }
}

/// The adapter contract.
///
/// The foreign transaction manager serializes calls for a given user
/// mapping, so implementations need not synchronize across their own
/// connections. `resolve` must be idempotent: repeated calls with the same
/// identifier and commit flag converge to the same terminal state.
pub trait ParticipantDriver: Send + Sync {
    /// Adapter name used as the registry key.
    fn name(&self) -> &str;

    fn caps(&self) -> DriverCaps {
        DriverCaps::one_phase()
    }

    /// One-phase commit of the participant's current transaction.
    fn commit(&self, participant: &ParticipantHandle) -> std::result::Result<(), DriverError>;

    /// One-phase rollback of the participant's current transaction.
    fn rollback(&self, participant: &ParticipantHandle) -> std::result::Result<(), DriverError>;

    /// Writes a prepared transaction under the caller-supplied identifier.
    fn prepare(
        &self,
        participant: &ParticipantHandle,
        id: &FdwXactId,
    ) -> std::result::Result<(), DriverError> {
        let _ = (participant, id);
        Err(DriverError::Unsupported)
    }

    /// Finalizes a previously prepared transaction.
    fn resolve(
        &self,
        participant: &ParticipantHandle,
        id: &FdwXactId,
        commit: bool,
    ) -> std::result::Result<ResolveOutcome, DriverError> {
        let _ = (participant, id, commit);
        Err(DriverError::Unsupported)
    }

    /// Produces a participant-unique prepared-transaction identifier.
    fn make_prepare_id(&self, participant: &ParticipantHandle) -> FdwXactId {
        default_prepare_id(participant)
    }
}

/// Default prepared-transaction identifier:
/// `fx_<xid>_<serverid>_<userid>`. Well under the 200 byte bound for any
/// 32-bit inputs.
pub fn default_prepare_id(participant: &ParticipantHandle) -> FdwXactId {
    let id = format!(
        "fx_{}_{}_{}",
        participant.xid, participant.serverid, participant.userid
    );
    FdwXactId::new(id.into_bytes()).expect("default prepare id is within the bound")
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, Arc<dyn ParticipantDriver>>,
    servers: HashMap<ServerId, Arc<dyn ParticipantDriver>>,
    umids: HashMap<(ServerId, UserId), UserMappingId>,
}

/// Static driver registry: adapters by name, plus the foreign-server and
/// user-mapping bindings the catalog would normally provide.
pub struct DriverRegistry {
    inner: RwLock<RegistryInner>,
    next_umid: AtomicU32,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_umid: AtomicU32::new(1),
        }
    }

    /// Registers an adapter under its name.
    pub fn register(&self, driver: Arc<dyn ParticipantDriver>) {
        self.inner
            .write()
            .by_name
            .insert(driver.name().to_string(), driver);
    }

    /// Binds a foreign server to a registered adapter.
    pub fn bind_server(&self, serverid: ServerId, adapter: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let driver = inner
            .by_name
            .get(adapter)
            .cloned()
            .ok_or(FedXactError::DriverNotBound { serverid })?;
        inner.servers.insert(serverid, driver);
        Ok(())
    }

    /// The adapter bound to a foreign server.
    pub fn driver_for(&self, serverid: ServerId) -> Result<Arc<dyn ParticipantDriver>> {
        self.inner
            .read()
            .servers
            .get(&serverid)
            .cloned()
            .ok_or(FedXactError::DriverNotBound { serverid })
    }

    /// Stable user-mapping identity for a (server, user) pair, assigned on
    /// first use.
    pub fn user_mapping_id(&self, serverid: ServerId, userid: UserId) -> UserMappingId {
        if let Some(umid) = self.inner.read().umids.get(&(serverid, userid)) {
            return *umid;
        }
        let mut inner = self.inner.write();
        *inner
            .umids
            .entry((serverid, userid))
            .or_insert_with(|| self.next_umid.fetch_add(1, Ordering::AcqRel))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DriverRegistry")
            .field("adapters", &inner.by_name.len())
            .field("servers", &inner.servers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnePhaseOnly;

    impl ParticipantDriver for OnePhaseOnly {
        fn name(&self) -> &str {
            "one_phase_only"
        }

        fn commit(&self, _p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
            Ok(())
        }

        fn rollback(&self, _p: &ParticipantHandle) -> std::result::Result<(), DriverError> {
            Ok(())
        }
    }

    fn handle() -> ParticipantHandle {
        ParticipantHandle {
            xid: 12,
            serverid: 3,
            userid: 4,
            umid: 1,
        }
    }

    #[test]
    fn test_default_caps_are_one_phase() {
        let driver = OnePhaseOnly;
        assert!(!driver.caps().supports_two_phase());
        assert!(matches!(
            driver.prepare(&handle(), &default_prepare_id(&handle())),
            Err(DriverError::Unsupported)
        ));
    }

    #[test]
    fn test_default_prepare_id_shape() {
        let id = default_prepare_id(&handle());
        assert_eq!(id.as_bytes(), b"fx_12_3_4");
    }

    #[test]
    fn test_server_binding_and_umid_stability() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(OnePhaseOnly));
        registry.bind_server(3, "one_phase_only").unwrap();
        assert!(registry.driver_for(3).is_ok());
        assert!(registry.driver_for(4).is_err());

        let a = registry.user_mapping_id(3, 4);
        let b = registry.user_mapping_id(3, 4);
        let c = registry.user_mapping_id(3, 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_binding_unknown_adapter_fails() {
        let registry = DriverRegistry::new();
        assert!(registry.bind_server(9, "missing").is_err());
    }
}
