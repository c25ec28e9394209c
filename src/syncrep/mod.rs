// Synchronous Replication Wait Engine
//
// Coordinates durability of local commits across replica nodes: committing
// backends park on LSN-ordered queues after the local flush, and
// replication senders release them as the standby group acknowledges
// progress.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`queue`] | LSN-ordered wait queues over a fixed backend arena |
// | [`standby`] | Standby group tree, sender slots, priority evaluation |
// | [`wait`] | Commit wait, waiter release, cancellation |

pub mod queue;
pub mod standby;
pub mod wait;

pub use queue::{SyncRepQueues, SyncRepState, SyncRepWaitMode, NUM_SYNC_REP_WAIT_MODES};
pub use standby::{
    parse_standby_names, synced_lsns, QuorumMethod, StandbyGroup, StandbyNode, WalSenderArray,
    WalSenderSlot, WalSenderState,
};
pub use wait::{
    release_waiters, update_sync_standbys_defined, wait_for_lsn, SyncRepControl,
    SyncRepWaitResult,
};
