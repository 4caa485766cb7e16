//! Contracts consumed from the Raft replication layer.
//!
//! Leader election, log replication, and the slave-replication machinery
//! live outside this crate; the control plane drives them through these
//! traits. In-process stub implementations for tests live in
//! [`crate::testing`].

use crate::error::Result;
use crate::types::{NodeId, ShardId, ShardRole};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A replica's view of its replication against a foreign shard's leader.
///
/// `saved_index <= commit_index` always holds; the gap between the two is
/// what the approach barrier measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveReplication {
    /// The foreign leader being replicated from.
    pub master: NodeId,
    /// Whether the member is connected and replicating.
    pub running: bool,
    /// The source leader's commit index as seen by the replica.
    pub commit_index: u64,
    /// Highest log index the replica has durably saved.
    pub saved_index: u64,
    /// Set when connecting to or reading from the leader failed; `running`
    /// is false whenever this is set.
    pub error: Option<String>,
}

/// Per-shard handle into the replication layer.
pub trait ShardRaft: Send + Sync + std::fmt::Debug {
    /// The shard this handle serves.
    fn shard_id(&self) -> ShardId;

    /// Current leader, if known.
    fn leader(&self) -> Option<NodeId>;

    /// Commit index of the shard's replicated log.
    fn commit_index(&self) -> u64;

    /// Index up to which the local state machine has applied the log.
    fn applied_index(&self) -> u64;

    /// Ask the local member to take leadership within `timeout`.
    fn force_leader(&self, timeout: Duration) -> Result<()>;

    /// Members of the shard.
    fn member_ids(&self) -> Vec<NodeId>;

    /// Handle to one member, local or remote.
    fn member(&self, id: NodeId) -> Option<Arc<dyn RaftMember>>;
}

/// Handle to a single shard member.
pub trait RaftMember: Send + Sync + std::fmt::Debug {
    /// The member's id.
    fn member_id(&self) -> NodeId;

    /// Local Raft role.
    fn local_role(&self) -> ShardRole;

    /// Put the member into slave mode against `master`'s log, or leave
    /// slave mode with `None`. Entering slave mode resets the member's view
    /// of the foreign log; it then retries the connection until told to
    /// stop. Idempotent for the same master.
    fn set_slave(&self, master: Option<NodeId>) -> Result<()>;

    /// Replication status while in slave mode, `None` otherwise.
    fn slave_status(&self) -> Option<SlaveReplication>;
}
