//! Error types for the migration control plane.

use crate::types::{BucketRange, NodeId, ShardId};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Shard manager protocol errors (remote phase failures).
    #[error("shard manager error: {0}")]
    ShardManager(#[from] ShardManagerError),

    /// Configuration errors: bad shard ids, malformed ranges, ownership
    /// mismatches. Fail fast, never retried, no remote effect.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The cutover call timed out without a definitive reply. Ownership of
    /// the range is unknown until the operator reconciles; the operation is
    /// never retried automatically.
    #[error("cutover outcome unknown for {range} ({src} -> {target}), migration {migration_id}: {cause}")]
    CutoverUnresolved {
        range: BucketRange,
        src: ShardId,
        target: ShardId,
        migration_id: Uuid,
        cause: String,
    },

    /// The admin operation is not implemented for this target.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error may be retried by the orchestrator.
    ///
    /// Configuration errors are permanent, cancellation is deliberate, and
    /// an unresolved cutover must go to operator reconciliation.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Config(_) | Error::Cancelled | Error::CutoverUnresolved { .. }
        )
    }
}

/// Protocol-level errors reported by the shard manager client or server.
///
/// These cross the wire inside [`ShardManagerResponse`]
/// (crate::shard_manager::ShardManagerResponse), hence the serde derives.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShardManagerError {
    /// A member could not be put into slave mode within the time budget.
    #[error("failed to start observing shard {target} from {src}: {reason}")]
    FailedStartSlave {
        target: ShardId,
        src: ShardId,
        reason: String,
    },

    /// A member could not be taken out of slave mode.
    #[error("failed to stop observing shard {target} from {src}: {reason}")]
    FailedStopSlave {
        target: ShardId,
        src: ShardId,
        reason: String,
    },

    /// The synchronization barrier could not be satisfied in time: at least
    /// one slave never approached the source leader's log position.
    #[error("slaves of shard {target} did not approach the leader log in time")]
    SlaveNotSync { target: ShardId },

    /// A slave reported an unrecoverable replication error; the barrier can
    /// never be satisfied without intervention.
    #[error("slave {member} failed: {reason}")]
    SlaveFailed { member: NodeId, reason: String },

    /// The cutover failed with a definitive error from the remote side.
    #[error("failed to migrate buckets {range}: {reason}")]
    FailedMigrateBuckets { range: BucketRange, reason: String },

    /// The call reached a member that is not the shard leader.
    #[error("member {member} is not the leader of shard {shard} (leader: {leader:?})")]
    NotLeader {
        shard: ShardId,
        member: NodeId,
        leader: Option<NodeId>,
    },

    /// The member is unknown to the receiving server.
    #[error("member {0} not found")]
    MemberNotFound(NodeId),

    /// Transport-level failure beneath the RPC.
    #[error("transport error: {0}")]
    Transport(String),

    /// The whole call's time budget elapsed without a reply.
    #[error("shard manager call timed out")]
    Timeout,
}

impl ShardManagerError {
    /// Whether the call elapsed without a definitive success/failure reply.
    ///
    /// A timed-out cutover is ambiguous and must be surfaced as such rather
    /// than treated as a plain failure.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ShardManagerError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BucketRange;

    #[test]
    fn test_config_error_not_retryable() {
        assert!(!Error::Config("bad shard".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::ShardManager(ShardManagerError::SlaveNotSync { target: 2 }).is_retryable());
    }

    #[test]
    fn test_cutover_unresolved_not_retryable() {
        let err = Error::CutoverUnresolved {
            range: BucketRange::new(10, 20).unwrap(),
            src: 1,
            target: 2,
            migration_id: Uuid::new_v4(),
            cause: "timed out".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_ambiguous() {
        assert!(ShardManagerError::Timeout.is_ambiguous());
        assert!(!ShardManagerError::SlaveNotSync { target: 1 }.is_ambiguous());
    }
}
