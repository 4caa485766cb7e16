//! Shard manager protocol: the call surface and wire messages.
//!
//! Four core calls drive a range handoff: `start_observing`,
//! `wait_slaves_approaching`, `migrate_buckets`, and the compensating
//! `stop_observing`. Two more round out the protocol: `wait_slaves_synced`
//! (the full-sync variant of the barrier) and `set_buckets` (the per-member
//! bucket flip the cutover broadcasts internally).
//!
//! Every call carries a time budget for the whole call, not one round
//! trip. Barrier waits take `Option<Duration>`: `None` blocks until every
//! member reports readiness or a member fails.

use crate::error::ShardManagerError;
use crate::member_sync::MemberSyncState;
use crate::types::{BucketRange, NodeId, ShardId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The shard manager call surface, as consumed by the orchestrator.
#[async_trait]
pub trait ShardManagerProtocol: Send + Sync + std::fmt::Debug {
    /// Put every member of `target` into slave mode against `source`'s
    /// current leader. Idempotent: repeating the call on an already
    /// observing member does not duplicate state or error.
    async fn start_observing(
        &self,
        target: ShardId,
        source: ShardId,
        timeout: Duration,
    ) -> Result<(), ShardManagerError>;

    /// Take every member of `target` out of slave mode. Safe to call on
    /// members already back in normal mode (no-op).
    async fn stop_observing(
        &self,
        target: ShardId,
        source: ShardId,
        timeout: Duration,
    ) -> Result<(), ShardManagerError>;

    /// Block until every member of `target` reports its log position within
    /// the acceptance margin of the source leader's. Returns `false` if the
    /// budget elapses first; `None` waits without limit.
    async fn wait_slaves_approaching(
        &self,
        target: ShardId,
        timeout: Option<Duration>,
    ) -> Result<bool, ShardManagerError>;

    /// Like [`wait_slaves_approaching`](Self::wait_slaves_approaching) but
    /// requires every member to be fully caught up.
    async fn wait_slaves_synced(
        &self,
        target: ShardId,
        timeout: Option<Duration>,
    ) -> Result<bool, ShardManagerError>;

    /// Atomic cutover, executed by `source`'s current leader: the bucket
    /// map is durably updated to the new ownership and `target`'s members
    /// leave slave mode, or nothing observable changes. `migration_id` keys
    /// the server's idempotency ledger: re-invoking an already applied
    /// cutover for the identical `(range, source, target)` succeeds without
    /// reapplying.
    async fn migrate_buckets(
        &self,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_id: Uuid,
        timeout: Duration,
    ) -> Result<(), ShardManagerError>;
}

/// Wire request to a member's shard manager server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShardManagerRequest {
    /// Enter slave mode against `source`'s leader.
    StartObserving { target: ShardId, source: ShardId },

    /// Leave slave mode.
    StopObserving { target: ShardId, source: ShardId },

    /// Report the member's current sync record.
    MemberStatus { member: NodeId },

    /// Execute the atomic cutover (source leader only).
    MigrateBuckets {
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_id: Uuid,
    },

    /// Per-member bucket flip, broadcast by the cutover. With
    /// `migration_complete` false the member enters the first cutover
    /// sub-phase; true winds it down to normal operation.
    SetBuckets {
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_complete: bool,
    },
}

/// Wire response from a member's shard manager server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShardManagerResponse {
    /// The request was applied.
    Ack,

    /// Reply to [`ShardManagerRequest::MemberStatus`].
    MemberStatus(MemberSyncState),

    /// The request failed with a protocol error.
    Error(ShardManagerError),
}

impl ShardManagerResponse {
    /// Collapse the response into a result, treating any unexpected
    /// payload as a transport-level fault.
    pub fn into_ack(self) -> Result<(), ShardManagerError> {
        match self {
            ShardManagerResponse::Ack => Ok(()),
            ShardManagerResponse::Error(e) => Err(e),
            other => Err(ShardManagerError::Transport(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Extract a member status reply.
    pub fn into_status(self) -> Result<MemberSyncState, ShardManagerError> {
        match self {
            ShardManagerResponse::MemberStatus(state) => Ok(state),
            ShardManagerResponse::Error(e) => Err(e),
            other => Err(ShardManagerError::Transport(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }
}

/// Encode a request for the transport.
pub fn encode_request(req: &ShardManagerRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(req)
}

/// Decode a request from the transport.
pub fn decode_request(data: &[u8]) -> Result<ShardManagerRequest, bincode::Error> {
    bincode::deserialize(data)
}

/// Encode a response for the transport.
pub fn encode_response(resp: &ShardManagerResponse) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(resp)
}

/// Decode a response from the transport.
pub fn decode_response(data: &[u8]) -> Result<ShardManagerResponse, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member_sync::{SyncMode, SyncStatus};

    #[test]
    fn test_request_roundtrip() {
        let req = ShardManagerRequest::MigrateBuckets {
            range: BucketRange::new(10, 20).unwrap(),
            source: 1,
            target: 2,
            migration_id: Uuid::new_v4(),
        };
        let bytes = encode_request(&req).unwrap();
        assert_eq!(decode_request(&bytes).unwrap(), req);
    }

    #[test]
    fn test_response_roundtrip() {
        let mut state = MemberSyncState::new(4, 2);
        state.mode = SyncMode::Slave;
        state.status = SyncStatus::Approached;
        let resp = ShardManagerResponse::MemberStatus(state.clone());
        let bytes = encode_response(&resp).unwrap();
        assert_eq!(decode_response(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_into_ack() {
        assert!(ShardManagerResponse::Ack.into_ack().is_ok());
        let err = ShardManagerResponse::Error(ShardManagerError::SlaveNotSync { target: 2 });
        assert_eq!(
            err.into_ack(),
            Err(ShardManagerError::SlaveNotSync { target: 2 })
        );

        let state = MemberSyncState::new(1, 1);
        assert!(ShardManagerResponse::MemberStatus(state).into_ack().is_err());
    }
}
