//! Contracts consumed from the point-to-point transport layer.
//!
//! The transport is a reliable, ordered, reconnecting channel per member
//! pair; its framing and reconnect handshake are outside this crate. The
//! shard manager client only needs to deliver a request to a member's shard
//! manager server and get the response back within a time budget.

use crate::error::{Result, ShardManagerError};
use crate::shard_manager::{ShardManagerRequest, ShardManagerResponse};
use crate::types::NodeId;
use async_trait::async_trait;
use std::time::Duration;

/// Health view of the channel to one member.
#[async_trait]
pub trait MemberChannel: Send + Sync + std::fmt::Debug {
    /// Whether the channel is currently usable.
    fn is_operational(&self, member: NodeId) -> bool;

    /// Wait until the channel to `member` becomes usable.
    async fn await_operational(&self, member: NodeId, timeout: Duration) -> Result<()>;
}

/// Request/response delivery to a member's shard manager server.
#[async_trait]
pub trait ShardManagerTransport: MemberChannel {
    /// Deliver `request` to `member` and return its response. An elapsed
    /// `timeout` surfaces as [`ShardManagerError::Timeout`]; the call's
    /// outcome on the remote side is then unknown to the caller.
    async fn call(
        &self,
        member: NodeId,
        request: ShardManagerRequest,
        timeout: Duration,
    ) -> std::result::Result<ShardManagerResponse, ShardManagerError>;
}
