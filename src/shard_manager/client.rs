//! Remote shard manager client: the orchestrator's proxy.
//!
//! Each protocol call fans out to every member of the addressed shard over
//! the transport. Time budgets cover the whole fan-out. Barrier waits poll
//! member status with a bounded-CPU sleep between probes.

use crate::config::{ControlConfig, Topology};
use crate::error::{Error, ShardManagerError};
use crate::member_sync::{MemberSyncState, SyncStatus};
use crate::shard_manager::{ShardManagerProtocol, ShardManagerRequest};
use crate::transport::ShardManagerTransport;
use crate::types::{BucketRange, NodeId, ShardId};
use crate::util::poll_until;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Shard manager client speaking to remote servers over the transport.
#[derive(Debug)]
pub struct RemoteShardManagerClient {
    topology: Topology,
    config: ControlConfig,
    transport: Arc<dyn ShardManagerTransport>,
}

impl RemoteShardManagerClient {
    /// Create a client over the given transport.
    pub fn new(
        topology: Topology,
        config: ControlConfig,
        transport: Arc<dyn ShardManagerTransport>,
    ) -> Self {
        Self {
            topology,
            config,
            transport,
        }
    }

    /// Fetch one member's sync record.
    async fn member_status(
        &self,
        member: NodeId,
    ) -> std::result::Result<MemberSyncState, ShardManagerError> {
        self.transport
            .call(
                member,
                ShardManagerRequest::MemberStatus { member },
                self.config.observe_timeout,
            )
            .await?
            .into_status()
    }

    /// One barrier probe: query every member of `target` and check `ready`.
    ///
    /// Transport hiccups count as "not ready yet" so a transient stall does
    /// not abort an unbounded wait; a member reporting `Failed` aborts the
    /// wait since it can never satisfy the barrier.
    async fn probe_members(
        &self,
        target: ShardId,
        ready: fn(&MemberSyncState) -> bool,
    ) -> crate::error::Result<bool> {
        for member in self.topology.members_of(target) {
            match self.member_status(*member).await {
                Err(ShardManagerError::Timeout) | Err(ShardManagerError::Transport(_)) => {
                    return Ok(false);
                }
                Err(e) => return Err(Error::ShardManager(e)),
                Ok(state) => {
                    if state.status == SyncStatus::Failed {
                        return Err(Error::ShardManager(ShardManagerError::SlaveFailed {
                            member: *member,
                            reason: state
                                .reason
                                .unwrap_or_else(|| "unknown replication error".to_string()),
                        }));
                    }
                    if !ready(&state) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Shared implementation of the two barrier waits.
    async fn wait_members(
        &self,
        target: ShardId,
        timeout: Option<Duration>,
        ready: fn(&MemberSyncState) -> bool,
    ) -> std::result::Result<bool, ShardManagerError> {
        if self.topology.members_of(target).is_empty() {
            return Err(ShardManagerError::Transport(format!(
                "shard {} has no members",
                target
            )));
        }
        let result = poll_until(
            move || self.probe_members(target, ready),
            self.config.poll_interval,
            timeout,
        )
        .await;
        match result {
            Ok(done) => Ok(done),
            Err(Error::ShardManager(e)) => Err(e),
            Err(other) => Err(ShardManagerError::Transport(other.to_string())),
        }
    }
}

#[async_trait]
impl ShardManagerProtocol for RemoteShardManagerClient {
    async fn start_observing(
        &self,
        target: ShardId,
        source: ShardId,
        timeout: Duration,
    ) -> std::result::Result<(), ShardManagerError> {
        let members = self.topology.members_of(target);
        if members.is_empty() {
            return Err(ShardManagerError::FailedStartSlave {
                target,
                src: source,
                reason: format!("shard {} has no members", target),
            });
        }
        let deadline = Instant::now() + timeout;

        for member in members {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShardManagerError::FailedStartSlave {
                    target,
                    src: source,
                    reason: "time budget exhausted before all members entered slave mode"
                        .to_string(),
                });
            }
            // The channel to the member must be up before the call counts
            // against the budget in earnest.
            if let Err(e) = self.transport.await_operational(*member, remaining).await {
                return Err(ShardManagerError::FailedStartSlave {
                    target,
                    src: source,
                    reason: format!("channel to member {}: {}", member, e),
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let request = ShardManagerRequest::StartObserving { target, source };
            match self.transport.call(*member, request, remaining).await {
                Ok(resp) => resp.into_ack()?,
                Err(e) => {
                    return Err(ShardManagerError::FailedStartSlave {
                        target,
                        src: source,
                        reason: format!("member {}: {}", member, e),
                    })
                }
            }
        }

        // The acks put every member into slave mode; verify they are all
        // operating as slaves before declaring the phase done.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let observing = self
            .wait_members(target, Some(remaining), MemberSyncState::is_slave_operational)
            .await?;
        if observing {
            tracing::debug!(to_shard = target, from_shard = source, "all members observing");
            Ok(())
        } else {
            Err(ShardManagerError::FailedStartSlave {
                target,
                src: source,
                reason: "members did not become operational slaves in time".to_string(),
            })
        }
    }

    async fn stop_observing(
        &self,
        target: ShardId,
        source: ShardId,
        timeout: Duration,
    ) -> std::result::Result<(), ShardManagerError> {
        let deadline = Instant::now() + timeout;
        for member in self.topology.members_of(target) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ShardManagerError::FailedStopSlave {
                    target,
                    src: source,
                    reason: "time budget exhausted".to_string(),
                });
            }
            let request = ShardManagerRequest::StopObserving { target, source };
            match self.transport.call(*member, request, remaining).await {
                Ok(resp) => resp.into_ack()?,
                Err(e) => {
                    return Err(ShardManagerError::FailedStopSlave {
                        target,
                        src: source,
                        reason: format!("member {}: {}", member, e),
                    })
                }
            }
        }
        Ok(())
    }

    async fn wait_slaves_approaching(
        &self,
        target: ShardId,
        timeout: Option<Duration>,
    ) -> std::result::Result<bool, ShardManagerError> {
        self.wait_members(target, timeout, MemberSyncState::is_cutover_ready)
            .await
    }

    async fn wait_slaves_synced(
        &self,
        target: ShardId,
        timeout: Option<Duration>,
    ) -> std::result::Result<bool, ShardManagerError> {
        self.wait_members(target, timeout, |state| state.status == SyncStatus::Synced)
            .await
    }

    async fn migrate_buckets(
        &self,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_id: Uuid,
        timeout: Duration,
    ) -> std::result::Result<(), ShardManagerError> {
        let members = self.topology.members_of(source);
        if members.is_empty() {
            return Err(ShardManagerError::FailedMigrateBuckets {
                range,
                reason: format!("shard {} has no members", source),
            });
        }
        let deadline = Instant::now() + timeout;
        let mut queue: Vec<NodeId> = members.to_vec();
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut last_err = None;

        // The cutover must run on the source leader; chase leader hints
        // from members that decline.
        while let Some(member) = queue.first().copied() {
            queue.remove(0);
            if !tried.insert(member) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let request = ShardManagerRequest::MigrateBuckets {
                range,
                source,
                target,
                migration_id,
            };
            match self.transport.call(member, request, remaining).await {
                // The call may have reached the leader and applied: the
                // outcome is unknown and must surface as such, never as a
                // plain failure.
                Err(ShardManagerError::Timeout) => return Err(ShardManagerError::Timeout),
                Err(e) => last_err = Some(e),
                Ok(resp) => match resp.into_ack() {
                    Ok(()) => return Ok(()),
                    Err(ShardManagerError::NotLeader { leader, .. }) => {
                        if let Some(hint) = leader {
                            if !tried.contains(&hint) {
                                queue.insert(0, hint);
                            }
                        }
                        last_err = Some(ShardManagerError::NotLeader {
                            shard: source,
                            member,
                            leader,
                        });
                    }
                    // A definitive failure from the leader.
                    Err(e) => return Err(e),
                },
            }
        }
        Err(last_err.unwrap_or_else(|| ShardManagerError::FailedMigrateBuckets {
            range,
            reason: format!("no reachable leader for shard {}", source),
        }))
    }
}
