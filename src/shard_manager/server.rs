//! Shard manager server: one per member process.
//!
//! The server owns every transition of its local member's sync record and
//! executes the atomic cutover when its member leads the source shard. All
//! state changes happen inside request handlers; nothing here runs on a
//! timer or background task.

use crate::bucket_map::BucketMap;
use crate::config::{ControlConfig, Topology};
use crate::error::ShardManagerError;
use crate::lock_manager::LockManager;
use crate::member_sync::{MemberSyncState, SyncMode, SyncStatus, SyncStateRegistry};
use crate::raft::{RaftMember, ShardRaft};
use crate::shard_manager::{ShardManagerRequest, ShardManagerResponse};
use crate::transport::ShardManagerTransport;
use crate::types::{BucketRange, NodeId, ShardId, ShardRole};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Server-side shard manager for a single member.
#[derive(Debug)]
pub struct ShardManagerServer {
    member_id: NodeId,
    shard_id: ShardId,
    config: ControlConfig,
    topology: Topology,
    member: Arc<dyn RaftMember>,
    shards: HashMap<ShardId, Arc<dyn ShardRaft>>,
    registry: Arc<SyncStateRegistry>,
    bucket_map: Arc<BucketMap>,
    locks: Arc<LockManager>,
    // Set after construction; the transport needs the servers registered
    // first.
    peers: RwLock<Option<Arc<dyn ShardManagerTransport>>>,
    // Applied cutovers keyed by (range, source, target): re-invoking one of
    // these is answered with success without touching the bucket map.
    completed_cutovers: Mutex<HashMap<(BucketRange, ShardId, ShardId), Uuid>>,
}

impl ShardManagerServer {
    /// Create a server for `member_id`, a member of `shard_id`.
    ///
    /// `shards` must contain a handle for every shard the member may be
    /// asked to observe or migrate against, including its own.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member_id: NodeId,
        shard_id: ShardId,
        config: ControlConfig,
        topology: Topology,
        member: Arc<dyn RaftMember>,
        shards: HashMap<ShardId, Arc<dyn ShardRaft>>,
        registry: Arc<SyncStateRegistry>,
        bucket_map: Arc<BucketMap>,
        locks: Arc<LockManager>,
    ) -> Self {
        registry.register(member_id, shard_id);
        Self {
            member_id,
            shard_id,
            config,
            topology,
            member,
            shards,
            registry,
            bucket_map,
            locks,
            peers: RwLock::new(None),
            completed_cutovers: Mutex::new(HashMap::new()),
        }
    }

    /// Wire in the transport used to broadcast the bucket flip to peers.
    pub fn set_transport(&self, transport: Arc<dyn ShardManagerTransport>) {
        *self.peers.write() = Some(transport);
    }

    /// The member this server fronts.
    pub fn member_id(&self) -> NodeId {
        self.member_id
    }

    /// Dispatch one protocol request.
    pub async fn handle_request(&self, request: ShardManagerRequest) -> ShardManagerResponse {
        let result = match request {
            ShardManagerRequest::StartObserving { target, source } => {
                self.start_observing(target, source).map(|_| ShardManagerResponse::Ack)
            }
            ShardManagerRequest::StopObserving { target, source } => {
                self.stop_observing(target, source).map(|_| ShardManagerResponse::Ack)
            }
            ShardManagerRequest::MemberStatus { member } => {
                self.member_status(member).map(ShardManagerResponse::MemberStatus)
            }
            ShardManagerRequest::MigrateBuckets {
                range,
                source,
                target,
                migration_id,
            } => self
                .migrate_buckets(range, source, target, migration_id)
                .await
                .map(|_| ShardManagerResponse::Ack),
            ShardManagerRequest::SetBuckets {
                range,
                source,
                target,
                migration_complete,
            } => self
                .set_buckets(range, source, target, migration_complete)
                .map(|_| ShardManagerResponse::Ack),
        };
        result.unwrap_or_else(ShardManagerResponse::Error)
    }

    /// Put the local member into slave mode against `source`'s leader.
    fn start_observing(
        &self,
        target: ShardId,
        source: ShardId,
    ) -> std::result::Result<(), ShardManagerError> {
        if self.shard_id != target {
            return Err(ShardManagerError::FailedStartSlave {
                target,
                src: source,
                reason: format!("member {} is not in shard {}", self.member_id, target),
            });
        }
        let source_leader = self
            .shards
            .get(&source)
            .and_then(|s| s.leader())
            .ok_or_else(|| ShardManagerError::FailedStartSlave {
                target,
                src: source,
                reason: format!("no known leader for shard {}", source),
            })?;

        let state = self.registry.get(self.member_id);
        match state.as_ref().map(|s| s.mode) {
            // Already observing the same leader: idempotent no-op.
            Some(SyncMode::Slave)
                if state.as_ref().and_then(|s| s.master) == Some(source_leader) =>
            {
                tracing::debug!(
                    member = self.member_id,
                    master = source_leader,
                    "already observing, ignoring duplicate start"
                );
                return Ok(());
            }
            Some(SyncMode::Migrating1) | Some(SyncMode::Migrating2) => {
                return Err(ShardManagerError::FailedStartSlave {
                    target,
                    src: source,
                    reason: format!("member {} is mid-cutover", self.member_id),
                });
            }
            _ => {}
        }

        self.member
            .set_slave(Some(source_leader))
            .map_err(|e| ShardManagerError::FailedStartSlave {
                target,
                src: source,
                reason: e.to_string(),
            })?;
        self.registry.transition(
            self.member_id,
            SyncMode::Slave,
            SyncStatus::Running,
            Some(source_leader),
            None,
        );
        tracing::info!(
            member = self.member_id,
            to_shard = target,
            from_shard = source,
            master = source_leader,
            "member entered slave mode"
        );
        Ok(())
    }

    /// Take the local member out of slave mode. No-op when already normal.
    fn stop_observing(
        &self,
        target: ShardId,
        source: ShardId,
    ) -> std::result::Result<(), ShardManagerError> {
        if self.shard_id != target {
            return Err(ShardManagerError::FailedStopSlave {
                target,
                src: source,
                reason: format!("member {} is not in shard {}", self.member_id, target),
            });
        }
        let Some(state) = self.registry.get(self.member_id) else {
            return Err(ShardManagerError::MemberNotFound(self.member_id));
        };
        match state.mode {
            SyncMode::Normal => Ok(()),
            SyncMode::Slave | SyncMode::Migrating1 => {
                self.member
                    .set_slave(None)
                    .map_err(|e| ShardManagerError::FailedStopSlave {
                        target,
                        src: source,
                        reason: e.to_string(),
                    })?;
                self.registry.transition(
                    self.member_id,
                    SyncMode::Normal,
                    SyncStatus::Stop,
                    None,
                    None,
                );
                tracing::info!(member = self.member_id, to_shard = target, "member left slave mode");
                Ok(())
            }
            // Ownership already flipped; finish winding down instead of
            // rolling back.
            SyncMode::Migrating2 => {
                self.registry.transition(
                    self.member_id,
                    SyncMode::Normal,
                    SyncStatus::Running,
                    None,
                    None,
                );
                Ok(())
            }
        }
    }

    /// Recompute and report the local member's sync record.
    ///
    /// Status derivation is pull-driven: the record only moves when someone
    /// asks, keeping every transition attributable to a request.
    fn member_status(
        &self,
        member: NodeId,
    ) -> std::result::Result<MemberSyncState, ShardManagerError> {
        if member != self.member_id {
            return Err(ShardManagerError::MemberNotFound(member));
        }
        let state = self
            .registry
            .get(member)
            .ok_or(ShardManagerError::MemberNotFound(member))?;
        if state.mode != SyncMode::Slave {
            return Ok(state);
        }

        let (status, reason) = match self.member.slave_status() {
            // Slave mode requested but not yet effective.
            None => (SyncStatus::Running, None),
            Some(s) => {
                if let Some(err) = s.error {
                    (SyncStatus::Failed, Some(err))
                } else if !s.running {
                    (SyncStatus::Running, None)
                } else {
                    let gap = s.commit_index.saturating_sub(s.saved_index);
                    if gap == 0 {
                        (SyncStatus::Synced, None)
                    } else if gap <= self.config.approach_margin {
                        (SyncStatus::Approached, None)
                    } else {
                        (SyncStatus::Running, None)
                    }
                }
            }
        };
        self.registry
            .transition(member, SyncMode::Slave, status, state.master, reason)
            .ok_or(ShardManagerError::MemberNotFound(member))
    }

    /// Atomic cutover, valid only on the source shard's current leader.
    ///
    /// Either the bucket map is updated to the new ownership and the target
    /// members leave slave mode, or nothing observable changes. Re-invoking
    /// an already applied cutover for the identical `(range, source,
    /// target)` is answered with success.
    async fn migrate_buckets(
        &self,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_id: Uuid,
    ) -> std::result::Result<(), ShardManagerError> {
        if self.shard_id != source {
            return Err(ShardManagerError::FailedMigrateBuckets {
                range,
                reason: format!("member {} is not in source shard {}", self.member_id, source),
            });
        }
        if self.member.local_role() != ShardRole::Leader {
            return Err(ShardManagerError::NotLeader {
                shard: source,
                member: self.member_id,
                leader: self.shards.get(&source).and_then(|s| s.leader()),
            });
        }
        let applied = self
            .completed_cutovers
            .lock()
            .get(&(range, source, target))
            .copied();
        if let Some(applied) = applied {
            // The ledger entry only answers for the current ownership: if
            // the range has since migrated back, this is a fresh cutover.
            if self.bucket_map.owner_of(range).ok() == Some(target) {
                tracing::info!(
                    %range,
                    from_shard = source,
                    to_shard = target,
                    applied_migration = %applied,
                    requested_migration = %migration_id,
                    "cutover already applied, answering success"
                );
                return Ok(());
            }
            self.completed_cutovers.lock().remove(&(range, source, target));
        }
        let peers = self.peers.read().clone().ok_or_else(|| {
            ShardManagerError::FailedMigrateBuckets {
                range,
                reason: "shard manager transport not wired".to_string(),
            }
        })?;

        // Open the migration window. The global lock covers only this
        // bookkeeping step.
        {
            let _global = self
                .locks
                .acquire_global(format!("open migration {} {}->{}", range, source, target))
                .await;
            self.bucket_map.begin_migration(range, target).map_err(|e| {
                ShardManagerError::FailedMigrateBuckets {
                    range,
                    reason: e.to_string(),
                }
            })?;
        }
        tracing::info!(%range, from_shard = source, to_shard = target, %migration_id, "cutover started");

        // First sub-phase: target members stop replicating and freeze on
        // the handoff.
        if let Err(e) = self
            .broadcast_set_buckets(&peers, range, source, target, false)
            .await
        {
            self.rollback_cutover(&peers, range, source, target).await;
            return Err(e);
        }

        // The durable point: ownership flips in the bucket map.
        let flip = {
            let _global = self
                .locks
                .acquire_global(format!("flip ownership {} {}->{}", range, source, target))
                .await;
            self.bucket_map.complete_migration(range, target)
        };
        if let Err(e) = flip {
            self.rollback_cutover(&peers, range, source, target).await;
            return Err(ShardManagerError::FailedMigrateBuckets {
                range,
                reason: e.to_string(),
            });
        }
        self.completed_cutovers
            .lock()
            .insert((range, source, target), migration_id);
        tracing::info!(%range, from_shard = source, to_shard = target, "ownership flipped");

        // Second sub-phase: wind the target members down to normal
        // operation. Ownership has transferred, so failures here are
        // logged and completion is best-effort.
        if let Err(e) = self
            .broadcast_set_buckets(&peers, range, source, target, true)
            .await
        {
            tracing::warn!(
                %range,
                to_shard = target,
                error = %e,
                "post-flip wind-down incomplete, continuing"
            );
        }

        {
            let _global = self
                .locks
                .acquire_global(format!("close migration {} {}->{}", range, source, target))
                .await;
            if let Err(e) = self.bucket_map.end_migration(range) {
                tracing::error!(%range, error = %e, "failed to close migration window");
            }
        }
        tracing::info!(%range, from_shard = source, to_shard = target, %migration_id, "cutover complete");
        Ok(())
    }

    /// Broadcast one `SetBuckets` phase to every member of the target shard.
    async fn broadcast_set_buckets(
        &self,
        peers: &Arc<dyn ShardManagerTransport>,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_complete: bool,
    ) -> std::result::Result<(), ShardManagerError> {
        for member in self.topology.members_of(target) {
            let request = ShardManagerRequest::SetBuckets {
                range,
                source,
                target,
                migration_complete,
            };
            peers
                .call(*member, request, self.config.cutover_timeout)
                .await?
                .into_ack()?;
        }
        Ok(())
    }

    /// Undo a cutover that failed before the ownership flip: revert target
    /// members toward normal mode and close the migration window.
    async fn rollback_cutover(
        &self,
        peers: &Arc<dyn ShardManagerTransport>,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
    ) {
        for member in self.topology.members_of(target) {
            let request = ShardManagerRequest::StopObserving { target, source };
            let outcome = peers
                .call(*member, request, self.config.cutover_timeout)
                .await
                .and_then(|resp| resp.into_ack());
            if let Err(e) = outcome {
                tracing::warn!(member, error = %e, "rollback stop observing failed, ignoring");
            }
        }
        let _global = self
            .locks
            .acquire_global(format!("abort migration {} {}->{}", range, source, target))
            .await;
        if let Err(e) = self.bucket_map.abort_migration(range) {
            tracing::warn!(%range, error = %e, "failed to close aborted migration window");
        }
    }

    /// Apply one bucket-flip sub-phase on the local member.
    fn set_buckets(
        &self,
        range: BucketRange,
        source: ShardId,
        target: ShardId,
        migration_complete: bool,
    ) -> std::result::Result<(), ShardManagerError> {
        if self.shard_id != target {
            // Members of other shards learn new ownership through the
            // replicated bucket map; nothing to do locally.
            return Ok(());
        }
        if !migration_complete {
            // Replication from the foreign leader stops before the flip so
            // the handoff point is fixed.
            self.member
                .set_slave(None)
                .map_err(|e| ShardManagerError::FailedStopSlave {
                    target,
                    src: source,
                    reason: e.to_string(),
                })?;
            self.registry.transition(
                self.member_id,
                SyncMode::Migrating1,
                SyncStatus::Running,
                None,
                None,
            );
            tracing::debug!(member = self.member_id, %range, "entered first cutover sub-phase");
        } else {
            self.registry.transition(
                self.member_id,
                SyncMode::Migrating2,
                SyncStatus::Running,
                None,
                None,
            );
            self.registry.transition(
                self.member_id,
                SyncMode::Normal,
                SyncStatus::Running,
                None,
                None,
            );
            tracing::debug!(member = self.member_id, %range, "cutover wound down to normal");
        }
        Ok(())
    }

    /// Cutovers applied by this server, for the status surface.
    pub fn applied_cutovers(&self) -> Vec<(BucketRange, ShardId, ShardId, Uuid)> {
        self.completed_cutovers
            .lock()
            .iter()
            .map(|((range, source, target), id)| (*range, *source, *target, *id))
            .collect()
    }
}
