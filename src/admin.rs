//! Migration orchestrator: the operator-facing admin client.
//!
//! Drives a bucket range through the full handoff protocol against the
//! shard manager: observe, synchronization barrier, atomic cutover, with a
//! bounded retry budget and compensating rollback between attempts. The
//! whole sequence for a range runs on one logical flow of control and holds
//! the affected shard and range locks from first remote call to completion,
//! so a concurrent operator action on an overlapping range or shard blocks
//! instead of observing a torn intermediate state.

use crate::bucket_map::{BucketMap, BucketMapEntry};
use crate::config::{ControlConfig, Topology};
use crate::error::{Error, Result, ShardManagerError};
use crate::lock_manager::{LockHolders, LockManager};
use crate::member_sync::{MemberSyncState, SyncStateRegistry};
use crate::raft::ShardRaft;
use crate::shard_manager::ShardManagerProtocol;
use crate::types::{BucketRange, NodeId, ShardId, ShardRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What an administrative operation is aimed at.
///
/// A closed set: variants without an implementation fail with an explicit
/// "not supported" error instead of silently doing nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminTarget {
    /// One host process.
    Host,
    /// One shard.
    Shard,
    /// One site (failure domain).
    Site,
    /// One storage unit.
    Storage,
    /// The whole cluster.
    All,
}

impl fmt::Display for AdminTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminTarget::Host => write!(f, "host"),
            AdminTarget::Shard => write!(f, "shard"),
            AdminTarget::Site => write!(f, "site"),
            AdminTarget::Storage => write!(f, "storage"),
            AdminTarget::All => write!(f, "all"),
        }
    }
}

/// Sync record plus local Raft role for one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatusEntry {
    /// Local Raft role, when the replication layer exposes the member here.
    pub role: Option<ShardRole>,
    /// The member's sync record.
    pub sync: MemberSyncState,
}

/// Read-only view of one shard for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatusEntry {
    /// The shard.
    pub shard_id: ShardId,
    /// Current leader, if known.
    pub leader: Option<NodeId>,
    /// Commit index of the shard's log.
    pub commit_index: u64,
    /// Applied index of the local state machine.
    pub applied_index: u64,
    /// Per-member role and sync record.
    pub members: Vec<MemberStatusEntry>,
}

/// Full status snapshot exposed to tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneStatus {
    /// Per-shard replication and sync state.
    pub shards: Vec<ShardStatusEntry>,
    /// The complete bucket ownership ledger.
    pub bucket_map: Vec<BucketMapEntry>,
    /// Current lock holders across all three tiers.
    pub locks: LockHolders,
}

/// The top-level sequencer for bucket-range migrations.
#[derive(Debug)]
pub struct MigrationOrchestrator {
    config: ControlConfig,
    topology: Topology,
    client: Arc<dyn ShardManagerProtocol>,
    bucket_map: Arc<BucketMap>,
    locks: Arc<LockManager>,
    shards: HashMap<ShardId, Arc<dyn ShardRaft>>,
    registry: Arc<SyncStateRegistry>,
    cancel: CancellationToken,
    tracing_enabled: AtomicBool,
}

impl MigrationOrchestrator {
    /// Create an orchestrator.
    ///
    /// `shards` and `registry` back the read-only status surface; the
    /// protocol itself goes through `client`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControlConfig,
        topology: Topology,
        client: Arc<dyn ShardManagerProtocol>,
        bucket_map: Arc<BucketMap>,
        locks: Arc<LockManager>,
        shards: HashMap<ShardId, Arc<dyn ShardRaft>>,
        registry: Arc<SyncStateRegistry>,
    ) -> Self {
        Self {
            config,
            topology,
            client,
            bucket_map,
            locks,
            shards,
            registry,
            cancel: CancellationToken::new(),
            tracing_enabled: AtomicBool::new(false),
        }
    }

    /// Token cancelling every in-flight migration of this orchestrator.
    /// Cancellation runs the same compensating rollback as a timeout.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Toggle step-by-step operation tracing at info level.
    pub fn set_tracing(&self, enabled: bool) {
        self.tracing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Carve a sub-range out of `from` and hand it to `to`.
    pub async fn split_shard(&self, from: ShardId, to: ShardId) -> Result<()> {
        let range = self.lookup_split_range(from, to)?;
        self.assign_buckets(range, from, to).await
    }

    /// Hand every stable range of `from` to `to`.
    pub async fn merge_shard(&self, from: ShardId, to: ShardId) -> Result<()> {
        let ranges = self.stable_ranges_of(from);
        if ranges.is_empty() {
            return Err(Error::Config(format!(
                "shard {} owns no stable ranges to merge",
                from
            )));
        }
        for range in ranges {
            self.assign_buckets(range, from, to).await?;
        }
        Ok(())
    }

    /// Move ownership of `range` from `from` to `to`.
    ///
    /// The single primitive behind split and merge. Validates configuration
    /// before issuing any remote call, then drives observe -> barrier ->
    /// cutover with up to `retry_count` attempts and compensating
    /// `stop_observing` between them. On success the bucket map assigns
    /// `range` to `to` and all of `to`'s members run in normal mode; on
    /// exhausted retries ownership is unchanged and `to`'s members are
    /// reverted best-effort.
    pub async fn assign_buckets(
        &self,
        range: BucketRange,
        from: ShardId,
        to: ShardId,
    ) -> Result<()> {
        self.validate_assignment(range, from, to)?;

        let label = format!("assign {} {}->{}", range, from, to);
        let _held = self
            .locks
            .lock_for_migration(&[from, to], range, label)
            .await;
        // Ownership may have moved while blocked on the locks.
        self.validate_assignment(range, from, to)?;

        self.trace(format_args!(
            "executing assign buckets={} from {} to {}",
            range, from, to
        ));

        let mut last_err = None;
        for attempt in 1..=self.config.retry_count {
            match self.try_assign(range, from, to).await {
                Ok(()) => {
                    self.trace(format_args!("done, buckets={} now on {}", range, to));
                    tracing::info!(%range, from, to, attempt, "bucket assignment complete");
                    return Ok(());
                }
                Err(err) => {
                    // Compensate toward normal mode. Harmless if the
                    // members already left slave mode; its own failure must
                    // not mask the original error.
                    if let Err(rollback) = self
                        .client
                        .stop_observing(to, from, self.config.observe_timeout)
                        .await
                    {
                        tracing::info!(
                            error = %rollback,
                            "rollback stop observing failed, ignoring"
                        );
                    }

                    if !err.is_retryable() {
                        tracing::error!(%range, from, to, error = %err, "bucket assignment aborted");
                        return Err(err);
                    }
                    if attempt != self.config.retry_count {
                        tracing::warn!(
                            attempt,
                            retry_count = self.config.retry_count,
                            error = %err,
                            "assign buckets attempt failed, retrying"
                        );
                    } else {
                        tracing::error!(error = %err, "assign buckets failed, budget exhausted");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("retry budget is zero".to_string())))
    }

    /// One observe -> barrier -> cutover attempt.
    async fn try_assign(&self, range: BucketRange, from: ShardId, to: ShardId) -> Result<()> {
        let migration_id = Uuid::new_v4();

        self.trace(format_args!("initializing slaves on {} ...", to));
        self.cancellable(self.client.start_observing(to, from, self.config.observe_timeout))
            .await?;

        self.trace(format_args!(
            "all members of {} in slave mode, waiting for logs to approach the leader",
            to
        ));
        let approached = self
            .cancellable(
                self.client
                    .wait_slaves_approaching(to, self.config.barrier_timeout),
            )
            .await?;
        if !approached {
            return Err(ShardManagerError::SlaveNotSync { target: to }.into());
        }

        self.trace(format_args!(
            "members of {} approached the leader log, assigning buckets={} ...",
            to, range
        ));
        // The cutover is atomic on the source leader; after it succeeds the
        // target members have left slave mode.
        match self
            .cancellable(self.client.migrate_buckets(
                range,
                from,
                to,
                migration_id,
                self.config.cutover_timeout,
            ))
            .await
        {
            Ok(()) => Ok(()),
            // A timed-out cutover may or may not have applied. Surface the
            // unknown outcome distinctly; an automatic retry could
            // double-apply.
            Err(Error::ShardManager(e)) if e.is_ambiguous() => Err(Error::CutoverUnresolved {
                range,
                src: from,
                target: to,
                migration_id,
                cause: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Run a protocol call, converting cancellation into a failure that
    /// takes the normal compensation path.
    async fn cancellable<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ShardManagerError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = call => result.map_err(Error::from),
        }
    }

    /// Configuration checks: fail fast with no remote effect.
    fn validate_assignment(&self, range: BucketRange, from: ShardId, to: ShardId) -> Result<()> {
        if from == to {
            return Err(Error::Config(format!(
                "source and destination are both shard {}",
                from
            )));
        }
        if !self.topology.contains_shard(from) {
            return Err(Error::Config(format!("unknown shard {}", from)));
        }
        if !self.topology.contains_shard(to) {
            return Err(Error::Config(format!("unknown shard {}", to)));
        }
        if range.hi > self.topology.max_bucket() {
            return Err(Error::Config(format!(
                "range {} exceeds the bucket space (max {})",
                range,
                self.topology.max_bucket()
            )));
        }
        let owner = self.bucket_map.stable_owner_of(range)?;
        if owner != from {
            return Err(Error::Config(format!(
                "range {} is owned by shard {}, not {}",
                range, owner, from
            )));
        }
        Ok(())
    }

    /// Pick the range a split hands off: the upper half of the source's
    /// largest stable range. Pure function of the bucket map.
    fn lookup_split_range(&self, from: ShardId, to: ShardId) -> Result<BucketRange> {
        if !self.topology.contains_shard(to) {
            return Err(Error::Config(format!("unknown shard {}", to)));
        }
        let largest = self
            .stable_ranges_of(from)
            .into_iter()
            .max_by_key(BucketRange::len)
            .ok_or_else(|| {
                Error::Config(format!("shard {} owns no stable ranges to split", from))
            })?;
        if largest.len() < 2 {
            return Err(Error::Config(format!(
                "range {} is too small to split",
                largest
            )));
        }
        let mid = largest.lo + largest.len() / 2;
        Ok(BucketRange {
            lo: mid,
            hi: largest.hi,
        })
    }

    fn stable_ranges_of(&self, shard: ShardId) -> Vec<BucketRange> {
        self.bucket_map
            .snapshot()
            .into_iter()
            .filter(|e| e.owner == shard && e.state.is_stable())
            .map(|e| e.range)
            .collect()
    }

    /// Ask the local member of `shard` to take leadership.
    pub fn set_leader(&self, shard: ShardId) -> Result<()> {
        let handle = self
            .shards
            .get(&shard)
            .ok_or_else(|| Error::Config(format!("unknown shard {}", shard)))?;
        handle.force_leader(std::time::Duration::from_millis(5000))
    }

    /// Enable an administrative target.
    pub fn enable(&self, target: AdminTarget, _id: &str) -> Result<()> {
        Err(Error::NotSupported(format!("enable {}", target)))
    }

    /// Disable an administrative target.
    pub fn disable(&self, target: AdminTarget, _id: &str) -> Result<()> {
        Err(Error::NotSupported(format!("disable {}", target)))
    }

    /// Enable request tracing for an administrative target.
    pub fn enable_tracing(&self, target: AdminTarget, _id: &str) -> Result<()> {
        Err(Error::NotSupported(format!("enable tracing for {}", target)))
    }

    /// Disable request tracing for an administrative target.
    pub fn disable_tracing(&self, target: AdminTarget, _id: &str) -> Result<()> {
        Err(Error::NotSupported(format!("disable tracing for {}", target)))
    }

    /// Read-only status snapshot: per-shard replication state and sync
    /// records, the bucket map, and current lock holders.
    pub fn status(&self) -> ControlPlaneStatus {
        let mut shards = Vec::new();
        for shard_id in self.topology.shard_ids() {
            let handle = self.shards.get(&shard_id);
            let members = self
                .registry
                .members_of_shard(shard_id)
                .into_iter()
                .map(|sync| MemberStatusEntry {
                    role: handle
                        .and_then(|h| h.member(sync.member_id))
                        .map(|m| m.local_role()),
                    sync,
                })
                .collect();
            shards.push(ShardStatusEntry {
                shard_id,
                leader: handle.and_then(|h| h.leader()),
                commit_index: handle.map(|h| h.commit_index()).unwrap_or(0),
                applied_index: handle.map(|h| h.applied_index()).unwrap_or(0),
                members,
            });
        }
        ControlPlaneStatus {
            shards,
            bucket_map: self.bucket_map.snapshot(),
            locks: self.locks.holders(),
        }
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        if self.tracing_enabled.load(Ordering::Relaxed) {
            tracing::info!("[admin] {}", args);
        } else {
            tracing::debug!("[admin] {}", args);
        }
    }
}
