//! In-process test harness for the migration control plane.
//!
//! Provides stub implementations of the consumed replication and transport
//! contracts plus a [`TestBed`] that wires whole shards together in one
//! process:
//! - [`StubRaftMember`] — controllable slave replication (catch up, stall
//!   at a fixed lag, or fail),
//! - [`StubShardRaft`] — per-shard leader and log indexes,
//! - [`LocalTransport`] — routes protocol calls to registered servers
//!   through the real wire codec, with per-member black-holes for timeout
//!   injection and a call log for "zero remote calls" assertions.

mod migration_tests;

use crate::bucket_map::BucketMap;
use crate::config::{ControlConfig, Topology};
use crate::error::{Error, Result, ShardManagerError};
use crate::lock_manager::LockManager;
use crate::member_sync::SyncStateRegistry;
use crate::raft::{RaftMember, ShardRaft, SlaveReplication};
use crate::shard_manager::{
    decode_request, decode_response, encode_request, encode_response, RemoteShardManagerClient,
    ShardManagerRequest, ShardManagerResponse, ShardManagerServer,
};
use crate::transport::{MemberChannel, ShardManagerTransport};
use crate::types::{BucketRange, NodeId, ShardId, ShardRole};
use crate::MigrationOrchestrator;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a stub member behaves while in slave mode.
#[derive(Debug, Clone)]
pub enum SyncBehavior {
    /// Immediately caught up with the source leader.
    CatchUp,
    /// Stuck a fixed number of entries behind the source leader.
    Stall(u64),
    /// Replication fails with the given reason.
    Fail(String),
}

/// Stub member handle with controllable slave replication.
#[derive(Debug)]
pub struct StubRaftMember {
    member_id: NodeId,
    role: Mutex<ShardRole>,
    behavior: Mutex<SyncBehavior>,
    master: Mutex<Option<NodeId>>,
    // Source leader's commit index as this member would see it.
    source_commit: AtomicU64,
    set_slave_error: Mutex<Option<String>>,
}

impl StubRaftMember {
    /// Create a member with the given role, caught-up behavior, and a
    /// source log of `source_commit` entries.
    pub fn new(member_id: NodeId, role: ShardRole, source_commit: u64) -> Self {
        Self {
            member_id,
            role: Mutex::new(role),
            behavior: Mutex::new(SyncBehavior::CatchUp),
            master: Mutex::new(None),
            source_commit: AtomicU64::new(source_commit),
            set_slave_error: Mutex::new(None),
        }
    }

    /// Change the member's slave-replication behavior.
    pub fn set_behavior(&self, behavior: SyncBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Change the member's Raft role.
    pub fn set_role(&self, role: ShardRole) {
        *self.role.lock() = role;
    }

    /// Make the next `set_slave(Some(_))` calls fail.
    pub fn fail_set_slave(&self, reason: impl Into<String>) {
        *self.set_slave_error.lock() = Some(reason.into());
    }

    /// Whether the member is currently in slave mode.
    pub fn observing(&self) -> Option<NodeId> {
        *self.master.lock()
    }
}

impl RaftMember for StubRaftMember {
    fn member_id(&self) -> NodeId {
        self.member_id
    }

    fn local_role(&self) -> ShardRole {
        *self.role.lock()
    }

    fn set_slave(&self, master: Option<NodeId>) -> Result<()> {
        if master.is_some() {
            if let Some(reason) = self.set_slave_error.lock().clone() {
                return Err(Error::Internal(reason));
            }
        }
        *self.master.lock() = master;
        Ok(())
    }

    fn slave_status(&self) -> Option<SlaveReplication> {
        let master = (*self.master.lock())?;
        let commit = self.source_commit.load(Ordering::Relaxed);
        Some(match self.behavior.lock().clone() {
            SyncBehavior::CatchUp => SlaveReplication {
                master,
                running: true,
                commit_index: commit,
                saved_index: commit,
                error: None,
            },
            SyncBehavior::Stall(lag) => SlaveReplication {
                master,
                running: true,
                commit_index: commit,
                saved_index: commit.saturating_sub(lag),
                error: None,
            },
            SyncBehavior::Fail(reason) => SlaveReplication {
                master,
                running: false,
                commit_index: commit,
                saved_index: 0,
                error: Some(reason),
            },
        })
    }
}

/// Stub per-shard replication handle.
#[derive(Debug)]
pub struct StubShardRaft {
    shard_id: ShardId,
    leader: Mutex<Option<NodeId>>,
    commit_index: AtomicU64,
    applied_index: AtomicU64,
    members: HashMap<NodeId, Arc<StubRaftMember>>,
}

impl StubShardRaft {
    /// Create a shard with the given members and leader.
    pub fn new(
        shard_id: ShardId,
        members: HashMap<NodeId, Arc<StubRaftMember>>,
        leader: Option<NodeId>,
        commit_index: u64,
    ) -> Self {
        Self {
            shard_id,
            leader: Mutex::new(leader),
            commit_index: AtomicU64::new(commit_index),
            applied_index: AtomicU64::new(commit_index),
            members,
        }
    }

    /// Move leadership to another member, updating member roles.
    pub fn set_leader(&self, leader: Option<NodeId>) {
        *self.leader.lock() = leader;
        for (id, member) in &self.members {
            member.set_role(if Some(*id) == leader {
                ShardRole::Leader
            } else {
                ShardRole::Follower
            });
        }
    }
}

impl ShardRaft for StubShardRaft {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn leader(&self) -> Option<NodeId> {
        *self.leader.lock()
    }

    fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Relaxed)
    }

    fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Relaxed)
    }

    fn force_leader(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn member_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn member(&self, id: NodeId) -> Option<Arc<dyn RaftMember>> {
        self.members
            .get(&id)
            .map(|m| Arc::clone(m) as Arc<dyn RaftMember>)
    }
}

/// In-process transport routing calls to registered servers.
///
/// Requests and responses pass through the real wire codec so the message
/// types stay honest. A black-holed member swallows calls until the budget
/// elapses, surfacing the ambiguous [`ShardManagerError::Timeout`].
#[derive(Debug, Default)]
pub struct LocalTransport {
    servers: RwLock<HashMap<NodeId, Arc<ShardManagerServer>>>,
    black_holes: Mutex<HashSet<NodeId>>,
    calls: Mutex<Vec<(NodeId, ShardManagerRequest)>>,
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member's server.
    pub fn register(&self, member: NodeId, server: Arc<ShardManagerServer>) {
        self.servers.write().insert(member, server);
    }

    /// Swallow all calls to `member` until the caller's budget elapses.
    pub fn black_hole(&self, member: NodeId) {
        self.black_holes.lock().insert(member);
    }

    /// Restore delivery to `member`.
    pub fn heal(&self, member: NodeId) {
        self.black_holes.lock().remove(&member);
    }

    /// Every request delivered or attempted so far.
    pub fn calls(&self) -> Vec<(NodeId, ShardManagerRequest)> {
        self.calls.lock().clone()
    }

    /// Number of recorded requests matching the filter.
    pub fn count_calls(&self, filter: impl Fn(&NodeId, &ShardManagerRequest) -> bool) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(member, req)| filter(member, req))
            .count()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl MemberChannel for LocalTransport {
    fn is_operational(&self, member: NodeId) -> bool {
        !self.black_holes.lock().contains(&member) && self.servers.read().contains_key(&member)
    }

    async fn await_operational(&self, member: NodeId, timeout: Duration) -> Result<()> {
        let done = crate::util::poll_until(
            move || async move { Ok(self.is_operational(member)) },
            Duration::from_millis(10),
            Some(timeout),
        )
        .await?;
        if done {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }
}

#[async_trait]
impl ShardManagerTransport for LocalTransport {
    async fn call(
        &self,
        member: NodeId,
        request: ShardManagerRequest,
        timeout: Duration,
    ) -> std::result::Result<ShardManagerResponse, ShardManagerError> {
        self.calls.lock().push((member, request.clone()));

        if self.black_holes.lock().contains(&member) {
            tokio::time::sleep(timeout).await;
            return Err(ShardManagerError::Timeout);
        }
        let server = self
            .servers
            .read()
            .get(&member)
            .cloned()
            .ok_or_else(|| ShardManagerError::Transport(format!("no route to member {}", member)))?;

        let encoded =
            encode_request(&request).map_err(|e| ShardManagerError::Transport(e.to_string()))?;
        let request =
            decode_request(&encoded).map_err(|e| ShardManagerError::Transport(e.to_string()))?;

        // Run the handler on its own task: a remote server keeps executing
        // even if the caller gives up on the reply.
        let response = tokio::spawn(async move { server.handle_request(request).await })
            .await
            .map_err(|e| ShardManagerError::Transport(e.to_string()))?;

        let encoded =
            encode_response(&response).map_err(|e| ShardManagerError::Transport(e.to_string()))?;
        decode_response(&encoded).map_err(|e| ShardManagerError::Transport(e.to_string()))
    }
}

/// A whole control plane wired in one process.
#[derive(Debug)]
pub struct TestBed {
    /// Shared bucket map.
    pub bucket_map: Arc<BucketMap>,
    /// Shared lock manager.
    pub locks: Arc<LockManager>,
    /// Shared sync registry (all member records).
    pub registry: Arc<SyncStateRegistry>,
    /// The in-process transport.
    pub transport: Arc<LocalTransport>,
    /// Direct protocol client, for exercising calls outside the
    /// orchestrator.
    pub client: Arc<RemoteShardManagerClient>,
    /// The orchestrator under test.
    pub orchestrator: Arc<MigrationOrchestrator>,
    /// Member stubs by id.
    pub members: HashMap<NodeId, Arc<StubRaftMember>>,
    /// Shard stubs by id.
    pub shard_rafts: HashMap<ShardId, Arc<StubShardRaft>>,
}

impl TestBed {
    /// Build a control plane from `(shard, members, leader)` triples and
    /// initial bucket assignments.
    pub fn build(
        config: ControlConfig,
        bucket_count: u64,
        shards: Vec<(ShardId, Vec<NodeId>, NodeId)>,
        assignments: Vec<(BucketRange, ShardId)>,
    ) -> Self {
        let mut topology = Topology::new(bucket_count);
        for (shard, members, _) in &shards {
            topology = topology.with_shard(*shard, members.clone());
        }
        topology.validate().expect("valid test topology");

        let bucket_map =
            Arc::new(BucketMap::from_assignments(bucket_count, assignments).expect("valid map"));
        let locks = Arc::new(LockManager::new());
        let registry = Arc::new(SyncStateRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        let mut members: HashMap<NodeId, Arc<StubRaftMember>> = HashMap::new();
        let mut shard_rafts: HashMap<ShardId, Arc<StubShardRaft>> = HashMap::new();
        for (shard, shard_members, leader) in &shards {
            let mut shard_stub_members = HashMap::new();
            for member in shard_members {
                let role = if member == leader {
                    ShardRole::Leader
                } else {
                    ShardRole::Follower
                };
                let stub = Arc::new(StubRaftMember::new(*member, role, 1000));
                shard_stub_members.insert(*member, Arc::clone(&stub));
                members.insert(*member, stub);
            }
            shard_rafts.insert(
                *shard,
                Arc::new(StubShardRaft::new(
                    *shard,
                    shard_stub_members,
                    Some(*leader),
                    1000,
                )),
            );
        }

        let raft_handles: HashMap<ShardId, Arc<dyn ShardRaft>> = shard_rafts
            .iter()
            .map(|(id, raft)| (*id, Arc::clone(raft) as Arc<dyn ShardRaft>))
            .collect();

        for (shard, shard_members, _) in &shards {
            for member in shard_members {
                let server = Arc::new(ShardManagerServer::new(
                    *member,
                    *shard,
                    config.clone(),
                    topology.clone(),
                    members[member].clone() as Arc<dyn RaftMember>,
                    raft_handles.clone(),
                    Arc::clone(&registry),
                    Arc::clone(&bucket_map),
                    Arc::clone(&locks),
                ));
                server.set_transport(Arc::clone(&transport) as Arc<dyn ShardManagerTransport>);
                transport.register(*member, server);
            }
        }

        let client = Arc::new(RemoteShardManagerClient::new(
            topology.clone(),
            config.clone(),
            Arc::clone(&transport) as Arc<dyn ShardManagerTransport>,
        ));
        let orchestrator = Arc::new(MigrationOrchestrator::new(
            config,
            topology,
            Arc::clone(&client) as Arc<dyn crate::shard_manager::ShardManagerProtocol>,
            Arc::clone(&bucket_map),
            Arc::clone(&locks),
            raft_handles,
            Arc::clone(&registry),
        ));

        Self {
            bucket_map,
            locks,
            registry,
            transport,
            client,
            orchestrator,
            members,
            shard_rafts,
        }
    }

    /// Two shards: shard 1 = members 1-3 (leader 1) owning buckets 0-49,
    /// shard 2 = members 4-6 (leader 4) owning buckets 50-99.
    pub fn two_shards(config: ControlConfig) -> Self {
        Self::build(
            config,
            100,
            vec![(1, vec![1, 2, 3], 1), (2, vec![4, 5, 6], 4)],
            vec![
                (BucketRange::new(0, 49).unwrap(), 1),
                (BucketRange::new(50, 99).unwrap(), 2),
            ],
        )
    }

    /// Four shards over 200 buckets, 50 each, for concurrency tests.
    pub fn four_shards(config: ControlConfig) -> Self {
        Self::build(
            config,
            200,
            vec![
                (1, vec![1, 2], 1),
                (2, vec![3, 4], 3),
                (3, vec![5, 6], 5),
                (4, vec![7, 8], 7),
            ],
            vec![
                (BucketRange::new(0, 49).unwrap(), 1),
                (BucketRange::new(50, 99).unwrap(), 2),
                (BucketRange::new(100, 149).unwrap(), 3),
                (BucketRange::new(150, 199).unwrap(), 4),
            ],
        )
    }

    /// A fast configuration for tests: short budgets, tight polling.
    pub fn fast_config() -> ControlConfig {
        ControlConfig::new()
            .with_observe_timeout(Duration::from_millis(500))
            .with_cutover_timeout(Duration::from_millis(200))
            .with_barrier_timeout(Some(Duration::from_millis(200)))
            .with_poll_interval(Duration::from_millis(10))
    }
}
