//! Control plane for live bucket-range migration between Raft-replicated
//! shards.
//!
//! This crate lets an operator move ranges of the hashed key space
//! ("buckets") between shards while the cluster keeps serving traffic. It
//! drives a multi-phase handoff protocol with explicit state machines,
//! barrier synchronization, idempotent retries, and compensating rollback:
//!
//! 1. **Observe** — every member of the destination shard starts
//!    replicating from the source shard's leader as a slave.
//! 2. **Barrier** — the orchestrator waits until every slave's log position
//!    is within an acceptance margin of the source leader's.
//! 3. **Cutover** — the source leader atomically flips bucket ownership and
//!    winds the slaves down to normal operation.
//!
//! Failures roll affected members back toward normal mode and retry up to a
//! fixed budget; a cutover that times out without a reply is surfaced as a
//! distinct unknown-outcome condition instead of being retried blindly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  MigrationOrchestrator                      │
//! │   split_shard / merge_shard / assign_buckets / status       │
//! └─────────────────────────────────────────────────────────────┘
//!        │ locks (global/shard/range)          │ protocol calls
//!        ▼                                     ▼
//! ┌──────────────┐  ┌──────────────┐  ┌─────────────────────────┐
//! │ LockManager  │  │  BucketMap   │  │ RemoteShardManagerClient│
//! └──────────────┘  └──────────────┘  └─────────────────────────┘
//!                          ▲                   │ transport
//!                          │                   ▼
//!                   ┌──────┴──────────────────────────┐
//!                   │   ShardManagerServer (per member)│
//!                   │   drives the member sync records │
//!                   │   and the atomic cutover         │
//!                   └──────────────────────────────────┘
//! ```
//!
//! The Raft consensus engine, the reconnecting peer transport, and the
//! REST/CLI admin surface are external collaborators consumed through the
//! traits in [`raft`] and [`transport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use portage::{ControlConfig, MigrationOrchestrator};
//!
//! // Wire the orchestrator against your shard manager client, bucket map,
//! // and lock manager, then move buckets 10..=20 from shard 1 to shard 2:
//! orchestrator.assign_buckets(range, 1, 2).await?;
//!
//! // Or let the orchestrator compute the affected range:
//! orchestrator.split_shard(1, 2).await?;
//! ```

pub mod admin;
pub mod bucket_map;
pub mod config;
pub mod error;
pub mod lock_manager;
pub mod member_sync;
pub mod raft;
pub mod shard_manager;
pub mod testing;
pub mod transport;
pub mod types;
pub mod util;

// Re-export main types for convenience
pub use admin::{
    AdminTarget, ControlPlaneStatus, MemberStatusEntry, MigrationOrchestrator, ShardStatusEntry,
};
pub use bucket_map::{BucketMap, BucketMapEntry, MigrationState};
pub use config::{ControlConfig, Topology};
pub use error::{Error, Result, ShardManagerError};
pub use lock_manager::{LockHolders, LockManager, MigrationLocks};
pub use member_sync::{MemberSyncState, SyncMode, SyncStateRegistry, SyncStatus, SyncTransition};
pub use raft::{RaftMember, ShardRaft, SlaveReplication};
pub use shard_manager::{
    RemoteShardManagerClient, ShardManagerProtocol, ShardManagerRequest, ShardManagerResponse,
    ShardManagerServer,
};
pub use transport::{MemberChannel, ShardManagerTransport};
pub use types::{BucketId, BucketRange, NodeId, ShardId, ShardRole};
