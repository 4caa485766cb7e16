//! Per-member synchronization state.
//!
//! Every member carries a `(mode, status)` record describing whether it is a
//! plain replica, an observing slave of a foreign shard's leader, or inside
//! the two cutover sub-phases. Records are created at process start in
//! `(Normal, Stop)` and mutated exclusively by the shard manager server's
//! request handlers — never by the member itself and never from timers — so
//! every transition is externally auditable and replayable in tests.

use crate::types::{NodeId, ShardId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

/// What role the member is currently playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Ordinary replica of its own shard's leader.
    Normal,
    /// Replicating from a foreign shard's leader ahead of a range handoff.
    Slave,
    /// Cutover sub-phase before the ownership flip is durably recorded.
    Migrating1,
    /// Cutover sub-phase after the ownership flip is durably recorded.
    Migrating2,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Normal => write!(f, "normal"),
            SyncMode::Slave => write!(f, "slave"),
            SyncMode::Migrating1 => write!(f, "migrating_1"),
            SyncMode::Migrating2 => write!(f, "migrating_2"),
        }
    }
}

/// Progress of the member within its current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Sync not started.
    Stop,
    /// Actively replicating, not yet caught up.
    Running,
    /// Unrecoverable local error; the mode is non-operational.
    Failed,
    /// Caught up with the source leader.
    Synced,
    /// Log position within the acceptance margin of the source leader.
    Approached,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Stop => write!(f, "stop"),
            SyncStatus::Running => write!(f, "running"),
            SyncStatus::Failed => write!(f, "failed"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Approached => write!(f, "approached"),
        }
    }
}

/// The `(mode, status)` record for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSyncState {
    /// The member this record describes.
    pub member_id: NodeId,
    /// The shard the member belongs to.
    pub shard_id: ShardId,
    /// Current mode.
    pub mode: SyncMode,
    /// Current status within the mode.
    pub status: SyncStatus,
    /// Foreign leader being observed, when in slave mode.
    pub master: Option<NodeId>,
    /// Failure reason, when status is `Failed`.
    pub reason: Option<String>,
}

impl MemberSyncState {
    /// Fresh record in `(Normal, Stop)`.
    pub fn new(member_id: NodeId, shard_id: ShardId) -> Self {
        Self {
            member_id,
            shard_id,
            mode: SyncMode::Normal,
            status: SyncStatus::Stop,
            master: None,
            reason: None,
        }
    }

    /// Slave mode with a non-failed status.
    pub fn is_slave_operational(&self) -> bool {
        self.mode == SyncMode::Slave && self.status != SyncStatus::Failed
    }

    /// Normal mode, actively replicating.
    pub fn is_normal_operational(&self) -> bool {
        self.mode == SyncMode::Normal && self.status == SyncStatus::Running
    }

    /// First cutover sub-phase, actively replicating.
    pub fn is_migrating1_operational(&self) -> bool {
        self.mode == SyncMode::Migrating1 && self.status == SyncStatus::Running
    }

    /// Second cutover sub-phase, actively replicating.
    pub fn is_migrating2_operational(&self) -> bool {
        self.mode == SyncMode::Migrating2 && self.status == SyncStatus::Running
    }

    /// Whether the slave's log is close enough for cutover.
    pub fn is_cutover_ready(&self) -> bool {
        self.mode == SyncMode::Slave
            && matches!(self.status, SyncStatus::Approached | SyncStatus::Synced)
    }
}

/// One audited transition of a member record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTransition {
    /// The member whose record changed.
    pub member_id: NodeId,
    /// Record before the change.
    pub from: (SyncMode, SyncStatus),
    /// Record after the change.
    pub to: (SyncMode, SyncStatus),
}

/// Registry of member sync records, keyed by member id.
///
/// Only shard manager server request handlers mutate this; waiters blocked
/// on a barrier are woken on every transition.
#[derive(Debug, Default)]
pub struct SyncStateRegistry {
    states: RwLock<HashMap<NodeId, MemberSyncState>>,
    history: RwLock<Vec<SyncTransition>>,
    changed: Arc<Notify>,
}

impl SyncStateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member in `(Normal, Stop)`. No-op if already present.
    pub fn register(&self, member_id: NodeId, shard_id: ShardId) {
        self.states
            .write()
            .entry(member_id)
            .or_insert_with(|| MemberSyncState::new(member_id, shard_id));
    }

    /// Current record for a member.
    pub fn get(&self, member_id: NodeId) -> Option<MemberSyncState> {
        self.states.read().get(&member_id).cloned()
    }

    /// Records of every member of `shard`.
    pub fn members_of_shard(&self, shard: ShardId) -> Vec<MemberSyncState> {
        let mut members: Vec<_> = self
            .states
            .read()
            .values()
            .filter(|s| s.shard_id == shard)
            .cloned()
            .collect();
        members.sort_by_key(|s| s.member_id);
        members
    }

    /// Apply a transition to a member record, recording it in the audit
    /// history and waking barrier waiters. Returns the updated record.
    pub fn transition(
        &self,
        member_id: NodeId,
        mode: SyncMode,
        status: SyncStatus,
        master: Option<NodeId>,
        reason: Option<String>,
    ) -> Option<MemberSyncState> {
        let updated = {
            let mut states = self.states.write();
            let state = states.get_mut(&member_id)?;
            let from = (state.mode, state.status);
            state.mode = mode;
            state.status = status;
            state.master = master;
            state.reason = reason;
            let to = (state.mode, state.status);
            if from != to {
                self.history.write().push(SyncTransition {
                    member_id,
                    from,
                    to,
                });
            }
            state.clone()
        };
        self.changed.notify_waiters();
        Some(updated)
    }

    /// Wait until the registry changes. Used by in-process barrier waiters;
    /// remote waiters poll through the shard manager protocol instead.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Full transition history, oldest first.
    pub fn history(&self) -> Vec<SyncTransition> {
        self.history.read().clone()
    }

    /// Snapshot of every record, ordered by member id.
    pub fn snapshot(&self) -> Vec<MemberSyncState> {
        let mut all: Vec<_> = self.states.read().values().cloned().collect();
        all.sort_by_key(|s| s.member_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_record() {
        let registry = SyncStateRegistry::new();
        registry.register(1, 10);
        let state = registry.get(1).unwrap();
        assert_eq!(state.mode, SyncMode::Normal);
        assert_eq!(state.status, SyncStatus::Stop);
        assert!(state.master.is_none());
    }

    #[test]
    fn test_operational_predicates() {
        let mut state = MemberSyncState::new(1, 10);
        state.mode = SyncMode::Slave;
        state.status = SyncStatus::Running;
        assert!(state.is_slave_operational());
        assert!(!state.is_normal_operational());

        state.status = SyncStatus::Failed;
        assert!(!state.is_slave_operational());

        state.mode = SyncMode::Normal;
        state.status = SyncStatus::Running;
        assert!(state.is_normal_operational());

        state.mode = SyncMode::Migrating1;
        assert!(state.is_migrating1_operational());
        state.mode = SyncMode::Migrating2;
        assert!(state.is_migrating2_operational());
    }

    #[test]
    fn test_cutover_ready() {
        let mut state = MemberSyncState::new(1, 10);
        state.mode = SyncMode::Slave;
        state.status = SyncStatus::Approached;
        assert!(state.is_cutover_ready());
        state.status = SyncStatus::Synced;
        assert!(state.is_cutover_ready());
        state.status = SyncStatus::Running;
        assert!(!state.is_cutover_ready());
    }

    #[test]
    fn test_transition_history() {
        let registry = SyncStateRegistry::new();
        registry.register(1, 10);

        registry
            .transition(1, SyncMode::Slave, SyncStatus::Running, Some(7), None)
            .unwrap();
        registry
            .transition(1, SyncMode::Slave, SyncStatus::Approached, Some(7), None)
            .unwrap();
        registry
            .transition(1, SyncMode::Normal, SyncStatus::Stop, None, None)
            .unwrap();

        let history = registry.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from, (SyncMode::Normal, SyncStatus::Stop));
        assert_eq!(history[0].to, (SyncMode::Slave, SyncStatus::Running));
        assert_eq!(history[2].to, (SyncMode::Normal, SyncStatus::Stop));
    }

    #[test]
    fn test_transition_unknown_member() {
        let registry = SyncStateRegistry::new();
        assert!(registry
            .transition(9, SyncMode::Slave, SyncStatus::Running, None, None)
            .is_none());
    }

    #[test]
    fn test_members_of_shard() {
        let registry = SyncStateRegistry::new();
        registry.register(3, 10);
        registry.register(1, 10);
        registry.register(5, 20);

        let members = registry.members_of_shard(10);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].member_id, 1);
        assert_eq!(members[1].member_id, 3);
    }
}
