//! Three-tier mutual exclusion for administrative operations.
//!
//! Tiers: one global lock (cluster-wide topology bookkeeping), one lock per
//! shard id, and one lock per in-flight bucket range. Conflicting admin
//! operations serialize on the shard and range tiers for the duration of
//! the whole multi-phase sequence; the global tier is only ever acquired
//! standalone, for the brief bucket map update, and never while blocking on
//! a lower tier.
//!
//! Lock acquisition order is fixed: global, then shard locks in ascending
//! shard id, then the range lock. [`LockManager::lock_for_migration`]
//! performs the shard/range part of that order in one call so circular
//! waits cannot be written by accident.
//!
//! All guards are scoped: dropping a guard on any exit path releases the
//! lock and removes it from the holder table exposed by
//! [`LockManager::holders`].

use crate::types::{BucketRange, ShardId};
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Who currently holds which lock, for the status surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockHolders {
    /// Label of the global lock holder, if held.
    pub global: Option<String>,
    /// Held shard locks, ordered by shard id.
    pub shards: Vec<(ShardId, String)>,
    /// Held range locks, ordered by range.
    pub ranges: Vec<(BucketRange, String)>,
}

#[derive(Debug, Default)]
struct HolderTable {
    global: PlMutex<Option<String>>,
    shards: DashMap<ShardId, String>,
    ranges: DashMap<BucketRange, String>,
}

/// The lock facility. Cheap to clone via `Arc`.
#[derive(Debug, Default)]
pub struct LockManager {
    global: Arc<Mutex<()>>,
    shards: DashMap<ShardId, Arc<Mutex<()>>>,
    ranges: DashMap<BucketRange, Arc<Mutex<()>>>,
    holders: Arc<HolderTable>,
}

/// Guard for the global lock.
#[derive(Debug)]
pub struct GlobalLockGuard {
    _guard: OwnedMutexGuard<()>,
    holders: Arc<HolderTable>,
}

impl Drop for GlobalLockGuard {
    fn drop(&mut self) {
        self.holders.global.lock().take();
    }
}

/// Guard for one shard lock.
#[derive(Debug)]
pub struct ShardLockGuard {
    _guard: OwnedMutexGuard<()>,
    shard: ShardId,
    holders: Arc<HolderTable>,
}

impl Drop for ShardLockGuard {
    fn drop(&mut self) {
        self.holders.shards.remove(&self.shard);
    }
}

/// Guard for one range lock.
#[derive(Debug)]
pub struct RangeLockGuard {
    _guard: OwnedMutexGuard<()>,
    range: BucketRange,
    holders: Arc<HolderTable>,
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        self.holders.ranges.remove(&self.range);
    }
}

/// The full lock set held for one migration: both shard locks plus the
/// range lock, acquired in the fixed order.
#[derive(Debug)]
pub struct MigrationLocks {
    _shards: Vec<ShardLockGuard>,
    _range: RangeLockGuard,
}

impl LockManager {
    /// Create a lock manager with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the global lock. Must be acquired standalone: callers must
    /// not block on shard or range locks while holding it.
    pub async fn acquire_global(&self, label: impl Into<String>) -> GlobalLockGuard {
        let guard = Arc::clone(&self.global).lock_owned().await;
        *self.holders.global.lock() = Some(label.into());
        GlobalLockGuard {
            _guard: guard,
            holders: Arc::clone(&self.holders),
        }
    }

    /// Acquire the lock for one shard.
    pub async fn acquire_shard(&self, shard: ShardId, label: impl Into<String>) -> ShardLockGuard {
        let mutex = self
            .shards
            .entry(shard)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        self.holders.shards.insert(shard, label.into());
        ShardLockGuard {
            _guard: guard,
            shard,
            holders: Arc::clone(&self.holders),
        }
    }

    /// Acquire the lock for one bucket range.
    pub async fn acquire_range(
        &self,
        range: BucketRange,
        label: impl Into<String>,
    ) -> RangeLockGuard {
        let mutex = self
            .ranges
            .entry(range)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        self.holders.ranges.insert(range, label.into());
        RangeLockGuard {
            _guard: guard,
            range,
            holders: Arc::clone(&self.holders),
        }
    }

    /// Acquire every lock a migration needs, in the fixed order: shard
    /// locks ascending by id, then the range lock. Holding the result
    /// serializes any other migration touching either shard or the range.
    pub async fn lock_for_migration(
        &self,
        shards: &[ShardId],
        range: BucketRange,
        label: impl Into<String>,
    ) -> MigrationLocks {
        let label = label.into();
        let mut ids: Vec<ShardId> = shards.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut shard_guards = Vec::with_capacity(ids.len());
        for id in ids {
            shard_guards.push(self.acquire_shard(id, label.clone()).await);
        }
        let range_guard = self.acquire_range(range, label).await;
        MigrationLocks {
            _shards: shard_guards,
            _range: range_guard,
        }
    }

    /// Current holders across all three tiers.
    pub fn holders(&self) -> LockHolders {
        let mut shards: Vec<(ShardId, String)> = self
            .holders
            .shards
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shards.sort_by_key(|(id, _)| *id);

        let mut ranges: Vec<(BucketRange, String)> = self
            .holders
            .ranges
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ranges.sort_by_key(|(range, _)| *range);

        LockHolders {
            global: self.holders.global.lock().clone(),
            shards,
            ranges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn range(lo: u64, hi: u64) -> BucketRange {
        BucketRange::new(lo, hi).unwrap()
    }

    #[tokio::test]
    async fn test_guard_release_on_drop() {
        let locks = LockManager::new();
        {
            let _guard = locks.acquire_shard(1, "op-a").await;
            assert_eq!(locks.holders().shards, vec![(1, "op-a".to_string())]);
        }
        assert!(locks.holders().shards.is_empty());

        // Released lock can be re-acquired immediately.
        let _guard = locks.acquire_shard(1, "op-b").await;
        assert_eq!(locks.holders().shards, vec![(1, "op-b".to_string())]);
    }

    #[tokio::test]
    async fn test_same_shard_serializes() {
        let locks = Arc::new(LockManager::new());
        let guard = locks.acquire_shard(1, "first").await;

        let locks2 = Arc::clone(&locks);
        let second = tokio::spawn(async move { locks2.acquire_shard(1, "second").await });

        // Second acquisition blocks while the first guard lives.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), second)
            .await
            .expect("second acquisition should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_shards_do_not_block() {
        let locks = LockManager::new();
        let _a = locks.acquire_shard(1, "a").await;
        // A different shard id is immediately available.
        let _b = timeout(Duration::from_millis(100), locks.acquire_shard(2, "b"))
            .await
            .expect("disjoint shard lock should not block");
        assert_eq!(locks.holders().shards.len(), 2);
    }

    #[tokio::test]
    async fn test_migration_lock_set() {
        let locks = Arc::new(LockManager::new());
        let held = locks
            .lock_for_migration(&[2, 1], range(10, 20), "migrate")
            .await;

        let holders = locks.holders();
        assert_eq!(holders.shards.len(), 2);
        assert_eq!(holders.ranges, vec![(range(10, 20), "migrate".to_string())]);

        // An overlapping migration blocks on the shard tier.
        let locks2 = Arc::clone(&locks);
        let blocked =
            tokio::spawn(
                async move { locks2.lock_for_migration(&[1, 3], range(30, 40), "other").await },
            );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(held);
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked migration should proceed after release")
            .unwrap();
        assert!(locks.holders().global.is_none());
    }

    #[tokio::test]
    async fn test_global_lock_holder() {
        let locks = LockManager::new();
        let guard = locks.acquire_global("bucket map update").await;
        assert_eq!(
            locks.holders().global,
            Some("bucket map update".to_string())
        );
        drop(guard);
        assert!(locks.holders().global.is_none());
    }
}
