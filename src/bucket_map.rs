//! Range-keyed bucket ownership ledger.
//!
//! The bucket map records which shard owns each range of the hashed key
//! space, plus a per-range migration tag while a handoff is in flight. It is
//! pure data: durability is delegated to the replication layer, which stores
//! the map as replicated state.
//!
//! The map is keyed by range start in a `BTreeMap`, so point lookups are a
//! single ordered probe. All mutations happen under one write lock and are
//! visible atomically: a reader never observes a bucket with no owner or two
//! overlapping ranges.

use crate::error::{Error, Result};
use crate::types::{BucketId, BucketRange, ShardId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Migration tag on a range of buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// No migration in flight.
    Stable,
    /// The owning shard is handing the range off to `ShardId`.
    MigratingOut(ShardId),
    /// The owning shard has just taken the range over from `ShardId` and the
    /// handoff is not yet fully wound down.
    MigratingIn(ShardId),
}

impl MigrationState {
    /// Whether the range is outside any migration window.
    pub fn is_stable(&self) -> bool {
        matches!(self, MigrationState::Stable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BucketEntry {
    hi: BucketId,
    owner: ShardId,
    state: MigrationState,
}

/// One row of a bucket map snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMapEntry {
    /// The bucket range this row covers.
    pub range: BucketRange,
    /// Owning shard.
    pub owner: ShardId,
    /// Migration tag.
    pub state: MigrationState,
}

/// The ownership ledger mapping disjoint bucket ranges to shards.
#[derive(Debug)]
pub struct BucketMap {
    bucket_count: u64,
    // Keyed by range start; each entry holds its inclusive end.
    inner: RwLock<BTreeMap<BucketId, BucketEntry>>,
}

impl BucketMap {
    /// Build a map from initial assignments covering `[0, bucket_count)`.
    ///
    /// Fails if the assignments leave a gap, overlap, or run past the end of
    /// the bucket space.
    pub fn from_assignments(
        bucket_count: u64,
        assignments: Vec<(BucketRange, ShardId)>,
    ) -> Result<Self> {
        if bucket_count == 0 {
            return Err(Error::Config("bucket count must be positive".to_string()));
        }
        let mut sorted = assignments;
        sorted.sort_by_key(|(range, _)| range.lo);

        let mut map = BTreeMap::new();
        let mut next = 0u64;
        for (range, owner) in sorted {
            if range.lo != next {
                return Err(Error::Config(format!(
                    "bucket assignments leave a gap or overlap at bucket {}",
                    next
                )));
            }
            map.insert(
                range.lo,
                BucketEntry {
                    hi: range.hi,
                    owner,
                    state: MigrationState::Stable,
                },
            );
            next = range.hi + 1;
        }
        if next != bucket_count {
            return Err(Error::Config(format!(
                "bucket assignments cover up to {}, expected {}",
                next, bucket_count
            )));
        }
        Ok(Self {
            bucket_count,
            inner: RwLock::new(map),
        })
    }

    /// Total number of buckets in the key space.
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// Owner of a single bucket.
    pub fn lookup(&self, bucket: BucketId) -> Option<ShardId> {
        let map = self.inner.read();
        let (_, entry) = map.range(..=bucket).next_back()?;
        if entry.hi >= bucket {
            Some(entry.owner)
        } else {
            None
        }
    }

    /// All ranges currently owned by `shard`.
    pub fn ranges_of(&self, shard: ShardId) -> Vec<BucketRange> {
        self.inner
            .read()
            .iter()
            .filter(|(_, entry)| entry.owner == shard)
            .map(|(lo, entry)| BucketRange { lo: *lo, hi: entry.hi })
            .collect()
    }

    /// Owner of `range`, provided it is exactly covered by entries under a
    /// single owner.
    pub fn owner_of(&self, range: BucketRange) -> Result<ShardId> {
        let map = self.inner.read();
        let covering = Self::covering(&map, range)?;
        Self::single_owner(&covering, range)
    }

    /// Owner of `range`, additionally requiring every covered entry to be
    /// outside any migration window.
    pub fn stable_owner_of(&self, range: BucketRange) -> Result<ShardId> {
        let map = self.inner.read();
        let covering = Self::covering(&map, range)?;
        for (lo, entry) in &covering {
            if !entry.state.is_stable() {
                return Err(Error::Config(format!(
                    "range [{}..{}] is already migrating",
                    lo, entry.hi
                )));
            }
        }
        Self::single_owner(&covering, range)
    }

    /// Reassign `range` to `new_owner`.
    ///
    /// Fails unless the range is exactly covered by existing entries under a
    /// single current owner; partial or overlapping assignment is rejected.
    /// Returns the previous owner.
    pub fn assign(&self, range: BucketRange, new_owner: ShardId) -> Result<ShardId> {
        let mut map = self.inner.write();
        let covering = Self::covering(&map, range)?;
        let old_owner = Self::single_owner(&covering, range)?;
        Self::replace(&mut map, &covering, range, new_owner, MigrationState::Stable);
        Self::coalesce_around(&mut map, range.lo);
        Ok(old_owner)
    }

    /// Open a migration window: tag `range` as handing off to `to`.
    ///
    /// The range must be exactly covered, under a single owner, and stable;
    /// only one migration may be in flight per range.
    pub fn begin_migration(&self, range: BucketRange, to: ShardId) -> Result<ShardId> {
        let mut map = self.inner.write();
        let covering = Self::covering(&map, range)?;
        let owner = Self::single_owner(&covering, range)?;
        for (_, entry) in &covering {
            if !entry.state.is_stable() {
                return Err(Error::Config(format!(
                    "range {} is already migrating",
                    range
                )));
            }
        }
        Self::replace(
            &mut map,
            &covering,
            range,
            owner,
            MigrationState::MigratingOut(to),
        );
        Ok(owner)
    }

    /// Record the ownership flip for a range previously opened with
    /// [`begin_migration`](Self::begin_migration). The range moves to `to`
    /// tagged as migrating in from the old owner.
    pub fn complete_migration(&self, range: BucketRange, to: ShardId) -> Result<ShardId> {
        let mut map = self.inner.write();
        let covering = Self::covering(&map, range)?;
        let old_owner = Self::single_owner(&covering, range)?;
        for (_, entry) in &covering {
            if entry.state != MigrationState::MigratingOut(to) {
                return Err(Error::Internal(format!(
                    "range {} is not migrating out to shard {}",
                    range, to
                )));
            }
        }
        Self::replace(
            &mut map,
            &covering,
            range,
            to,
            MigrationState::MigratingIn(old_owner),
        );
        Ok(old_owner)
    }

    /// Close the migration window: reset `range` to stable and merge it with
    /// adjacent stable ranges of the same owner.
    pub fn end_migration(&self, range: BucketRange) -> Result<()> {
        let mut map = self.inner.write();
        let covering = Self::covering(&map, range)?;
        let owner = Self::single_owner(&covering, range)?;
        Self::replace(&mut map, &covering, range, owner, MigrationState::Stable);
        Self::coalesce_around(&mut map, range.lo);
        Ok(())
    }

    /// Roll a not-yet-flipped migration window back to stable.
    pub fn abort_migration(&self, range: BucketRange) -> Result<()> {
        self.end_migration(range)
    }

    /// Atomic snapshot of the whole map for the status surface.
    pub fn snapshot(&self) -> Vec<BucketMapEntry> {
        self.inner
            .read()
            .iter()
            .map(|(lo, entry)| BucketMapEntry {
                range: BucketRange { lo: *lo, hi: entry.hi },
                owner: entry.owner,
                state: entry.state,
            })
            .collect()
    }

    /// Verify the partition invariant: entries tile `[0, bucket_count)` with
    /// no gaps and no overlaps.
    pub fn check_partition(&self) -> Result<()> {
        let map = self.inner.read();
        let mut next = 0u64;
        for (lo, entry) in map.iter() {
            if *lo != next || entry.hi < *lo {
                return Err(Error::Internal(format!(
                    "bucket map broken at bucket {} (entry starts at {})",
                    next, lo
                )));
            }
            next = entry.hi + 1;
        }
        if next != self.bucket_count {
            return Err(Error::Internal(format!(
                "bucket map covers up to {}, expected {}",
                next, self.bucket_count
            )));
        }
        Ok(())
    }

    /// Entries overlapping `range`, verified to cover it exactly.
    fn covering(
        map: &BTreeMap<BucketId, BucketEntry>,
        range: BucketRange,
    ) -> Result<Vec<(BucketId, BucketEntry)>> {
        let mut covering = Vec::new();
        // The entry containing range.lo starts at or before it.
        let start = map
            .range(..=range.lo)
            .next_back()
            .map(|(lo, _)| *lo)
            .ok_or_else(|| Error::Config(format!("range {} is not mapped", range)))?;
        let mut expected = range.lo;
        for (lo, entry) in map.range(start..) {
            if *lo > range.hi {
                break;
            }
            if *lo > expected || entry.hi < expected {
                return Err(Error::Config(format!("range {} is not mapped", range)));
            }
            covering.push((*lo, entry.clone()));
            if entry.hi >= range.hi {
                return Ok(covering);
            }
            expected = entry.hi + 1;
        }
        Err(Error::Config(format!("range {} is not mapped", range)))
    }

    fn single_owner(covering: &[(BucketId, BucketEntry)], range: BucketRange) -> Result<ShardId> {
        let owner = covering[0].1.owner;
        if covering.iter().any(|(_, entry)| entry.owner != owner) {
            return Err(Error::Config(format!(
                "range {} spans more than one owner",
                range
            )));
        }
        Ok(owner)
    }

    /// Replace the covered span with a single entry for `range`, preserving
    /// any remainders of boundary entries.
    fn replace(
        map: &mut BTreeMap<BucketId, BucketEntry>,
        covering: &[(BucketId, BucketEntry)],
        range: BucketRange,
        owner: ShardId,
        state: MigrationState,
    ) {
        let (first_lo, first) = (covering[0].0, &covering[0].1);
        let (_, last) = &covering[covering.len() - 1];

        for (lo, _) in covering {
            map.remove(lo);
        }
        if first_lo < range.lo {
            map.insert(
                first_lo,
                BucketEntry {
                    hi: range.lo - 1,
                    owner: first.owner,
                    state: first.state,
                },
            );
        }
        if last.hi > range.hi {
            map.insert(
                range.hi + 1,
                BucketEntry {
                    hi: last.hi,
                    owner: last.owner,
                    state: last.state,
                },
            );
        }
        map.insert(
            range.lo,
            BucketEntry {
                hi: range.hi,
                owner,
                state,
            },
        );
    }

    /// Merge the entry starting at `lo` with stable same-owner neighbors.
    fn coalesce_around(map: &mut BTreeMap<BucketId, BucketEntry>, lo: BucketId) {
        let Some(entry) = map.get(&lo).cloned() else {
            return;
        };
        if !entry.state.is_stable() {
            return;
        }
        let mut span_lo = lo;
        let mut span_hi = entry.hi;
        let owner = entry.owner;

        if let Some((prev_lo, prev)) = map.range(..lo).next_back() {
            if prev.hi + 1 == span_lo && prev.owner == owner && prev.state.is_stable() {
                span_lo = *prev_lo;
            }
        }
        if span_hi != BucketId::MAX {
            if let Some(next) = map.get(&(span_hi + 1)) {
                if next.owner == owner && next.state.is_stable() {
                    span_hi = next.hi;
                }
            }
        }
        if span_lo == lo && span_hi == entry.hi {
            return;
        }
        let to_remove: Vec<BucketId> = map
            .range(span_lo..=span_hi)
            .map(|(k, _)| *k)
            .collect();
        for k in to_remove {
            map.remove(&k);
        }
        map.insert(
            span_lo,
            BucketEntry {
                hi: span_hi,
                owner,
                state: MigrationState::Stable,
            },
        );
    }
}
