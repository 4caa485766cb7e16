//! Configuration for the migration control plane.

use crate::error::{Error, Result};
use crate::types::{BucketId, NodeId, ShardId};
use std::collections::BTreeMap;
use std::time::Duration;

/// Tunables for the migration orchestrator and shard manager client.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How many times the observe -> barrier -> cutover sequence is
    /// attempted before the last failure is surfaced.
    pub retry_count: u32,

    /// Time budget for getting every target member into slave mode.
    pub observe_timeout: Duration,

    /// Time budget for the atomic cutover call.
    pub cutover_timeout: Duration,

    /// Time budget for the synchronization barrier. `None` blocks until
    /// every member approaches the source leader's log position.
    pub barrier_timeout: Option<Duration>,

    /// Sleep between probes inside polling waits.
    pub poll_interval: Duration,

    /// A slave is considered approached when the gap between the source
    /// leader's commit index and the slave's saved index is at most this.
    pub approach_margin: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            observe_timeout: Duration::from_millis(3000),
            cutover_timeout: Duration::from_millis(1000),
            barrier_timeout: None,
            poll_interval: Duration::from_millis(200),
            approach_margin: 100,
        }
    }
}

impl ControlConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the observe-phase time budget.
    pub fn with_observe_timeout(mut self, timeout: Duration) -> Self {
        self.observe_timeout = timeout;
        self
    }

    /// Set the cutover time budget.
    pub fn with_cutover_timeout(mut self, timeout: Duration) -> Self {
        self.cutover_timeout = timeout;
        self
    }

    /// Bound the synchronization barrier. `None` waits without limit.
    pub fn with_barrier_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Set the polling interval for barrier waits.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the log-position acceptance margin for the approach barrier.
    pub fn with_approach_margin(mut self, margin: u64) -> Self {
        self.approach_margin = margin;
        self
    }
}

/// Static cluster topology: which members form each shard, and how many
/// buckets the hashed key space is divided into.
///
/// Loading and hot-reloading this from configuration files is the concern
/// of an outer layer; the control plane takes the resolved view.
#[derive(Debug, Clone)]
pub struct Topology {
    bucket_count: u64,
    shards: BTreeMap<ShardId, Vec<NodeId>>,
}

impl Topology {
    /// Create an empty topology over `bucket_count` buckets.
    pub fn new(bucket_count: u64) -> Self {
        Self {
            bucket_count,
            shards: BTreeMap::new(),
        }
    }

    /// Add a shard and its member list.
    pub fn with_shard(mut self, shard: ShardId, members: Vec<NodeId>) -> Self {
        self.shards.insert(shard, members);
        self
    }

    /// Total number of buckets in the key space.
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// Last valid bucket id.
    pub fn max_bucket(&self) -> BucketId {
        self.bucket_count - 1
    }

    /// Whether the shard id is known.
    pub fn contains_shard(&self, shard: ShardId) -> bool {
        self.shards.contains_key(&shard)
    }

    /// Members of a shard, empty if unknown.
    pub fn members_of(&self, shard: ShardId) -> &[NodeId] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All known shard ids.
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.keys().copied()
    }

    /// Validate the topology: at least one bucket, no empty shards, and no
    /// member serving two shards.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket count must be positive".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for (shard, members) in &self.shards {
            if members.is_empty() {
                return Err(Error::Config(format!("shard {} has no members", shard)));
            }
            for member in members {
                if !seen.insert(*member) {
                    return Err(Error::Config(format!(
                        "member {} belongs to more than one shard",
                        member
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControlConfig::default();
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.observe_timeout, Duration::from_millis(3000));
        assert_eq!(config.cutover_timeout, Duration::from_millis(1000));
        assert!(config.barrier_timeout.is_none());
    }

    #[test]
    fn test_config_builders() {
        let config = ControlConfig::new()
            .with_retry_count(5)
            .with_barrier_timeout(Some(Duration::from_secs(10)));
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.barrier_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_topology_validation() {
        let topo = Topology::new(100)
            .with_shard(1, vec![1, 2, 3])
            .with_shard(2, vec![4, 5, 6]);
        assert!(topo.validate().is_ok());
        assert!(topo.contains_shard(1));
        assert!(!topo.contains_shard(9));
        assert_eq!(topo.members_of(2), &[4, 5, 6]);
        assert!(topo.members_of(9).is_empty());
    }

    #[test]
    fn test_topology_rejects_shared_member() {
        let topo = Topology::new(100)
            .with_shard(1, vec![1, 2])
            .with_shard(2, vec![2, 3]);
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_topology_rejects_empty_shard() {
        let topo = Topology::new(100).with_shard(1, vec![]);
        assert!(topo.validate().is_err());
    }
}
