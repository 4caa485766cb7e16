//! End-to-end tests for the migration protocol.
//!
//! Each test wires a whole control plane in-process through [`TestBed`] and
//! drives real protocol traffic through the wire codec: observe, barrier,
//! cutover, retries, rollback, cancellation, and the concurrency rules.

#[cfg(test)]
mod tests {
    use crate::bucket_map::MigrationState;
    use crate::error::{Error, ShardManagerError};
    use crate::member_sync::{SyncMode, SyncStatus};
    use crate::shard_manager::{ShardManagerProtocol, ShardManagerRequest};
    use crate::testing::{SyncBehavior, TestBed};
    use crate::types::BucketRange;
    use std::time::Duration;
    use uuid::Uuid;

    fn range(lo: u64, hi: u64) -> BucketRange {
        BucketRange::new(lo, hi).unwrap()
    }

    fn is_migrate(req: &ShardManagerRequest) -> bool {
        matches!(req, ShardManagerRequest::MigrateBuckets { .. })
    }

    // ========================================================================
    // Happy path
    // ========================================================================

    #[tokio::test]
    async fn test_assign_buckets_happy_path() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        bed.orchestrator.assign_buckets(range(10, 20), 1, 2).await.unwrap();

        // Ownership moved and the partition survived.
        assert_eq!(bed.bucket_map.lookup(15), Some(2));
        assert_eq!(bed.bucket_map.lookup(9), Some(1));
        assert_eq!(bed.bucket_map.lookup(21), Some(1));
        bed.bucket_map.check_partition().unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 2);

        // Every target member wound down to (Normal, Running) and left
        // slave replication.
        for member in [4, 5, 6] {
            let state = bed.registry.get(member).unwrap();
            assert_eq!(state.mode, SyncMode::Normal);
            assert_eq!(state.status, SyncStatus::Running);
            assert!(bed.members[&member].observing().is_none());
        }
    }

    #[tokio::test]
    async fn test_cutover_passes_through_both_sub_phases() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        bed.orchestrator.assign_buckets(range(10, 20), 1, 2).await.unwrap();

        let member4: Vec<_> = bed
            .registry
            .history()
            .into_iter()
            .filter(|t| t.member_id == 4)
            .collect();
        assert!(member4.iter().any(|t| t.to.0 == SyncMode::Slave));
        assert!(member4.iter().any(|t| t.to.0 == SyncMode::Migrating1));
        assert!(member4.iter().any(|t| t.to.0 == SyncMode::Migrating2));
        assert_eq!(
            member4.last().unwrap().to,
            (SyncMode::Normal, SyncStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_split_then_merge() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        // Split carves the upper half of shard 1's range.
        bed.orchestrator.split_shard(1, 2).await.unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(25, 49)).unwrap(), 2);
        assert_eq!(bed.bucket_map.stable_owner_of(range(0, 24)).unwrap(), 1);

        // Merge moves the rest; the map folds into one entry.
        bed.orchestrator.merge_shard(1, 2).await.unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(0, 99)).unwrap(), 2);
        assert_eq!(bed.bucket_map.snapshot().len(), 1);
        bed.bucket_map.check_partition().unwrap();
    }

    #[tokio::test]
    async fn test_cutover_chases_leader_hint() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        // Leadership of the source shard sits on member 2, not the first
        // member the client tries.
        bed.shard_rafts[&1].set_leader(Some(2));

        bed.orchestrator.assign_buckets(range(10, 20), 1, 2).await.unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 2);
    }

    // ========================================================================
    // Configuration errors: fail fast, zero remote calls
    // ========================================================================

    #[tokio::test]
    async fn test_config_errors_issue_no_remote_calls() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        // Unknown destination shard.
        let err = bed.orchestrator.assign_buckets(range(10, 20), 1, 9).await;
        assert!(matches!(err, Err(Error::Config(_))));

        // Unknown source shard.
        let err = bed.orchestrator.assign_buckets(range(10, 20), 9, 2).await;
        assert!(matches!(err, Err(Error::Config(_))));

        // Source and destination identical.
        let err = bed.orchestrator.assign_buckets(range(10, 20), 1, 1).await;
        assert!(matches!(err, Err(Error::Config(_))));

        // Range not owned by the source shard.
        let err = bed.orchestrator.assign_buckets(range(60, 70), 1, 2).await;
        assert!(matches!(err, Err(Error::Config(_))));

        // Range spanning two owners.
        let err = bed.orchestrator.assign_buckets(range(40, 60), 1, 2).await;
        assert!(matches!(err, Err(Error::Config(_))));

        // Range outside the bucket space.
        let err = bed.orchestrator.assign_buckets(range(90, 150), 2, 1).await;
        assert!(matches!(err, Err(Error::Config(_))));

        assert!(bed.transport.calls().is_empty());
        bed.bucket_map.check_partition().unwrap();
    }

    // ========================================================================
    // Barrier failure, retries, rollback
    // ========================================================================

    #[tokio::test]
    async fn test_stalled_slave_fails_after_retry_budget() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        // Member 5 never gets within the acceptance margin.
        bed.members[&5].set_behavior(SyncBehavior::Stall(500));

        let err = bed
            .orchestrator
            .assign_buckets(range(10, 20), 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShardManager(ShardManagerError::SlaveNotSync { target: 2 })
        ));

        // The cutover never ran and ownership is unchanged.
        assert_eq!(bed.transport.count_calls(|_, req| is_migrate(req)), 0);
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 1);
        bed.bucket_map.check_partition().unwrap();

        // Rollback returned every target member to (Normal, Stop).
        for member in [4, 5, 6] {
            let state = bed.registry.get(member).unwrap();
            assert_eq!(state.mode, SyncMode::Normal);
            assert_eq!(state.status, SyncStatus::Stop);
        }
    }

    #[tokio::test]
    async fn test_retry_budget_is_exact() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        // Member 5 refuses slave mode, failing the observe phase of every
        // attempt.
        bed.members[&5].fail_set_slave("disk on fire");

        let err = bed
            .orchestrator
            .assign_buckets(range(10, 20), 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShardManager(ShardManagerError::FailedStartSlave { .. })
        ));

        // Exactly three attempts: member 4 saw exactly three start calls.
        let starts_to_4 = bed.transport.count_calls(|member, req| {
            *member == 4 && matches!(req, ShardManagerRequest::StartObserving { .. })
        });
        assert_eq!(starts_to_4, 3);

        // Each failed attempt compensated with a stop.
        let stops_to_4 = bed.transport.count_calls(|member, req| {
            *member == 4 && matches!(req, ShardManagerRequest::StopObserving { .. })
        });
        assert_eq!(stops_to_4, 3);
    }

    #[tokio::test]
    async fn test_failed_slave_aborts_barrier() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        bed.members[&6].set_behavior(SyncBehavior::Fail("wal torn".to_string()));

        let err = bed
            .orchestrator
            .assign_buckets(range(10, 20), 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShardManager(ShardManagerError::SlaveFailed { member: 6, .. })
        ));
        assert_eq!(bed.transport.count_calls(|_, req| is_migrate(req)), 0);
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 1);
    }

    // ========================================================================
    // Idempotence
    // ========================================================================

    #[tokio::test]
    async fn test_stop_observing_is_idempotent() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        // Every member of shard 2 is in (Normal, Stop); stopping is a no-op.
        bed.client
            .stop_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();
        for member in [4, 5, 6] {
            let state = bed.registry.get(member).unwrap();
            assert_eq!(state.mode, SyncMode::Normal);
            assert_eq!(state.status, SyncStatus::Stop);
        }
        bed.bucket_map.check_partition().unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(50, 99)).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_start_observing_is_idempotent() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        bed.client
            .start_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();
        bed.client
            .start_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();

        // One transition per member despite the duplicate call.
        let slave_entries = bed
            .registry
            .history()
            .into_iter()
            .filter(|t| t.to.0 == SyncMode::Slave && t.from.0 == SyncMode::Normal)
            .count();
        assert_eq!(slave_entries, 3);

        bed.client
            .stop_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reinvoked_cutover_is_answered_without_reapplying() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        bed.orchestrator.assign_buckets(range(10, 20), 1, 2).await.unwrap();
        let snapshot = bed.bucket_map.snapshot();

        // An operator re-driving the identical cutover (say after an
        // ambiguous timeout) gets success and an untouched map.
        bed.client
            .migrate_buckets(range(10, 20), 1, 2, Uuid::new_v4(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(bed.bucket_map.snapshot(), snapshot);
    }

    // ========================================================================
    // Ambiguous cutover
    // ========================================================================

    #[tokio::test]
    async fn test_cutover_timeout_surfaces_unknown_outcome() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        // The source leader swallows the cutover call.
        bed.transport.black_hole(1);

        let err = bed
            .orchestrator
            .assign_buckets(range(10, 20), 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CutoverUnresolved { .. }));

        // Exactly one cutover call: an unknown outcome is never blindly
        // retried.
        assert_eq!(bed.transport.count_calls(|_, req| is_migrate(req)), 1);
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 1);

        // The best-effort compensation still reverted the members.
        for member in [4, 5, 6] {
            let state = bed.registry.get(member).unwrap();
            assert_eq!(state.mode, SyncMode::Normal);
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_cancellation_compensates_and_returns() {
        // Unbounded barrier with a stalled member: the attempt parks inside
        // the barrier until cancelled.
        let config = TestBed::fast_config().with_barrier_timeout(None);
        let bed = TestBed::two_shards(config);
        bed.members[&5].set_behavior(SyncBehavior::Stall(500));

        let orchestrator = bed.orchestrator.clone();
        let handle = tokio::spawn(async move {
            orchestrator.assign_buckets(range(10, 20), 1, 2).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        bed.orchestrator.cancellation_token().cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // Same compensation path as a timeout.
        assert_eq!(bed.transport.count_calls(|_, req| is_migrate(req)), 0);
        for member in [4, 5, 6] {
            let state = bed.registry.get(member).unwrap();
            assert_eq!(state.mode, SyncMode::Normal);
            assert_eq!(state.status, SyncStatus::Stop);
        }
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 1);
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[tokio::test]
    async fn test_disjoint_migrations_run_concurrently() {
        let bed = TestBed::four_shards(TestBed::fast_config());

        let a = bed.orchestrator.clone();
        let b = bed.orchestrator.clone();
        let (ra, rb) = tokio::join!(
            a.assign_buckets(range(0, 49), 1, 2),
            b.assign_buckets(range(100, 149), 3, 4),
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(bed.bucket_map.stable_owner_of(range(0, 49)).unwrap(), 2);
        assert_eq!(bed.bucket_map.stable_owner_of(range(100, 149)).unwrap(), 4);
        bed.bucket_map.check_partition().unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_migrations_serialize() {
        let bed = TestBed::two_shards(TestBed::fast_config());

        // Another operation already holds shard 1's lock.
        let held = bed
            .locks
            .lock_for_migration(&[1], range(0, 5), "concurrent op")
            .await;

        let orchestrator = bed.orchestrator.clone();
        let handle = tokio::spawn(async move {
            orchestrator.assign_buckets(range(10, 20), 1, 2).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Blocked on the shard lock: no remote traffic yet.
        assert!(!handle.is_finished());
        assert!(bed.transport.calls().is_empty());

        drop(held);
        handle.await.unwrap().unwrap();
        assert_eq!(bed.bucket_map.stable_owner_of(range(10, 20)).unwrap(), 2);
    }

    // ========================================================================
    // Protocol-level barriers
    // ========================================================================

    #[tokio::test]
    async fn test_wait_slaves_synced_distinguishes_approached() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        // Within the margin but not caught up.
        for member in [4, 5, 6] {
            bed.members[&member].set_behavior(SyncBehavior::Stall(50));
        }
        bed.client
            .start_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();

        let approached = bed
            .client
            .wait_slaves_approaching(2, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(approached);

        let synced = bed
            .client
            .wait_slaves_synced(2, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(!synced);

        bed.client
            .stop_observing(2, 1, Duration::from_millis(500))
            .await
            .unwrap();
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    #[tokio::test]
    async fn test_unimplemented_admin_targets_are_explicit() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        for target in [
            crate::admin::AdminTarget::Host,
            crate::admin::AdminTarget::Site,
            crate::admin::AdminTarget::Storage,
            crate::admin::AdminTarget::All,
        ] {
            assert!(matches!(
                bed.orchestrator.enable(target, "x"),
                Err(Error::NotSupported(_))
            ));
            assert!(matches!(
                bed.orchestrator.disable(target, "x"),
                Err(Error::NotSupported(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_status_surface() {
        let bed = TestBed::two_shards(TestBed::fast_config());
        bed.orchestrator.assign_buckets(range(10, 20), 1, 2).await.unwrap();

        let status = bed.orchestrator.status();
        assert_eq!(status.shards.len(), 2);

        let shard1 = status.shards.iter().find(|s| s.shard_id == 1).unwrap();
        assert_eq!(shard1.leader, Some(1));
        assert_eq!(shard1.commit_index, 1000);
        assert_eq!(shard1.members.len(), 3);

        // Nothing is locked once the migration finished.
        assert!(status.locks.global.is_none());
        assert!(status.locks.shards.is_empty());
        assert!(status.locks.ranges.is_empty());

        // The bucket map view reflects the handoff and carries no stuck
        // migration tags.
        assert!(status
            .bucket_map
            .iter()
            .all(|e| e.state == MigrationState::Stable));
        assert!(status
            .bucket_map
            .iter()
            .any(|e| e.range == range(10, 20) && e.owner == 2));

        // The whole snapshot serializes for the admin endpoint.
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("bucket_map"));
    }
}
