// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Metering Core
//!
//! Tests critical boundary conditions and race conditions in:
//! - Cache lifecycle (CACHE-01 to CACHE-05)
//! - Metric retirement (RET-01 to RET-05)
//! - Backfill lineage (BF-01 to BF-03)
//! - Job execution (JOB-01 to JOB-03)

#[cfg(test)]
mod cache_tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use tokio::sync::Barrier;

    use crate::store::{CacheStore, EventQuery, EventStore};
    use crate::test_support::Fixture;
    use crate::{compute, AggregationSpec, BillingError};

    // =========================================================================
    // CACHE-01: 16 concurrent get_or_create on one coordinate - one entry
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_get_or_create_persists_one_entry() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = fx.cache.clone();
            let coordinate = coordinate.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache.get_or_create(&coordinate).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "All callers should receive the same entry");
        assert_eq!(fx.store.list_entries(fx.org).await.unwrap().len(), 1);
    }

    // =========================================================================
    // CACHE-02: concurrent refreshes converge on the full aggregate
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_refreshes_converge() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        for units in 1..=20 {
            fx.record("sub_1", units).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = fx.cache.clone();
            let coordinate = coordinate.clone();
            handles.push(tokio::spawn(async move { cache.refresh(&coordinate).await }));
        }
        for handle in handles {
            // A refresh may exhaust its retries while others advance; the
            // stored value must still be correct
            match handle.await.unwrap() {
                Ok(_) | Err(BillingError::CacheConflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let entry = fx.cache.find(&coordinate).await.unwrap().unwrap();
        assert_eq!(entry.current_aggregation, Decimal::from(210));
    }

    // =========================================================================
    // CACHE-03: after any advance the value equals the replay up to the cursor
    // =========================================================================
    #[tokio::test]
    async fn test_advance_value_matches_replay_to_cursor() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        let events = vec![
            fx.record("sub_1", 3).await,
            fx.record("sub_1", -1).await,
            fx.record("sub_1", 8).await,
        ];
        let spec = AggregationSpec::from_metric(&fx.metric).unwrap();

        let mut entry = fx.cache.get_or_create(&coordinate).await.unwrap();
        for (i, event) in events.iter().enumerate() {
            entry = fx.cache.advance(&entry, std::slice::from_ref(event)).await.unwrap();
            let expected = compute(&spec, &events[..=i], None).unwrap();
            assert_eq!(entry.current_aggregation, expected);
            assert_eq!(
                fx.cache
                    .rebuild_to_cursor(&coordinate, entry.cursor())
                    .await
                    .unwrap(),
                expected
            );
        }
    }

    // =========================================================================
    // CACHE-04: refresh equals rebuild from scratch (rebuildability)
    // =========================================================================
    #[tokio::test]
    async fn test_refresh_equals_rebuild_from_scratch() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        for units in [5, 0, 12, -3] {
            fx.record("sub_1", units).await;
        }

        let refreshed = fx.cache.refresh(&coordinate).await.unwrap();
        let rebuilt = fx.cache.rebuild_from_scratch(&coordinate).await.unwrap();
        assert_eq!(refreshed.current_aggregation, rebuilt);
        assert_eq!(rebuilt, Decimal::from(14));
    }

    // =========================================================================
    // CACHE-05: events of other codes never leak into a coordinate
    // =========================================================================
    #[tokio::test]
    async fn test_other_codes_are_ignored() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 4).await;
        let foreign = fx
            .store
            .insert_event(crate::NewUsageEvent {
                organization_id: fx.org,
                external_subscription_id: "sub_1".to_string(),
                code: "bandwidth".to_string(),
                group_id: None,
                charge_filter_id: None,
                properties: serde_json::json!({ "units": 1000 }),
                recorded_at: Some(time::OffsetDateTime::now_utc() - time::Duration::seconds(1)),
            })
            .await
            .unwrap();

        let entry = fx.cache.get_or_create(&coordinate).await.unwrap();
        let entry = fx.cache.advance(&entry, &[foreign]).await.unwrap();
        assert_eq!(entry.current_aggregation, Decimal::ZERO);

        let entry = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(entry.current_aggregation, Decimal::from(4));

        let all = fx
            .store
            .find_events(&EventQuery::for_organization(fx.org))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}

#[cfg(test)]
mod retirement_tests {
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use crate::models::{Charge, Plan, Subscription};
    use crate::test_support::Fixture;
    use crate::{BillingError, CacheCoordinate, MetricStatus};

    // =========================================================================
    // RET-01: sum 1+2+3, retire, cascade - events gone, entry gone, rebuild 0
    // =========================================================================
    #[tokio::test]
    async fn test_retirement_removes_events_and_entry() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        for units in 1..=3 {
            fx.record("sub_1", units).await;
        }
        let entry = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(entry.current_aggregation, Decimal::from(6));

        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        let summary = fx.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);

        assert!(fx.store.all_events().await.iter().all(|e| e.is_deleted()));
        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), None);
        assert_eq!(
            fx.cache.rebuild_from_scratch(&coordinate).await.unwrap(),
            Decimal::ZERO
        );
        assert_eq!(fx.metric_status().await, MetricStatus::Deleted);
    }

    // =========================================================================
    // RET-02: metric backs charges on two plans - both coordinates destroyed
    // =========================================================================
    #[tokio::test]
    async fn test_retirement_destroys_entries_of_every_charge() {
        let fx = Fixture::new().await;
        let plan_y = Plan {
            id: Uuid::new_v4(),
            organization_id: fx.org,
            code: "growth".to_string(),
        };
        let charge_y = Charge {
            id: Uuid::new_v4(),
            organization_id: fx.org,
            plan_id: plan_y.id,
            billable_metric_id: fx.metric.id,
            filter_ids: Vec::new(),
        };
        fx.store.insert_plan(plan_y.clone()).await;
        fx.store.insert_charge(charge_y.clone()).await;
        fx.store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                external_id: "sub_y".to_string(),
                plan_id: plan_y.id,
                ..fx.subscription.clone()
            })
            .await;

        let x = fx.coordinate("sub_1");
        let y = CacheCoordinate::new(fx.org, "sub_y", charge_y.id);
        fx.cache.get_or_create(&x).await.unwrap();
        fx.cache.get_or_create(&y).await.unwrap();

        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        let report = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        assert_eq!(report.entries_destroyed, 2);
        assert_eq!(fx.cache.find(&x).await.unwrap(), None);
        assert_eq!(fx.cache.find(&y).await.unwrap(), None);
    }

    // =========================================================================
    // RET-03: running the cascade twice yields the same end state
    // =========================================================================
    #[tokio::test]
    async fn test_retirement_is_idempotent() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 1).await;
        fx.record("sub_2", 2).await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        let first = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        let events_after_first = fx.store.all_events().await;

        let second = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        assert_eq!(first.events_deleted, 2);
        assert_eq!(second.events_deleted, 0);
        assert_eq!(second.entries_destroyed, 0);
        assert!(second.already_deleted);
        assert_eq!(fx.store.all_events().await, events_after_first);
        assert_eq!(fx.metric_status().await, MetricStatus::Deleted);
    }

    // =========================================================================
    // RET-04: cache writes for a retiring metric are refused
    // =========================================================================
    #[tokio::test]
    async fn test_advance_refused_once_retirement_requested() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        let event = fx.record("sub_1", 5).await;
        let entry = fx.cache.get_or_create(&coordinate).await.unwrap();

        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        let err = fx.cache.advance(&entry, &[event]).await.unwrap_err();
        assert!(matches!(err, BillingError::MetricRetired(_)));
        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), Some(entry));
    }

    // =========================================================================
    // RET-05: requesting retirement of a deleted metric does nothing
    // =========================================================================
    #[tokio::test]
    async fn test_request_for_deleted_metric_is_noop() {
        let fx = Fixture::new().await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        fx.service.jobs.run_due().await.unwrap();

        let ticket = fx
            .service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        assert_eq!(ticket.status, MetricStatus::Deleted);
        assert!(ticket.job.is_none());
        assert_eq!(fx.store.job_statuses().await.len(), 1);
    }
}

#[cfg(test)]
mod backfill_tests {
    use rust_decimal::Decimal;
    use time::macros::datetime;
    use uuid::Uuid;

    use crate::models::{Charge, Plan, Subscription};
    use crate::store::{CacheStore, QuantifiedEvent};
    use crate::test_support::Fixture;
    use crate::BackfillOptions;

    fn record(fx: &Fixture, sub: &str, units: i64) -> QuantifiedEvent {
        QuantifiedEvent {
            id: Uuid::new_v4(),
            organization_id: fx.org,
            external_subscription_id: sub.to_string(),
            billable_metric_id: fx.metric.id,
            group_id: None,
            charge_filter_id: None,
            added_at: datetime!(2024-02-15 08:30 UTC),
            removed_at: None,
            grouped_by: None,
            properties: serde_json::json!({ "total_aggregated_units": units }),
        }
    }

    // =========================================================================
    // BF-01: unique lineage (M, S, 42) - one entry {charge C, S, 42}
    // =========================================================================
    #[tokio::test]
    async fn test_unique_lineage_yields_one_entry() {
        let fx = Fixture::new().await;
        fx.store.insert_legacy_record(record(&fx, "sub_1", 42)).await;

        let report = fx.service.backfill(BackfillOptions::default()).run().await.unwrap();
        assert_eq!(report.created, 1);

        let entries = fx.store.list_entries(fx.org).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].charge_id, fx.charge.id);
        assert_eq!(entries[0].external_subscription_id, "sub_1");
        assert_eq!(entries[0].current_aggregation, Decimal::from(42));
    }

    // =========================================================================
    // BF-02: two charges of M both reach S - flagged, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_two_candidate_charges_are_flagged() {
        let fx = Fixture::new().await;
        let plan = Plan {
            id: Uuid::new_v4(),
            organization_id: fx.org,
            code: "addon".to_string(),
        };
        let second = Charge {
            id: Uuid::new_v4(),
            organization_id: fx.org,
            plan_id: plan.id,
            billable_metric_id: fx.metric.id,
            filter_ids: Vec::new(),
        };
        fx.store.insert_plan(plan.clone()).await;
        fx.store.insert_charge(second.clone()).await;
        fx.store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                plan_id: plan.id,
                ..fx.subscription.clone()
            })
            .await;
        let legacy = record(&fx, "sub_1", 42);
        fx.store.insert_legacy_record(legacy.clone()).await;

        let report = fx.service.backfill(BackfillOptions::default()).run().await.unwrap();

        assert_eq!(report.created, 0);
        assert_eq!(report.flagged, vec![legacy.id]);
        assert!(fx.store.list_entries(fx.org).await.unwrap().is_empty());

        let flags = fx.store.flags().await;
        assert_eq!(flags[0].reason, "multiple_charges");
        let mut expected = vec![fx.charge.id, second.id];
        expected.sort();
        assert_eq!(flags[0].candidate_charge_ids, expected);
    }

    // =========================================================================
    // BF-03: records span several pages - every page is processed once
    // =========================================================================
    #[tokio::test]
    async fn test_paging_visits_every_record() {
        let fx = Fixture::new().await;
        for i in 0..5 {
            fx.store
                .insert_legacy_record(record(&fx, &format!("sub_{}", i + 10), 1))
                .await;
        }
        fx.store.insert_legacy_record(record(&fx, "sub_1", 3)).await;

        let report = fx
            .service
            .backfill(BackfillOptions {
                batch_size: 2,
                ..BackfillOptions::default()
            })
            .run()
            .await
            .unwrap();

        assert_eq!(report.scanned, 6);
        assert_eq!(report.created, 1);
        assert_eq!(report.flagged.len(), 5);
    }
}

#[cfg(test)]
mod job_tests {
    use std::time::Duration;

    use crate::jobs::{JobStatus, RetryPolicy};
    use crate::test_support::Fixture;

    // =========================================================================
    // JOB-01: transient cascade failure is rescheduled, not dropped
    // =========================================================================
    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 1).await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        let runner = fx.service.jobs.clone().with_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });

        fx.store.fail_next_soft_delete().await;
        let first = runner.run_due().await.unwrap();
        assert_eq!(first.retried, 1);

        let second = runner.run_due().await.unwrap();
        assert_eq!(second.completed, 1);

        let statuses = fx.store.job_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, JobStatus::Completed);
        assert_eq!(statuses[0].2, 2);
    }

    // =========================================================================
    // JOB-02: attempts exhausted - job is marked dead
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_job_is_dead() {
        let fx = Fixture::new().await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        let runner = fx.service.jobs.clone().with_policy(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
        fx.store.fail_next_soft_delete().await;
        let summary = runner.run_due().await.unwrap();

        assert_eq!(summary.dead, 1);
        assert_eq!(fx.store.job_statuses().await[0].1, JobStatus::Dead);
        assert_eq!(
            fx.metric_status().await,
            crate::MetricStatus::PendingDeletion
        );
    }

    // =========================================================================
    // JOB-03: a dead job frees its dedupe slot for a fresh request
    // =========================================================================
    #[tokio::test]
    async fn test_rerequest_after_dead_job_enqueues_again() {
        let fx = Fixture::new().await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        let runner = fx.service.jobs.clone().with_policy(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
        fx.store.fail_next_soft_delete().await;
        runner.run_due().await.unwrap();

        let ticket = fx
            .service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        assert!(matches!(
            ticket.job,
            Some(crate::EnqueueOutcome::Enqueued(_))
        ));

        let summary = runner.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(fx.metric_status().await, crate::MetricStatus::Deleted);
    }
}
