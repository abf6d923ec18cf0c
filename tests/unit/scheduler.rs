//! Unit tests for backup scheduling

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use elasticsearch_operator::controller::BackupScheduler;
use elasticsearch_operator::controller::scheduler::{
    BackupJob, CronSchedule, fingerprint, parse_interval, schedule_key, scheduled_snapshot,
};
use elasticsearch_operator::controller::snapshot::running_snapshot;
use elasticsearch_operator::crd::{BackupScheduleSpec, Snapshot, SnapshotPhase, SnapshotStatus};
use futures::FutureExt;

use crate::common::*;

fn counting_job(counter: Arc<AtomicUsize>) -> BackupJob {
    Arc::new(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    })
}

mod expression_tests {
    use super::*;

    #[test]
    fn test_five_field_expression() {
        let schedule = CronSchedule::parse("30 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_macro_expression() {
        let schedule = CronSchedule::parse("@daily").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_every_expression() {
        let schedule = CronSchedule::parse("@every 1h30m").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 1, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("not a schedule").is_err());
        assert!(CronSchedule::parse("@every").is_err());
        assert!(CronSchedule::parse("@every 5x").is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_interval("10").is_err());
        assert!(parse_interval("0s").is_err());
    }
}

mod registry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_until_unregistered() {
        let scheduler = BackupScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let key = schedule_key("default", "es1");

        scheduler
            .register(&key, "@every 1s", "fp", counting_job(Arc::clone(&counter)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        assert!(scheduler.is_registered(&key));
        assert!(scheduler.unregister(&key));
        assert!(!scheduler.is_registered(&key));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!scheduler.unregister(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_keeps_one_entry() {
        let scheduler = BackupScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let key = schedule_key("default", "es1");

        scheduler
            .register(&key, "@every 1s", "a", counting_job(Arc::clone(&first)))
            .unwrap();
        scheduler
            .register(&key, "@every 1s", "b", counting_job(Arc::clone(&second)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.fingerprint(&key).as_deref(), Some("b"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_expression_not_registered() {
        let scheduler = BackupScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(
            scheduler
                .register("default/es1", "bogus", "fp", counting_job(counter))
                .is_err()
        );
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_entries() {
        let scheduler = BackupScheduler::new();
        for name in ["es1", "es2"] {
            scheduler
                .register(
                    &schedule_key("default", name),
                    "@daily",
                    "fp",
                    counting_job(Arc::new(AtomicUsize::new(0))),
                )
                .unwrap();
        }
        assert_eq!(scheduler.len(), 2);

        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}

mod snapshot_tests {
    use super::*;

    #[test]
    fn test_scheduled_snapshot_named_by_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 2, 30, 0).unwrap();
        let snapshot = scheduled_snapshot("es1", "default", &s3_storage("backups"), now);

        assert_eq!(snapshot.metadata.name.as_deref(), Some("es1-20240305-023000"));
        assert_eq!(snapshot.spec.database_name, "es1");
    }

    #[test]
    fn test_fingerprint_tracks_spec() {
        let spec = BackupScheduleSpec {
            cron_expression: "@daily".to_string(),
            storage: s3_storage("backups"),
        };
        let mut changed = spec.clone();
        changed.storage = s3_storage("other");

        assert_eq!(fingerprint(&spec), fingerprint(&spec.clone()));
        assert_ne!(fingerprint(&spec), fingerprint(&changed));
    }
}

mod running_snapshot_tests {
    use super::*;

    fn in_phase(name: &str, database: &str, phase: SnapshotPhase) -> Snapshot {
        let mut snapshot = create_test_snapshot(name, "default", database);
        snapshot.status = Some(SnapshotStatus {
            phase,
            ..Default::default()
        });
        snapshot
    }

    #[test]
    fn test_scheduled_tick_skipped_while_backup_runs() {
        let listed = vec![in_phase("es1-20240101-000000", "es1", SnapshotPhase::Running)];
        let running = running_snapshot(&listed, "es1", None);
        assert_eq!(
            running.and_then(|s| s.metadata.name.as_deref()),
            Some("es1-20240101-000000")
        );
    }

    #[test]
    fn test_finished_snapshots_do_not_block() {
        let listed = vec![
            in_phase("a", "es1", SnapshotPhase::Succeeded),
            in_phase("b", "es1", SnapshotPhase::Failed),
            in_phase("c", "es1", SnapshotPhase::Pending),
        ];
        assert!(running_snapshot(&listed, "es1", None).is_none());
    }

    #[test]
    fn test_other_database_does_not_block() {
        let listed = vec![in_phase("a", "es2", SnapshotPhase::Running)];
        assert!(running_snapshot(&listed, "es1", None).is_none());
    }

    #[test]
    fn test_second_snapshot_rejected_while_one_runs() {
        let listed = vec![
            in_phase("first", "es1", SnapshotPhase::Running),
            in_phase("second", "es1", SnapshotPhase::Running),
        ];
        let other = running_snapshot(&listed, "es1", Some("second"));
        assert_eq!(other.and_then(|s| s.metadata.name.as_deref()), Some("first"));
    }

    #[test]
    fn test_snapshot_does_not_block_itself() {
        let listed = vec![in_phase("first", "es1", SnapshotPhase::Running)];
        assert!(running_snapshot(&listed, "es1", Some("first")).is_none());
    }
}
