mod test_helpers;

use anyhow::Result;
use backup_orchestrator::backup::{BackupError, RunFilter, RunStatus};
use backup_orchestrator::scheduler::BackupScheduler;
use backup_orchestrator::supervisor::RunSupervisor;
use chrono::{Datelike, Local, Timelike, Weekday};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tracing_test::traced_test;

async fn scheduler_for(env: &TestEnv) -> Result<(BackupScheduler, Arc<RunSupervisor>)> {
    let supervisor = Arc::new(RunSupervisor::new(2, Duration::from_secs(5)));
    let executor = Arc::new(env.executor(fast_config()));
    let scheduler = BackupScheduler::new(env.store.clone(), executor, Arc::clone(&supervisor)).await?;
    Ok((scheduler, supervisor))
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_schedule_and_unschedule_profile() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("0 2 * * *")))
        .await?;
    assert!(scheduler.is_scheduled(PROFILE_ID).await);

    scheduler.unschedule_profile(PROFILE_ID).await;
    assert!(!scheduler.is_scheduled(PROFILE_ID).await);

    // unscheduling twice is harmless
    scheduler.unschedule_profile(PROFILE_ID).await;
    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rescheduling_keeps_a_single_trigger() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("0 2 * * *")))
        .await?;
    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("30 3 * * *")))
        .await?;
    assert_eq!(scheduler.scheduled_profiles().await, vec![PROFILE_ID]);

    // disabling through a reschedule drops the trigger
    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", false, Some("30 3 * * *")))
        .await?;
    assert!(scheduler.scheduled_profiles().await.is_empty());

    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_profiles_without_expression_are_not_scheduled() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    scheduler.schedule_profile(&profile(2, "manual", true, None)).await?;
    scheduler.schedule_profile(&profile(3, "blank", true, Some("   "))).await?;
    scheduler
        .schedule_profile(&profile(4, "off", false, Some("0 2 * * *")))
        .await?;

    assert!(scheduler.scheduled_profiles().await.is_empty());
    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_expression_is_rejected() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    for expression in ["every night", "61 * * * *"] {
        let err = scheduler
            .schedule_profile(&profile(2, "broken", true, Some(expression)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackupError::InvalidScheduleExpression { .. }),
            "{expression}: {err}"
        );
        assert!(!scheduler.is_scheduled(2).await);
    }

    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_load_all_schedules_reports_failures() -> Result<()> {
    let env = TestEnv::new().await;
    env.store.put_profile(profile(2, "hourly", true, Some("0 * * * *"))).await;
    env.store.put_profile(profile(3, "broken", true, Some("whenever"))).await;
    env.store.put_profile(profile(4, "off", false, Some("0 * * * *"))).await;
    env.store.put_profile(profile(5, "manual", true, None)).await;
    let (scheduler, _) = scheduler_for(&env).await?;

    let report = scheduler.load_all_schedules().await?;
    assert_eq!(report.scheduled, 2);
    assert_eq!(report.failed, vec![3]);
    assert_eq!(scheduler.scheduled_profiles().await, vec![PROFILE_ID, 2]);

    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_fired_schedule_runs_the_backup() -> Result<()> {
    let env = TestEnv::new().await;
    env.remote.add_file("/data/a.txt", b"alpha");
    env.add_file_rule(1, "/data", true, None).await;
    let (scheduler, supervisor) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("* * * * * *")))
        .await?;

    let run = wait_for_profile_run(&env.ledger(), PROFILE_ID, Duration::from_secs(10))
        .await
        .expect("the every-second schedule produced a run");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.total_files, 1);

    scheduler.stop().await?;
    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_idempotent_and_final() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;
    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("0 2 * * *")))
        .await?;

    scheduler.stop().await?;
    scheduler.stop().await?;
    assert!(scheduler.is_stopped());
    assert!(scheduler.scheduled_profiles().await.is_empty());

    let err = scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("0 2 * * *")))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::ShuttingDown));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crontab_weekday_numbers_are_accepted() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(2, "sundays", true, Some("0 2 * * 0")))
        .await?;
    scheduler
        .schedule_profile(&profile(3, "weekdays", true, Some("0 2 * * 1-5")))
        .await?;
    assert_eq!(scheduler.scheduled_profiles().await, vec![2, 3]);

    let sunday = scheduler.next_fire(2).await?.expect("next fire").with_timezone(&Local);
    assert_eq!(sunday.weekday(), Weekday::Sun);

    let weekday = scheduler.next_fire(3).await?.expect("next fire").with_timezone(&Local);
    assert!(!matches!(weekday.weekday(), Weekday::Sat | Weekday::Sun), "{weekday}");

    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_schedule_fires_in_local_time() -> Result<()> {
    let env = TestEnv::new().await;
    let (scheduler, _) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("30 4 * * *")))
        .await?;

    let next = scheduler
        .next_fire(PROFILE_ID)
        .await?
        .expect("scheduled profile has a next fire")
        .with_timezone(&Local);
    assert_eq!((next.hour(), next.minute(), next.second()), (4, 30, 0));
    assert!(next > Local::now());
    assert!(scheduler.next_fire(42).await?.is_none());

    scheduler.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_profile_disabled_after_scheduling_is_skipped() -> Result<()> {
    let env = TestEnv::new().await;
    env.remote.add_file("/data/a.txt", b"alpha");
    env.add_file_rule(1, "/data", true, None).await;
    let (scheduler, supervisor) = scheduler_for(&env).await?;

    scheduler
        .schedule_profile(&profile(PROFILE_ID, "nightly", true, Some("* * * * * *")))
        .await?;
    // disabled in the store only; the trigger stays installed
    env.store
        .put_profile(profile(PROFILE_ID, "nightly", false, Some("* * * * * *")))
        .await;
    assert!(scheduler.is_scheduled(PROFILE_ID).await);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(env.ledger().list_runs(&RunFilter::default()).await?.is_empty());
    assert_eq!(env.remote.connects(), 0);

    // the same trigger runs again once the profile is re-enabled
    env.store
        .put_profile(profile(PROFILE_ID, "nightly", true, Some("* * * * * *")))
        .await;
    let run = wait_for_profile_run(&env.ledger(), PROFILE_ID, Duration::from_secs(10))
        .await
        .expect("re-enabled profile produced a run");
    assert_eq!(run.status, RunStatus::Succeeded);

    scheduler.stop().await?;
    supervisor.shutdown().await;
    Ok(())
}
