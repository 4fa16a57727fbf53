mod test_helpers;

use anyhow::Result;
use backup_orchestrator::backup::{BackupError, RunFilter, RunStatus, DRY_RUN_MESSAGE};
use backup_orchestrator::config::BackupConfig;
use backup_orchestrator::engine::{BACKUP_STARTED, DEFAULT_BROWSE_PATH};
use backup_orchestrator::remote::RemoteEntryKind;
use std::time::Duration;
use test_helpers::*;
use tracing_test::traced_test;

fn engine_config() -> BackupConfig {
    BackupConfig {
        transfer_attempts: 1,
        shutdown_grace_seconds: 5,
        ..BackupConfig::default()
    }
}

async fn seeded() -> TestEnv {
    let env = TestEnv::new().await;
    env.remote.add_file("/data/a.txt", b"alpha");
    env.remote.add_file("/data/b.txt", b"bravo");
    env.add_file_rule(1, "/data", true, None).await;
    env
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_start_backup_returns_run_id_immediately() -> Result<()> {
    let env = seeded().await;
    let engine = env.engine(&engine_config()).await;

    let accepted = engine.start_backup(PROFILE_ID).await?;
    assert_eq!(accepted.profile_id, PROFILE_ID);
    assert_eq!(accepted.message, BACKUP_STARTED);
    let run_id = accepted.run_id.expect("run id");

    let run = wait_for_terminal(&env.ledger(), run_id, Duration::from_secs(5)).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.total_files, 2);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trigger_backup_runs_disabled_profiles() -> Result<()> {
    let env = seeded().await;
    env.store.put_profile(profile(PROFILE_ID, "nightly", false, None)).await;
    let engine = env.engine(&engine_config()).await;

    let accepted = engine.trigger_backup(PROFILE_ID).await?;
    assert_eq!(accepted.message, BACKUP_STARTED);
    assert!(accepted.run_id.is_none());

    let run = wait_for_profile_run(&env.ledger(), PROFILE_ID, Duration::from_secs(5))
        .await
        .expect("manual trigger produced a run");
    assert_eq!(run.status, RunStatus::Succeeded);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_profile_is_not_found() -> Result<()> {
    let env = seeded().await;
    let engine = env.engine(&engine_config()).await;

    assert!(engine.trigger_backup(99).await.unwrap_err().is_not_found());
    assert!(engine.start_backup(99).await.unwrap_err().is_not_found());
    assert!(engine.schedule_profile(99).await.unwrap_err().is_not_found());
    assert!(engine.dry_run(99).await.unwrap_err().is_not_found());
    assert!(engine.list_runs(&RunFilter::default()).await?.is_empty());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dry_run_touches_nothing() -> Result<()> {
    let env = seeded().await;
    env.add_command(1, backup_orchestrator::backup::RunStage::Pre, 1, "sync").await;
    let engine = env.engine(&engine_config()).await;

    let report = engine.dry_run(PROFILE_ID).await?;
    assert_eq!(report.message, DRY_RUN_MESSAGE);
    assert_eq!(report.pre_commands.len(), 1);
    assert!(report.post_commands.is_empty());
    assert_eq!(report.file_rules.len(), 1);
    assert_eq!(report.naming_preview, "my-server/my_database");
    assert_eq!(report.destination_preview, env.destination());
    assert!(report.server.password.is_empty());

    let json = serde_json::to_value(&report)?;
    assert!(json["server"].get("password").is_none());

    assert_eq!(env.remote.connects(), 0);
    assert!(engine.list_runs(&RunFilter::default()).await?.is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_translate_previews_pattern() -> Result<()> {
    let env = TestEnv::new().await;
    let engine = env.engine(&engine_config()).await;

    assert_eq!(
        engine.translate("{SERVER_NAME}-{SERVER_HOST}/{profile}/{unknown}"),
        "my-server-192.168.1.100/my_database/{unknown}"
    );
    let dated = engine.translate("{YYYY}");
    assert_eq!(dated.len(), 4);
    assert!(dated.chars().all(|c| c.is_ascii_digit()));

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_and_delete_runs() -> Result<()> {
    let env = seeded().await;
    let engine = env.engine(&engine_config()).await;

    let run = engine
        .execute_backup(PROFILE_ID, false)
        .await?
        .run()
        .cloned()
        .expect("completed run");
    let files = engine.list_run_files(run.id).await?;
    assert_eq!(files.len(), 2);
    assert!(!engine.list_run_logs(run.id).await?.is_empty());

    let opened = engine.open_backup_file(files[0].id).await?;
    assert!(opened.local_path.exists());

    std::fs::remove_file(&files[1].local_path)?;
    let missing = engine.open_backup_file(files[1].id).await.unwrap_err();
    assert!(matches!(missing, BackupError::ArtifactMissing { .. }));
    assert!(engine.open_backup_file(9_999).await.unwrap_err().is_not_found());

    engine.delete_run(run.id).await?;
    assert!(engine.get_run(run.id).await.unwrap_err().is_not_found());
    assert!(engine.list_run_files(run.id).await.unwrap_err().is_not_found());
    assert!(engine.delete_run(run.id).await.unwrap_err().is_not_found());
    // artifacts stay on disk
    assert!(opened.local_path.exists());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_connection_and_browsing() -> Result<()> {
    let env = seeded().await;
    env.remote.add_file("/home/alice/notes.txt", b"hi");
    env.remote.add_file("/home/readme", b"readme");
    let engine = env.engine(&engine_config()).await;

    engine.test_server_connection(SERVER_ID).await?;
    assert_eq!(env.remote.executed(), vec!["echo test"]);

    let entries = engine.list_server_files(SERVER_ID, None).await?;
    assert!(entries
        .iter()
        .any(|e| e.path == "/home/alice" && e.kind == RemoteEntryKind::Directory));
    assert!(entries.iter().any(|e| e.path == "/home/readme" && e.is_file()));
    assert_eq!(
        engine.list_server_files(SERVER_ID, Some("  ")).await?,
        engine.list_server_files(SERVER_ID, Some(DEFAULT_BROWSE_PATH)).await?
    );

    let data = engine.list_server_files(SERVER_ID, Some("/data")).await?;
    assert_eq!(data.len(), 2);
    assert_eq!(env.remote.connects(), env.remote.closes());

    env.remote.fail_connect();
    let err = engine.test_server_connection(SERVER_ID).await.unwrap_err();
    assert!(matches!(err, BackupError::DialFailed { .. }));
    assert!(engine.test_server_connection(77).await.unwrap_err().is_not_found());

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_schedule_profile_reads_current_record() -> Result<()> {
    let env = TestEnv::new().await;
    let engine = env.engine(&engine_config()).await;

    engine.schedule_profile(PROFILE_ID).await?;
    assert!(engine.scheduler().is_scheduled(PROFILE_ID).await);

    env.store.put_profile(profile(PROFILE_ID, "nightly", true, None)).await;
    engine.schedule_profile(PROFILE_ID).await?;
    assert!(!engine.scheduler().is_scheduled(PROFILE_ID).await);

    let report = engine.load_all_schedules().await?;
    assert_eq!(report.scheduled, 0);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drains_runs_then_rejects() -> Result<()> {
    let env = seeded().await;
    env.add_command(1, backup_orchestrator::backup::RunStage::Pre, 1, "slow").await;
    env.remote.delay_commands(Duration::from_millis(300));
    let engine = env.engine(&engine_config()).await;

    let run_id = engine.start_backup(PROFILE_ID).await?.run_id.expect("run id");
    engine.shutdown().await?;

    let run = engine.get_run(run_id).await?;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(engine.scheduler().is_stopped());

    let err = engine.trigger_backup(PROFILE_ID).await.unwrap_err();
    assert!(matches!(err, BackupError::ShuttingDown));
    Ok(())
}
