use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use branching::NeonSession;
use branching::coordination::{WorkerCoordinator, WorkerId, WorkerRole};
use branching::environment::MemoryEnv;
use branching::error::ErrorKind;
use branching::session::{SessionOptions, migration_fn};
use branching::test_utils::{MockNeonApi, RecordingSleeper, test_caller, test_config};
use branching::{SharingPolicy, branch_error};
use futures::future::join_all;
use telemetry::init_test_tracing;
use tempfile::TempDir;

const WORKERS: usize = 4;

fn worker_options(api: &Arc<MockNeonApi>, dir: &TempDir, worker: usize) -> SessionOptions {
    worker_options_with_sleeper(api, dir, worker, Arc::new(RecordingSleeper::default()))
}

fn worker_options_with_sleeper(
    api: &Arc<MockNeonApi>,
    dir: &TempDir,
    worker: usize,
    sleeper: Arc<RecordingSleeper>,
) -> SessionOptions {
    let coordinator = WorkerCoordinator::new(
        WorkerId::from_value(Some(&format!("gw{worker}"))),
        dir.path(),
    )
    .with_sleeper(sleeper.clone());

    SessionOptions::default()
        .with_api(api.clone())
        .with_caller(test_caller(sleeper))
        .with_env(Arc::new(MemoryEnv::new()))
        .with_coordinator(coordinator)
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_workers_share_one_branch_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let migrations = Arc::new(AtomicUsize::new(0));

    let starts = (0..WORKERS).map(|worker| {
        let migrations = migrations.clone();
        let options =
            worker_options(&api, &dir, worker).with_migrations(migration_fn(move |_branch| {
                let migrations = migrations.clone();
                async move {
                    migrations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));

        NeonSession::start(test_config(), options)
    });
    let mut sessions: Vec<NeonSession> = join_all(starts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(api.count_calls("create_branch"), 1);
    assert_eq!(migrations.load(Ordering::SeqCst), 1);
    assert_eq!(
        sessions.iter().filter(|session| session.is_creator()).count(),
        1
    );
    for session in &sessions {
        assert_eq!(session.branch(), sessions[0].branch());
    }
    assert!(api.calls()[0].args[1].ends_with("-shared"));

    for session in &mut sessions {
        session.finish().await;
    }

    assert_eq!(api.count_calls("delete_branch"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn per_worker_policy_creates_independent_branches_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.sharing = SharingPolicy::PerWorker;

    let mut first = NeonSession::start(config.clone(), worker_options(&api, &dir, 0))
        .await
        .unwrap();
    let mut second = NeonSession::start(config, worker_options(&api, &dir, 1))
        .await
        .unwrap();

    assert_ne!(first.branch(), second.branch());
    assert_eq!(first.role(), WorkerRole::Creator);
    assert_eq!(second.role(), WorkerRole::Creator);
    assert!(!dir.path().join("neon_branch.json").exists());

    first.finish().await;
    second.finish().await;

    assert_eq!(api.count_calls("delete_branch"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_time_out_when_creator_migrations_fail_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let follower_sleeper = Arc::new(RecordingSleeper::default());

    // Migrations fail once the follower is waiting for them.
    let waiting = follower_sleeper.clone();
    let creator = worker_options(&api, &dir, 0).with_migrations(migration_fn(move |_branch| {
        let waiting = waiting.clone();
        async move {
            while waiting.sleeps().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(branch_error!(ErrorKind::MigrationFailed, "Migrations failed"))
        }
    }));
    let follower_options = worker_options_with_sleeper(&api, &dir, 1, follower_sleeper)
        .with_signal_timeout(Duration::from_secs(2));

    // The follower starts once the creator cached the branch.
    let cache = dir.path().join("neon_branch.json");
    let follower = async {
        while !cache.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        NeonSession::start(test_config(), follower_options).await
    };
    let (creator, follower) = tokio::join!(NeonSession::start(test_config(), creator), follower);

    assert_eq!(creator.err().unwrap().kind(), ErrorKind::MigrationFailed);
    assert_eq!(follower.err().unwrap().kind(), ErrorKind::SignalTimeout);
    assert_eq!(api.count_calls("create_branch"), 1);
    assert_eq!(api.count_calls("delete_branch"), 1);
    assert!(!dir.path().join("neon_branch.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_sessions_on_one_directory_each_create_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let migrations = Arc::new(AtomicUsize::new(0));

    let mut branches = Vec::new();
    for (run, worker) in [(1, 0), (2, 1)] {
        let migrations = migrations.clone();
        let options =
            worker_options(&api, &dir, worker).with_migrations(migration_fn(move |_branch| {
                let migrations = migrations.clone();
                async move {
                    migrations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));

        let mut session = NeonSession::start(test_config(), options).await.unwrap();
        assert!(session.is_creator(), "run {run} followed a finished run");
        branches.push(session.branch().branch_id().to_string());
        session.finish().await;

        assert!(!dir.path().join("neon_branch.json").exists());
        assert!(!dir.path().join("neon_migrations_done").exists());
    }

    assert_eq!(branches, vec!["br-created-1", "br-created-2"]);
    assert_eq!(api.count_calls("create_branch"), 2);
    assert_eq!(api.count_calls("delete_branch"), 2);
    assert_eq!(migrations.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_migrations_signal_is_withdrawn_before_migrating_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let signal = dir.path().join("neon_migrations_done");
    std::fs::write(&signal, "gw0").unwrap();

    let visible = signal.clone();
    let creator = worker_options(&api, &dir, 0).with_migrations(migration_fn(move |_branch| {
        let stale = visible.exists();
        async move {
            if stale {
                return Err(branch_error!(
                    ErrorKind::MigrationFailed,
                    "Signal of an earlier run is still visible"
                ));
            }
            Ok(())
        }
    }));

    let mut session = NeonSession::start(test_config(), creator).await.unwrap();
    assert!(session.is_creator());
    assert!(signal.exists());

    session.finish().await;
    assert!(!signal.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_per_test_workers_fork_their_own_branch_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.sharing = SharingPolicy::ResetPerTest;

    let mut first = NeonSession::start(config.clone(), worker_options(&api, &dir, 0))
        .await
        .unwrap();
    let mut second = NeonSession::start(config, worker_options(&api, &dir, 1))
        .await
        .unwrap();

    assert_eq!(first.migration_branch(), second.migration_branch());
    assert_ne!(first.branch(), second.branch());
    assert_eq!(
        second.branch().parent_id(),
        Some(first.migration_branch().branch_id())
    );
    assert_eq!(api.count_calls("create_branch"), 3);

    second.run_readwrite(|_branch| async {}).await.unwrap();
    assert_eq!(api.count_calls("restore_branch"), 1);

    second.finish().await;
    first.finish().await;

    // Each worker deletes its test branch, only the creator deletes the migrated branch.
    assert_eq!(api.count_calls("delete_branch"), 3);
}
