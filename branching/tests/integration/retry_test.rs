use std::sync::Arc;
use std::time::Duration;

use branching::NeonSession;
use branching::coordination::WorkerCoordinator;
use branching::environment::MemoryEnv;
use branching::error::ErrorKind;
use branching::session::SessionOptions;
use branching::test_utils::{MockFailure, MockNeonApi, RecordingSleeper, test_caller, test_config};
use telemetry::init_test_tracing;

fn options(api: &Arc<MockNeonApi>, sleeper: &Arc<RecordingSleeper>) -> SessionOptions {
    SessionOptions::default()
        .with_api(api.clone())
        .with_caller(test_caller(sleeper.clone()))
        .with_env(Arc::new(MemoryEnv::new()))
        .with_coordinator(WorkerCoordinator::solo())
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_creation_is_retried_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    api.fail_next(
        "create_branch",
        vec![MockFailure::RateLimited, MockFailure::RateLimited],
    );
    let sleeper = Arc::new(RecordingSleeper::default());

    let mut session = NeonSession::start(test_config(), options(&api, &sleeper))
        .await
        .unwrap();
    session.finish().await;

    assert_eq!(api.count_calls("create_branch"), 3);
    assert_eq!(
        sleeper.sleeps(),
        vec![Duration::from_secs(4), Duration::from_secs(8)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_rate_limit_exhausts_retries_test() {
    init_test_tracing();
    let api = Arc::new(MockNeonApi::new());
    api.fail_always("create_branch", MockFailure::RateLimited);
    let sleeper = Arc::new(RecordingSleeper::default());

    let err = NeonSession::start(test_config(), options(&api, &sleeper))
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::RateLimitExhausted);
    // 4 + 8 + 16 + 32 seconds, the next delay would exceed the 90 second budget.
    assert_eq!(sleeper.total(), Duration::from_secs(60));
    assert_eq!(api.count_calls("create_branch"), 5);
    assert_eq!(api.count_calls("delete_branch"), 0);
}
