//! Test sessions backed by Neon branches.
//!
//! A [`NeonSession`] provisions the branch tests run against, according to the configured
//! [`SharingPolicy`], publishes its connection string and cleans everything up on
//! [`NeonSession::finish`]. [`NeonSession::scope`] guarantees the cleanup even when the body
//! panics.

use std::future::Future;
use std::ops::AsyncFnOnce;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use api::{HttpNeonClient, NeonApi};
use async_trait::async_trait;
use config::shared::{NeonConfig, SharingPolicy};
use config::{CliOverrides, ConfigSources, load_neon_config};
use futures::FutureExt;
use postgres::schema::SchemaFingerprint;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bail;
use crate::branch::Branch;
use crate::branch_error;
use crate::coordination::{DEFAULT_SIGNAL_TIMEOUT, WorkerCoordinator, WorkerRole};
use crate::endpoint::EndpointWaiter;
use crate::environment::{EnvStore, EnvironmentPublisher, ProcessEnv};
use crate::error::{BranchResult, ErrorKind};
use crate::lifecycle::{BranchLifecycle, LifecycleSettings, LifecycleState, PasswordStrategy};
use crate::naming::BranchPurpose;
use crate::provider::ProviderClient;
use crate::retry::RateLimitedCaller;

/// Coordination key of the branch shared by the workers.
const SHARED_BRANCH_KEY: &str = "branch";

/// Signal sent by the creator once migrations ran.
pub const MIGRATIONS_DONE_SIGNAL: &str = "migrations_done";

/// Prepares the schema of a freshly created branch.
///
/// Runs exactly once per shared branch, on the worker that created it.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn migrate(&self, branch: &Branch) -> BranchResult<()>;
}

/// [`MigrationHook`] leaving the branch untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigrations;

#[async_trait]
impl MigrationHook for NoMigrations {
    async fn migrate(&self, _branch: &Branch) -> BranchResult<()> {
        Ok(())
    }
}

/// [`MigrationHook`] calling an async function.
pub struct MigrationFn<F>(F);

#[async_trait]
impl<F, Fut> MigrationHook for MigrationFn<F>
where
    F: Fn(Branch) -> Fut + Send + Sync,
    Fut: Future<Output = BranchResult<()>> + Send,
{
    async fn migrate(&self, branch: &Branch) -> BranchResult<()> {
        (self.0)(branch.clone()).await
    }
}

/// Wraps an async function into a [`MigrationHook`].
pub fn migration_fn<F, Fut>(f: F) -> Arc<dyn MigrationHook>
where
    F: Fn(Branch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BranchResult<()>> + Send + 'static,
{
    Arc::new(MigrationFn(f))
}

/// Reads the schema of a branch, used to detect whether migrations changed anything.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn fingerprint(&self, branch: &Branch) -> BranchResult<SchemaFingerprint>;
}

/// [`SchemaInspector`] querying the branch with `sqlx`.
#[cfg(feature = "sqlx")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxSchemaInspector;

#[cfg(feature = "sqlx")]
#[async_trait]
impl SchemaInspector for SqlxSchemaInspector {
    async fn fingerprint(&self, branch: &Branch) -> BranchResult<SchemaFingerprint> {
        Ok(postgres::schema::schema_fingerprint(branch.connection_string()).await?)
    }
}

/// What workers share through the coordination cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SharedState {
    branch: Branch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pre_migration_fingerprint: Option<SchemaFingerprint>,
}

/// Collaborators of a [`NeonSession`], replaceable in tests.
pub struct SessionOptions {
    /// Provider API, an HTTPS client built from the configuration when `None`.
    pub api: Option<Arc<dyn NeonApi>>,
    pub caller: RateLimitedCaller,
    pub env: Arc<dyn EnvStore>,
    /// Worker coordination, read from the environment when `None`.
    pub coordinator: Option<WorkerCoordinator>,
    pub migrations: Arc<dyn MigrationHook>,
    pub schema_inspector: Option<Arc<dyn SchemaInspector>>,
    pub password_strategy: PasswordStrategy,
    pub endpoint_waiter: EndpointWaiter,
    pub signal_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            api: None,
            caller: RateLimitedCaller::default(),
            env: Arc::new(ProcessEnv),
            coordinator: None,
            migrations: Arc::new(NoMigrations),
            schema_inspector: None,
            password_strategy: PasswordStrategy::default(),
            endpoint_waiter: EndpointWaiter::default(),
            signal_timeout: DEFAULT_SIGNAL_TIMEOUT,
        }
    }
}

impl SessionOptions {
    pub fn with_api(mut self, api: Arc<dyn NeonApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_caller(mut self, caller: RateLimitedCaller) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_env(mut self, env: Arc<dyn EnvStore>) -> Self {
        self.env = env;
        self
    }

    pub fn with_coordinator(mut self, coordinator: WorkerCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_migrations(mut self, migrations: Arc<dyn MigrationHook>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_schema_inspector(mut self, inspector: Arc<dyn SchemaInspector>) -> Self {
        self.schema_inspector = Some(inspector);
        self
    }

    pub fn with_password_strategy(mut self, strategy: PasswordStrategy) -> Self {
        self.password_strategy = strategy;
        self
    }

    pub fn with_endpoint_waiter(mut self, waiter: EndpointWaiter) -> Self {
        self.endpoint_waiter = waiter;
        self
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }
}

/// Everything a session must release, also when provisioning fails half way.
struct Resources {
    publisher: EnvironmentPublisher,
    coordinator: WorkerCoordinator,
    shared: BranchLifecycle,
    /// Set when this worker created the shared branch and cached it for the others.
    created_shared: bool,
    test: Option<BranchLifecycle>,
    released: bool,
}

impl Resources {
    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.publisher.restore();

        if let Some(test) = self.test.as_mut() {
            test.delete().await;
        }
        self.shared.delete().await;

        if self.created_shared {
            self.forget_shared().await;
        }
    }

    /// Clears the coordination files of the run, so that a later run reusing the session
    /// directory creates its own branch.
    async fn forget_shared(&self) {
        if let Err(err) = self.coordinator.forget(SHARED_BRANCH_KEY).await {
            warn!(error = %err, "failed to clear the cached shared branch");
        }
        if let Err(err) = self.coordinator.clear_signal(MIGRATIONS_DONE_SIGNAL) {
            warn!(error = %err, "failed to clear the migrations signal");
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.publisher.restore();
        warn!(
            branch_id = ?self.shared.branch_id(),
            "session dropped without being finished, its branches are left to expire"
        );
    }
}

/// Branches provisioned for the tests of one worker.
pub struct NeonSession {
    config: NeonConfig,
    coordinator: WorkerCoordinator,
    role: WorkerRole,
    branch: Branch,
    migration_branch: Branch,
    resources: Resources,
}

impl NeonSession {
    /// Provisions the branch of this worker and publishes its connection string.
    ///
    /// Whatever was created is released again when provisioning fails.
    pub async fn start(config: NeonConfig, options: SessionOptions) -> BranchResult<Self> {
        let api: Arc<dyn NeonApi> = match options.api.clone() {
            Some(api) => api,
            None => Arc::new(HttpNeonClient::new(
                config.api_base_url.clone(),
                config.api_key.clone(),
            )?),
        };

        let coordinator = match config.sharing {
            SharingPolicy::PerWorker => WorkerCoordinator::solo(),
            _ => options
                .coordinator
                .clone()
                .unwrap_or_else(WorkerCoordinator::from_env),
        };

        let provider = ProviderClient::new(api, config.project_id.clone(), options.caller.clone());
        let settings = LifecycleSettings::from_config(&config)
            .with_password_strategy(options.password_strategy);
        let lifecycle =
            BranchLifecycle::new(provider, settings).with_endpoint_waiter(options.endpoint_waiter);

        let mut resources = Resources {
            publisher: EnvironmentPublisher::new(options.env.clone(), config.env_var.clone()),
            coordinator: coordinator.clone(),
            shared: lifecycle,
            created_shared: false,
            test: None,
            released: false,
        };

        info!(
            project_id = %config.project_id,
            sharing = %config.sharing,
            worker = %coordinator.worker().as_str(),
            "starting Neon session"
        );

        match provision(&config, &coordinator, &options, &mut resources).await {
            Ok((role, branch, migration_branch)) => Ok(Self {
                config,
                coordinator,
                role,
                branch,
                migration_branch,
                resources,
            }),
            Err(err) => {
                warn!(error = %err, "provisioning the session failed, releasing its branches");
                resources.release().await;

                Err(err)
            }
        }
    }

    /// Starts a session, runs `body` and finishes the session.
    ///
    /// The session is finished even when `body` panics, the panic is resumed afterwards.
    pub async fn scope<T>(
        config: NeonConfig,
        options: SessionOptions,
        body: impl AsyncFnOnce(&mut NeonSession) -> T,
    ) -> BranchResult<T> {
        let mut session = Self::start(config, options).await?;

        let outcome = AssertUnwindSafe(body(&mut session)).catch_unwind().await;
        session.finish().await;

        match outcome {
            Ok(output) => Ok(output),
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Returns the branch tests of this worker run against.
    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    /// Returns the branch migrations ran against.
    ///
    /// Differs from [`NeonSession::branch`] only with [`SharingPolicy::ResetPerTest`], where
    /// the test branch is forked from it.
    pub fn migration_branch(&self) -> &Branch {
        &self.migration_branch
    }

    /// Returns `true` when this worker created the shared branch.
    pub fn is_creator(&self) -> bool {
        self.role == WorkerRole::Creator
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn config(&self) -> &NeonConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &WorkerCoordinator {
        &self.coordinator
    }

    /// Runs a test that writes to the branch.
    ///
    /// With [`SharingPolicy::ResetPerTest`] the branch is reset to its parent afterwards, also
    /// when the test panics. The test is not run when the branch has no parent to reset to, or
    /// when an earlier reset failed.
    pub async fn run_readwrite<F, Fut, T>(&mut self, test: F) -> BranchResult<T>
    where
        F: FnOnce(Branch) -> Fut,
        Fut: Future<Output = T>,
    {
        let resets = self.config.sharing == SharingPolicy::ResetPerTest;

        if resets && self.branch.parent_id().is_none() {
            bail!(
                ErrorKind::MissingParent,
                "The test branch cannot be reset",
                format!(
                    "branch {} has no parent, read-write tests need one to reset to",
                    self.branch.branch_id()
                )
            );
        }

        let unusable = self
            .resources
            .test
            .as_ref()
            .map(BranchLifecycle::state)
            .filter(|state| resets && *state != LifecycleState::Ready);
        if let Some(state) = unusable {
            bail!(
                ErrorKind::InvalidState,
                "The test branch is no longer usable",
                format!(
                    "branch {} is in state {state} after a failed reset and may hold data left by earlier tests",
                    self.branch.branch_id()
                )
            );
        }

        let outcome = AssertUnwindSafe(test(self.branch.clone()))
            .catch_unwind()
            .await;

        let reset = match self.resources.test.as_mut() {
            Some(test_branch) if resets => test_branch.reset().await,
            _ => Ok(()),
        };

        match (outcome, reset) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(err)) => Err(err),
            (Err(panic), reset) => {
                if let Err(err) = reset {
                    warn!(error = %err, "failed to reset the branch after a panicking test");
                }
                resume_unwind(panic)
            }
        }
    }

    /// Runs a test that only reads from the branch. The branch is never reset.
    pub async fn run_readonly<F, Fut, T>(&self, test: F) -> T
    where
        F: FnOnce(Branch) -> Fut,
        Fut: Future<Output = T>,
    {
        test(self.branch.clone()).await
    }

    /// Restores the environment and deletes the branches this worker created.
    ///
    /// Teardown failures are logged. Calling it again does nothing.
    pub async fn finish(&mut self) {
        self.resources.release().await;
        debug!(branch_id = %self.branch.branch_id(), "Neon session finished");
    }
}

/// Creates the shared branch, provisions the worker's test branch and publishes it.
///
/// Returns the role of the worker, the branch tests run against and the migrated branch.
async fn provision(
    config: &NeonConfig,
    coordinator: &WorkerCoordinator,
    options: &SessionOptions,
    resources: &mut Resources,
) -> BranchResult<(WorkerRole, Branch, Branch)> {
    let resets = config.sharing == SharingPolicy::ResetPerTest;
    let purpose = match config.sharing {
        SharingPolicy::Session if coordinator.is_solo() => BranchPurpose::Test,
        SharingPolicy::Session => BranchPurpose::Shared,
        SharingPolicy::ResetPerTest => BranchPurpose::Migrated,
        SharingPolicy::PerWorker => BranchPurpose::Test,
    };
    let inspector = options.schema_inspector.as_deref().filter(|_| resets);

    let shared = &mut resources.shared;
    let (state, role) = coordinator
        .coordinate(SHARED_BRANCH_KEY, move || {
            let shared = shared;
            async move {
                coordinator.clear_signal(MIGRATIONS_DONE_SIGNAL)?;
                create_shared(shared, purpose, inspector).await
            }
        })
        .await?;

    resources.created_shared = role == WorkerRole::Creator;
    if role == WorkerRole::Follower {
        resources.shared = resources.shared.adopt(state.branch.clone());
    }

    resources.publisher.set(state.branch.connection_string());

    match role {
        WorkerRole::Creator => {
            migrate(options.migrations.as_ref(), &state.branch).await?;
            coordinator.send_signal(MIGRATIONS_DONE_SIGNAL)?;
        }
        WorkerRole::Follower => {
            coordinator
                .wait_for_signal(MIGRATIONS_DONE_SIGNAL, options.signal_timeout)
                .await?;
        }
    }

    if !resets {
        return Ok((role, state.branch.clone(), state.branch));
    }

    let parent_id = fork_parent(&state, inspector).await;
    let mut test = resources.shared.sibling();
    let created = test.create(BranchPurpose::Test, Some(&parent_id)).await;
    resources.test = Some(test);
    let branch = created?;

    resources.publisher.set(branch.connection_string());

    Ok((role, branch, state.branch))
}

async fn create_shared(
    lifecycle: &mut BranchLifecycle,
    purpose: BranchPurpose,
    inspector: Option<&dyn SchemaInspector>,
) -> BranchResult<SharedState> {
    let branch = lifecycle.create(purpose, None).await?;

    let pre_migration_fingerprint = match inspector {
        Some(inspector) => match inspector.fingerprint(&branch).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(err) => {
                warn!(error = %err, "could not read the schema before migrations");
                None
            }
        },
        None => None,
    };

    Ok(SharedState {
        branch,
        pre_migration_fingerprint,
    })
}

async fn migrate(migrations: &dyn MigrationHook, branch: &Branch) -> BranchResult<()> {
    info!(branch_id = %branch.branch_id(), "running migrations");

    migrations.migrate(branch).await.map_err(|err| {
        if err.kind() == ErrorKind::MigrationFailed {
            return err;
        }

        branch_error!(
            ErrorKind::MigrationFailed,
            "Migrations failed",
            format!("migrating branch {}: {err}", branch.branch_id()),
            source: err
        )
    })
}

/// Returns the branch the worker's test branch is forked from.
///
/// The migrated branch, unless migrations provably left the schema untouched, in which case
/// the original parent is used.
async fn fork_parent(state: &SharedState, inspector: Option<&dyn SchemaInspector>) -> String {
    let migrated = state.branch.branch_id().to_string();

    let (Some(inspector), Some(before), Some(original_parent)) = (
        inspector,
        state.pre_migration_fingerprint.as_ref(),
        state.branch.parent_id(),
    ) else {
        return migrated;
    };

    match inspector.fingerprint(&state.branch).await {
        Ok(after) if after == *before => {
            info!(
                parent_id = original_parent,
                "migrations left the schema unchanged, forking from the original parent"
            );
            original_parent.to_string()
        }
        Ok(after) => {
            debug!(
                changed_tables = ?before.changed_tables(&after),
                "migrations changed the schema"
            );
            migrated
        }
        Err(err) => {
            warn!(error = %err, "could not read the schema after migrations");
            migrated
        }
    }
}

/// Loads the Neon configuration of the current process.
///
/// Fails with [`ErrorKind::ConfigurationMissing`] when no credentials are configured.
pub fn load_session_config(overrides: CliOverrides) -> BranchResult<NeonConfig> {
    load_neon_config(&ConfigSources::from_process(overrides))?.ok_or_else(|| {
        branch_error!(
            ErrorKind::ConfigurationMissing,
            "Neon credentials are not configured",
            "set NEON_API_KEY and NEON_PROJECT_ID to run tests against Neon branches"
        )
    })
}

/// Starts a session from the process configuration.
///
/// Returns `None` when no credentials are configured, so that callers can skip their tests.
pub async fn start_from_env(options: SessionOptions) -> BranchResult<Option<NeonSession>> {
    let config = match load_session_config(CliOverrides::default()) {
        Ok(config) => config,
        Err(err) if err.kind() == ErrorKind::ConfigurationMissing => {
            info!("Neon credentials are not configured, skipping");
            eprintln!("skipping: NEON_API_KEY and NEON_PROJECT_ID are not set");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    NeonSession::start(config, options).await.map(Some)
}

/// Starts a [`NeonSession`] or returns from the calling test when Neon is not configured.
///
/// Panics when the session cannot be started, failing the test.
#[macro_export]
macro_rules! session_or_skip {
    () => {
        $crate::session_or_skip!($crate::session::SessionOptions::default())
    };
    ($options:expr) => {
        match $crate::session::start_from_env($options).await {
            ::core::result::Result::Ok(::core::option::Option::Some(session)) => session,
            ::core::result::Result::Ok(::core::option::Option::None) => return,
            ::core::result::Result::Err(err) => {
                panic!("failed to start the Neon session: {err}")
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use api::models::OperationStatus;
    use postgres::schema::ColumnFingerprint;

    use super::*;
    use crate::environment::MemoryEnv;
    use crate::error::BranchError;
    use crate::test_utils::{
        MOCK_DEFAULT_BRANCH_ID, MockNeonApi, RecordingSleeper, test_caller, test_config,
    };

    /// Returns the scripted fingerprints in order, one per read.
    struct ScriptedInspector {
        reads: Mutex<VecDeque<BranchResult<SchemaFingerprint>>>,
    }

    impl ScriptedInspector {
        fn new(reads: Vec<BranchResult<SchemaFingerprint>>) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
            })
        }
    }

    #[async_trait]
    impl SchemaInspector for ScriptedInspector {
        async fn fingerprint(&self, _branch: &Branch) -> BranchResult<SchemaFingerprint> {
            self.reads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SchemaFingerprint::default()))
        }
    }

    fn users_table() -> SchemaFingerprint {
        SchemaFingerprint::new(vec![ColumnFingerprint {
            table_schema: "public".to_string(),
            table_name: "users".to_string(),
            column_name: "id".to_string(),
            data_type: "integer".to_string(),
            is_nullable: false,
            column_default: None,
            ordinal_position: 1,
        }])
    }

    fn inspector_error() -> BranchError {
        branch_error!(ErrorKind::ProviderRequestFailed, "schema unreadable")
    }

    /// Starts a reset-per-test session and returns the parent the test branch was forked from.
    async fn forked_parent(inspector: Arc<ScriptedInspector>) -> String {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new());
        let mut config = test_config();
        config.sharing = SharingPolicy::ResetPerTest;

        let options = options(&api, &env).with_schema_inspector(inspector);

        let mut session = NeonSession::start(config, options).await.unwrap();
        session.finish().await;

        let creates: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|call| call.method == "create_branch")
            .collect();
        assert_eq!(creates.len(), 2);

        creates[1].args[2].clone()
    }

    fn options(api: &Arc<MockNeonApi>, env: &Arc<MemoryEnv>) -> SessionOptions {
        SessionOptions::default()
            .with_api(api.clone())
            .with_caller(test_caller(Arc::new(RecordingSleeper::default())))
            .with_env(env.clone())
            .with_coordinator(WorkerCoordinator::solo())
    }

    #[tokio::test]
    async fn test_session_publishes_and_restores() {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new());

        let mut session = NeonSession::start(test_config(), options(&api, &env))
            .await
            .unwrap();

        assert!(session.is_creator());
        assert_eq!(
            env.get("DATABASE_URL").as_deref(),
            Some(session.branch().connection_string())
        );
        assert!(session.branch().branch_id().starts_with("br-created-"));

        session.finish().await;
        session.finish().await;

        assert_eq!(env.get("DATABASE_URL"), None);
        assert_eq!(api.count_calls("delete_branch"), 1);
    }

    #[tokio::test]
    async fn test_solo_session_branch_is_a_test_branch() {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new());

        let mut session = NeonSession::start(test_config(), options(&api, &env))
            .await
            .unwrap();
        session.finish().await;

        assert!(api.calls()[0].args[1].ends_with("-test"));
    }

    #[tokio::test]
    async fn test_migration_failure_releases_branch() {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new().with_var("DATABASE_URL", "postgresql://original"));
        let options = options(&api, &env).with_migrations(migration_fn(|_branch| async {
            Err(branch_error!(ErrorKind::ProviderRequestFailed, "table exists"))
        }));

        let err = NeonSession::start(test_config(), options)
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert_eq!(api.count_calls("delete_branch"), 1);
        assert_eq!(
            env.get("DATABASE_URL").as_deref(),
            Some("postgresql://original")
        );
    }

    #[tokio::test]
    async fn test_reset_per_test_forks_from_migrated_branch() {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new());
        let mut config = test_config();
        config.sharing = SharingPolicy::ResetPerTest;

        let mut session = NeonSession::start(config, options(&api, &env))
            .await
            .unwrap();

        assert_eq!(session.migration_branch().branch_id(), "br-created-1");
        assert_eq!(session.branch().branch_id(), "br-created-2");
        assert_eq!(session.branch().parent_id(), Some("br-created-1"));
        assert!(api.calls()[0].args[1].ends_with("-migrated"));
        assert_eq!(
            env.get("DATABASE_URL").as_deref(),
            Some(session.branch().connection_string())
        );

        let answer = session.run_readwrite(|_branch| async { 42 }).await.unwrap();
        assert_eq!(answer, 42);
        assert_eq!(api.count_calls("restore_branch"), 1);

        session.run_readonly(|_branch| async {}).await;
        assert_eq!(api.count_calls("restore_branch"), 1);

        session.finish().await;
        assert_eq!(api.count_calls("delete_branch"), 2);
    }

    #[tokio::test]
    async fn test_unchanged_schema_forks_from_original_parent() {
        let inspector = ScriptedInspector::new(vec![Ok(users_table()), Ok(users_table())]);

        assert_eq!(forked_parent(inspector).await, MOCK_DEFAULT_BRANCH_ID);
    }

    #[tokio::test]
    async fn test_changed_schema_forks_from_migrated_branch() {
        let inspector =
            ScriptedInspector::new(vec![Ok(SchemaFingerprint::default()), Ok(users_table())]);

        assert_eq!(forked_parent(inspector).await, "br-created-1");
    }

    #[tokio::test]
    async fn test_unreadable_schema_forks_from_migrated_branch() {
        let after_fails = ScriptedInspector::new(vec![Ok(users_table()), Err(inspector_error())]);
        assert_eq!(forked_parent(after_fails).await, "br-created-1");

        let before_fails = ScriptedInspector::new(vec![Err(inspector_error()), Ok(users_table())]);
        assert_eq!(forked_parent(before_fails).await, "br-created-1");
    }

    #[tokio::test]
    async fn test_failed_reset_stops_later_readwrite_tests() {
        let api = Arc::new(MockNeonApi::new());
        api.set_restore_operations(vec![MockNeonApi::operation(
            "op-restore",
            OperationStatus::Running,
            None,
        )]);
        api.script_operation_error("op-restore", "restore failed");
        let env = Arc::new(MemoryEnv::new());
        let mut config = test_config();
        config.sharing = SharingPolicy::ResetPerTest;

        let mut session = NeonSession::start(config, options(&api, &env))
            .await
            .unwrap();

        let err = session.run_readwrite(|_branch| async {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResetFailed);

        let mut ran = false;
        let err = session
            .run_readwrite(|_branch| {
                ran = true;
                async {}
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!ran);
        assert_eq!(api.count_calls("restore_branch"), 1);

        session.finish().await;
        assert_eq!(api.count_calls("delete_branch"), 2);
    }

    #[tokio::test]
    async fn test_session_policy_never_resets() {
        let api = Arc::new(MockNeonApi::new());
        let env = Arc::new(MemoryEnv::new());

        let mut session = NeonSession::start(test_config(), options(&api, &env))
            .await
            .unwrap();
        session.run_readwrite(|_branch| async {}).await.unwrap();
        session.finish().await;

        assert_eq!(api.count_calls("restore_branch"), 0);
    }
}
