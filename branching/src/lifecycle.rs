use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use api::models::CreateBranchRequest;
use config::shared::NeonConfig;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::bail;
use crate::branch::Branch;
use crate::branch_error;
use crate::endpoint::EndpointWaiter;
use crate::error::{BranchResult, ErrorKind};
use crate::naming::{BranchPurpose, generate_branch_name};
use crate::provider::{CreatedBranch, ProviderClient};

/// Format of the absolute expiry sent to the provider.
const EXPIRES_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Where a branch is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Creating,
    AwaitingEndpoint,
    FetchingCredentials,
    Ready,
    Resetting,
    Deleting,
    Deleted,
    /// Creation or reset failed. A branch created remotely is still deleted on teardown.
    Aborted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the role password of a new branch is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PasswordStrategy {
    /// Read the current password without rotating it.
    ///
    /// Falls back to [`PasswordStrategy::ResetAndCapture`] for freshly created branches when the
    /// provider refuses to reveal it.
    #[default]
    Reveal,
    /// Rotate the password and use the new one.
    ResetAndCapture,
}

/// Settings shared by every branch of a session.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub database: String,
    pub role: String,
    pub parent_branch_id: Option<String>,
    pub branch_name_prefix: Option<String>,
    pub expiry: Option<Duration>,
    pub keep_branches: bool,
    pub password_strategy: PasswordStrategy,
}

impl LifecycleSettings {
    pub fn from_config(config: &NeonConfig) -> Self {
        Self {
            database: config.database.clone(),
            role: config.role.clone(),
            parent_branch_id: config.parent_branch_id.clone(),
            branch_name_prefix: config.branch_name_prefix.clone(),
            expiry: config.branch_expiry(),
            keep_branches: config.keep_branches,
            password_strategy: PasswordStrategy::default(),
        }
    }

    pub fn with_password_strategy(mut self, strategy: PasswordStrategy) -> Self {
        self.password_strategy = strategy;
        self
    }
}

/// Drives one branch from creation to deletion.
///
/// Lifecycles built with [`BranchLifecycle::sibling`] share the provider, the settings and the
/// memoized default branch id used by the safety check.
pub struct BranchLifecycle {
    provider: ProviderClient,
    waiter: EndpointWaiter,
    settings: Arc<LifecycleSettings>,
    default_branch_id: Arc<OnceCell<Option<String>>>,
    state: LifecycleState,
    branch_id: Option<String>,
    branch: Option<Branch>,
    owned: bool,
}

impl BranchLifecycle {
    pub fn new(provider: ProviderClient, settings: LifecycleSettings) -> Self {
        Self {
            provider,
            waiter: EndpointWaiter::default(),
            settings: Arc::new(settings),
            default_branch_id: Arc::new(OnceCell::new()),
            state: LifecycleState::Uninitialized,
            branch_id: None,
            branch: None,
            owned: false,
        }
    }

    pub fn with_endpoint_waiter(mut self, waiter: EndpointWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Returns a new, uninitialized lifecycle sharing this one's provider and settings.
    pub fn sibling(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            waiter: self.waiter,
            settings: self.settings.clone(),
            default_branch_id: self.default_branch_id.clone(),
            state: LifecycleState::Uninitialized,
            branch_id: None,
            branch: None,
            owned: false,
        }
    }

    /// Returns a lifecycle for a branch created by someone else.
    ///
    /// The branch can be reset but is never deleted by this lifecycle.
    pub fn adopt(&self, branch: Branch) -> Self {
        let mut lifecycle = self.sibling();
        lifecycle.branch_id = Some(branch.branch_id().to_string());
        lifecycle.branch = Some(branch);
        lifecycle.state = LifecycleState::Ready;

        lifecycle
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the branch once it is ready.
    pub fn branch(&self) -> Option<&Branch> {
        self.branch.as_ref()
    }

    /// Returns the id of the remote branch, set as soon as the provider created it.
    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    /// Returns `true` when this lifecycle created the branch and is responsible for deleting it.
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Creates a branch and waits until it accepts connections.
    ///
    /// The parent is `parent_override`, else the configured parent, else the project default
    /// branch chosen by the provider.
    pub async fn create(
        &mut self,
        purpose: BranchPurpose,
        parent_override: Option<&str>,
    ) -> BranchResult<Branch> {
        if self.state != LifecycleState::Uninitialized {
            bail!(
                ErrorKind::InvalidState,
                "A branch can only be created once per lifecycle",
                format!("lifecycle is in state {}", self.state)
            );
        }

        self.state = LifecycleState::Creating;

        let request = match self.creation_request(purpose, parent_override).await {
            Ok(request) => request,
            Err(err) => {
                self.state = LifecycleState::Aborted;
                return Err(err);
            }
        };

        let created = match self.provider.create_branch(&request).await {
            Ok(created) => created,
            Err(err) => {
                self.state = LifecycleState::Aborted;
                return Err(err);
            }
        };

        self.branch_id = Some(created.branch.id.clone());

        if let Err(err) = self.ensure_not_default(&created.branch.id).await {
            self.state = LifecycleState::Aborted;
            return Err(err);
        }
        self.owned = true;

        match self.complete_creation(created, request.branch.parent_id).await {
            Ok(branch) => {
                self.branch = Some(branch.clone());
                self.state = LifecycleState::Ready;

                Ok(branch)
            }
            Err(err) => {
                warn!(
                    branch_id = ?self.branch_id,
                    state = %self.state,
                    error = %err,
                    "branch creation aborted"
                );
                self.state = LifecycleState::Aborted;

                Err(err)
            }
        }
    }

    /// Restores the branch to the current state of its parent and waits for the restore.
    pub async fn reset(&mut self) -> BranchResult<()> {
        let branch = match (self.state, &self.branch) {
            (LifecycleState::Ready, Some(branch)) => branch.clone(),
            _ => bail!(
                ErrorKind::InvalidState,
                "Only a ready branch can be reset",
                format!("lifecycle is in state {}", self.state)
            ),
        };

        let Some(parent_id) = branch.parent_id() else {
            bail!(
                ErrorKind::MissingParent,
                "The branch cannot be reset",
                format!("branch {} has no parent", branch.branch_id())
            );
        };

        self.ensure_not_default(branch.branch_id()).await?;

        self.state = LifecycleState::Resetting;

        let result = async {
            let operation_ids = self
                .provider
                .restore_to_parent(branch.branch_id(), parent_id)
                .await?;
            self.provider.poll_operations(&operation_ids).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(branch_id = %branch.branch_id(), parent_id, "branch reset to parent");
                self.state = LifecycleState::Ready;

                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Aborted;

                Err(branch_error!(
                    ErrorKind::ResetFailed,
                    "Resetting the branch failed",
                    format!(
                        "failed to reset branch {} to parent {parent_id}, later tests may see the data left by earlier ones: {err}",
                        branch.branch_id()
                    ),
                    source: err
                ))
            }
        }
    }

    /// Deletes the branch if this lifecycle created it.
    ///
    /// Failures are logged, and nothing is deleted when branches are kept.
    pub async fn delete(&mut self) {
        if matches!(
            self.state,
            LifecycleState::Deleted | LifecycleState::Uninitialized
        ) {
            return;
        }

        let Some(branch_id) = self.branch_id.clone() else {
            self.state = LifecycleState::Deleted;
            return;
        };

        if !self.owned {
            self.state = LifecycleState::Deleted;
            return;
        }

        if self.settings.keep_branches {
            info!(branch_id, "keeping branch");
            self.state = LifecycleState::Deleted;
            return;
        }

        self.state = LifecycleState::Deleting;
        self.provider.delete_branch(&branch_id).await;
        self.state = LifecycleState::Deleted;
    }

    async fn creation_request(
        &self,
        purpose: BranchPurpose,
        parent_override: Option<&str>,
    ) -> BranchResult<CreateBranchRequest> {
        let name = generate_branch_name(self.settings.branch_name_prefix.as_deref(), purpose).await;
        let parent_id = parent_override
            .map(str::to_string)
            .or_else(|| self.settings.parent_branch_id.clone());
        let expires_at = self.settings.expiry.map(expires_at).transpose()?;

        Ok(CreateBranchRequest::read_write(name, parent_id, expires_at))
    }

    async fn complete_creation(
        &mut self,
        created: CreatedBranch,
        requested_parent: Option<String>,
    ) -> BranchResult<Branch> {
        self.state = LifecycleState::AwaitingEndpoint;
        let endpoint_id = created.pending_endpoint()?.to_string();
        let host = self.waiter.wait(&self.provider, &endpoint_id).await?;

        self.state = LifecycleState::FetchingCredentials;
        let password = self.fetch_password(&created.branch.id).await?;

        let connection_string = format!(
            "postgresql://{}:{password}@{host}/{}?sslmode=require",
            self.settings.role, self.settings.database
        );

        Ok(Branch::new(
            created.branch.id,
            self.provider.project_id(),
            connection_string,
            host,
            created.branch.parent_id.or(requested_parent),
            Some(endpoint_id),
        ))
    }

    async fn fetch_password(&self, branch_id: &str) -> BranchResult<String> {
        let role = &self.settings.role;

        if matches!(
            self.settings.password_strategy,
            PasswordStrategy::ResetAndCapture
        ) {
            return self.provider.reset_password(branch_id, role).await;
        }

        match self.provider.reveal_password(branch_id, role).await {
            Ok(password) => Ok(password),
            Err(err) if err.kind() != ErrorKind::RateLimitExhausted => {
                warn!(
                    branch_id,
                    error = %err,
                    "could not reveal the role password, resetting it instead"
                );
                self.provider.reset_password(branch_id, role).await
            }
            Err(err) => Err(err),
        }
    }

    /// Fails if `branch_id` is the project's default branch.
    async fn ensure_not_default(&self, branch_id: &str) -> BranchResult<()> {
        let default_branch_id = self
            .default_branch_id
            .get_or_init(|| async {
                match self.provider.default_branch_id().await {
                    Ok(default_branch_id) => default_branch_id,
                    Err(err) => {
                        warn!(
                            error = %err,
                            "could not look up the default branch, skipping the safety check"
                        );
                        None
                    }
                }
            })
            .await;

        if default_branch_id.as_deref() == Some(branch_id) {
            bail!(
                ErrorKind::SafetyViolation,
                "Refusing to operate on the project default branch",
                format!("branch {branch_id} is the default branch of the project, this is a bug")
            );
        }

        Ok(())
    }
}

/// Returns the absolute expiry for a branch living `ttl` from now.
fn expires_at(ttl: Duration) -> BranchResult<String> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|err| {
        branch_error!(
            ErrorKind::ConfigError,
            "Invalid branch expiry",
            format!("{}s: {err}", ttl.as_secs())
        )
    })?;

    Ok((chrono::Utc::now() + ttl).format(EXPIRES_AT_FORMAT).to_string())
}
