use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api::NeonApi;
use api::models::{
    BranchDetails, CreateBranchRequest, EndpointDetails, Operation, RestoreBranchRequest,
};
use tracing::{debug, info, warn};

use crate::bail;
use crate::branch_error;
use crate::error::{BranchResult, ErrorKind};
use crate::retry::RateLimitedCaller;

/// How long to wait for provider operations to complete.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between two polls of pending operations or endpoints.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A branch just created by the provider.
#[derive(Debug, Clone)]
pub struct CreatedBranch {
    pub branch: BranchDetails,
    /// Endpoint started for the branch, taken from the first operation naming one.
    pub endpoint_id: Option<String>,
}

impl CreatedBranch {
    /// Returns the endpoint started for the branch.
    pub fn pending_endpoint(&self) -> BranchResult<&str> {
        match self.endpoint_id.as_deref() {
            Some(endpoint_id) => Ok(endpoint_id),
            None => Err(branch_error!(
                ErrorKind::MissingEndpoint,
                "No endpoint was created for the branch",
                format!("no endpoint created for branch {}", self.branch.id)
            )),
        }
    }
}

/// Typed access to the provider, every call retried on rate limits.
#[derive(Clone)]
pub struct ProviderClient {
    api: Arc<dyn NeonApi>,
    project_id: String,
    caller: RateLimitedCaller,
    operation_timeout: Duration,
    poll_interval: Duration,
}

impl ProviderClient {
    pub fn new(
        api: Arc<dyn NeonApi>,
        project_id: impl Into<String>,
        caller: RateLimitedCaller,
    ) -> Self {
        Self {
            api,
            project_id: project_id.into(),
            caller,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn caller(&self) -> &RateLimitedCaller {
        &self.caller
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn create_branch(
        &self,
        request: &CreateBranchRequest,
    ) -> BranchResult<CreatedBranch> {
        let response = self
            .caller
            .call("branch_create", || {
                self.api.create_branch(&self.project_id, request)
            })
            .await?;

        let endpoint_id = response
            .operations
            .iter()
            .find_map(|operation| operation.endpoint_id.clone());

        info!(
            branch_id = %response.branch.id,
            branch_name = %request.branch.name,
            endpoint_id = ?endpoint_id,
            "created branch"
        );

        Ok(CreatedBranch {
            branch: response.branch,
            endpoint_id,
        })
    }

    pub async fn endpoint_status(&self, endpoint_id: &str) -> BranchResult<EndpointDetails> {
        self.caller
            .call("endpoint_status", || {
                self.api.get_endpoint(&self.project_id, endpoint_id)
            })
            .await
    }

    /// Deletes a branch. Failures are logged and never returned.
    pub async fn delete_branch(&self, branch_id: &str) {
        let result = self
            .caller
            .call("branch_delete", || {
                self.api.delete_branch(&self.project_id, branch_id)
            })
            .await;

        match result {
            Ok(()) => info!(branch_id, "deleted branch"),
            Err(err) => warn!(branch_id, error = %err, "failed to delete branch"),
        }
    }

    /// Starts restoring `branch_id` to the current state of `parent_id`.
    ///
    /// Returns the ids of the operations performing the restore.
    pub async fn restore_to_parent(
        &self,
        branch_id: &str,
        parent_id: &str,
    ) -> BranchResult<Vec<String>> {
        let request = RestoreBranchRequest {
            source_branch_id: parent_id.to_string(),
        };
        let response = self
            .caller
            .call("branch_restore", || {
                self.api.restore_branch(&self.project_id, branch_id, &request)
            })
            .await?;

        Ok(operation_ids(&response.operations))
    }

    /// Waits until every operation in `operation_ids` completed.
    pub async fn poll_operations(&self, operation_ids: &[String]) -> BranchResult<()> {
        self.poll_operations_with(operation_ids, self.operation_timeout, self.poll_interval)
            .await
    }

    /// Waits until every operation in `operation_ids` completed, with explicit bounds.
    ///
    /// Finished, skipped and cancelled operations count as complete. A failed operation aborts
    /// the wait with [`ErrorKind::OperationFailed`].
    pub async fn poll_operations_with(
        &self,
        operation_ids: &[String],
        timeout: Duration,
        interval: Duration,
    ) -> BranchResult<()> {
        let mut pending: Vec<String> = operation_ids.to_vec();
        let mut waited = Duration::ZERO;

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());

            for operation_id in pending {
                let operation = self
                    .caller
                    .call("operation_status", || {
                        self.api.get_operation(&self.project_id, &operation_id)
                    })
                    .await?;

                if operation.status.is_failed() {
                    bail!(
                        ErrorKind::OperationFailed,
                        "Neon operation failed",
                        format!(
                            "operation {} {}: {}",
                            operation.id,
                            operation.status,
                            operation.error.as_deref().unwrap_or("no error reported")
                        )
                    );
                }

                if !operation.status.is_done() {
                    still_pending.push(operation_id);
                }
            }

            pending = still_pending;
            if pending.is_empty() {
                return Ok(());
            }

            if waited >= timeout {
                bail!(
                    ErrorKind::OperationTimeout,
                    "Timed out waiting for Neon operations",
                    format!(
                        "operations still pending after {:.1}s: {}",
                        timeout.as_secs_f64(),
                        pending.join(", ")
                    )
                );
            }

            debug!(pending = ?pending, "waiting for operations");

            self.caller.sleeper().sleep(interval).await;
            waited += interval;
        }
    }

    /// Returns the current password of `role` without rotating it.
    pub async fn reveal_password(&self, branch_id: &str, role: &str) -> BranchResult<String> {
        self.caller
            .call("role_password_reveal", || {
                self.api.reveal_role_password(&self.project_id, branch_id, role)
            })
            .await
    }

    /// Rotates the password of `role` and returns it once the change is applied.
    pub async fn reset_password(&self, branch_id: &str, role: &str) -> BranchResult<String> {
        let response = self
            .caller
            .call("role_password_reset", || {
                self.api.reset_role_password(&self.project_id, branch_id, role)
            })
            .await?;

        self.poll_operations(&operation_ids(&response.operations))
            .await?;

        Ok(response.role.password)
    }

    pub async fn list_branches(&self) -> BranchResult<Vec<BranchDetails>> {
        self.caller
            .call("list_branches", || self.api.list_branches(&self.project_id))
            .await
    }

    /// Returns the id of the project's default branch, if the provider flags one.
    pub async fn default_branch_id(&self) -> BranchResult<Option<String>> {
        let branches = self.list_branches().await?;

        Ok(branches
            .into_iter()
            .find(BranchDetails::is_default)
            .map(|branch| branch.id))
    }
}

/// Returns the ids of `operations`, without duplicates and in order.
fn operation_ids(operations: &[Operation]) -> Vec<String> {
    let mut seen = HashSet::new();

    operations
        .iter()
        .filter(|operation| seen.insert(operation.id.clone()))
        .map(|operation| operation.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use api::models::{OperationStatus, ResetPasswordResponse, RoleDetails};

    use super::*;
    use crate::test_utils::{MockNeonApi, RecordingSleeper, test_caller};

    fn provider(api: Arc<MockNeonApi>, sleeper: Arc<RecordingSleeper>) -> ProviderClient {
        ProviderClient::new(api, "proj-1", test_caller(sleeper))
    }

    #[tokio::test]
    async fn test_create_branch_picks_first_endpoint_operation() {
        let api = Arc::new(MockNeonApi::new());
        api.set_create_operations(vec![
            MockNeonApi::operation("op-1", OperationStatus::Running, None),
            MockNeonApi::operation("op-2", OperationStatus::Running, Some("ep-first")),
            MockNeonApi::operation("op-3", OperationStatus::Running, Some("ep-second")),
        ]);
        let provider = provider(api, Arc::new(RecordingSleeper::default()));

        let request = CreateBranchRequest::read_write("cargotest-1a2b", None, None);
        let created = provider.create_branch(&request).await.unwrap();

        assert_eq!(created.pending_endpoint().unwrap(), "ep-first");
    }

    #[tokio::test]
    async fn test_create_branch_without_endpoint() {
        let api = Arc::new(MockNeonApi::new());
        api.set_create_operations(vec![MockNeonApi::operation(
            "op-1",
            OperationStatus::Running,
            None,
        )]);
        let provider = provider(api, Arc::new(RecordingSleeper::default()));

        let request = CreateBranchRequest::read_write("cargotest-1a2b", None, None);
        let created = provider.create_branch(&request).await.unwrap();
        let err = created.pending_endpoint().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingEndpoint);
        assert!(err.detail().is_some_and(|d| d.contains(&created.branch.id)));
    }

    #[tokio::test]
    async fn test_poll_operations_until_done() {
        let api = Arc::new(MockNeonApi::new());
        api.script_operation(
            "op-1",
            vec![OperationStatus::Running, OperationStatus::Finished],
        );
        api.script_operation("op-2", vec![OperationStatus::Skipped]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let provider = provider(api, sleeper.clone());

        provider
            .poll_operations(&["op-1".to_string(), "op-2".to_string()])
            .await
            .unwrap();

        assert_eq!(sleeper.sleeps(), vec![DEFAULT_POLL_INTERVAL]);
    }

    #[tokio::test]
    async fn test_poll_operations_failure_carries_provider_text() {
        let api = Arc::new(MockNeonApi::new());
        api.script_operation_error("op-1", "compute start failed");
        let provider = provider(api, Arc::new(RecordingSleeper::default()));

        let err = provider
            .poll_operations(&["op-1".to_string()])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert!(err.detail().is_some_and(|d| d.contains("compute start failed")));
    }

    #[tokio::test]
    async fn test_poll_operations_timeout_names_pending() {
        let api = Arc::new(MockNeonApi::new());
        api.script_operation("op-slow", vec![OperationStatus::Running]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let provider = provider(api, sleeper.clone());

        let err = provider
            .poll_operations_with(
                &["op-slow".to_string()],
                Duration::from_secs(2),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::OperationTimeout);
        assert!(err.detail().is_some_and(|d| d.contains("op-slow")));
        assert_eq!(sleeper.sleeps().len(), 4);
    }

    #[tokio::test]
    async fn test_reset_password_waits_for_operations() {
        let api = Arc::new(MockNeonApi::new());
        api.set_reset_password_response(ResetPasswordResponse {
            role: RoleDetails {
                name: "neondb_owner".to_string(),
                password: "rotated".to_string(),
            },
            operations: vec![MockNeonApi::operation(
                "op-reset",
                OperationStatus::Running,
                None,
            )],
        });
        api.script_operation(
            "op-reset",
            vec![OperationStatus::Running, OperationStatus::Finished],
        );
        let provider = provider(api.clone(), Arc::new(RecordingSleeper::default()));

        let password = provider
            .reset_password("br-1", "neondb_owner")
            .await
            .unwrap();

        assert_eq!(password, "rotated");
        assert_eq!(api.count_calls("get_operation"), 2);
    }

    #[tokio::test]
    async fn test_default_branch_id() {
        let api = Arc::new(MockNeonApi::new());
        api.set_branches(vec![
            MockNeonApi::branch("br-dev", false),
            MockNeonApi::branch("br-main", true),
        ]);
        let provider = provider(api, Arc::new(RecordingSleeper::default()));

        assert_eq!(
            provider.default_branch_id().await.unwrap().as_deref(),
            Some("br-main")
        );
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed() {
        let api = Arc::new(MockNeonApi::new());
        api.fail_deletes();
        let provider = provider(api.clone(), Arc::new(RecordingSleeper::default()));

        provider.delete_branch("br-1").await;

        assert_eq!(api.count_calls("delete_branch"), 1);
    }

    #[test]
    fn test_operation_ids_are_deduplicated() {
        let operations = vec![
            MockNeonApi::operation("op-1", OperationStatus::Running, None),
            MockNeonApi::operation("op-2", OperationStatus::Running, None),
            MockNeonApi::operation("op-1", OperationStatus::Running, None),
        ];

        assert_eq!(operation_ids(&operations), vec!["op-1", "op-2"]);
    }
}
