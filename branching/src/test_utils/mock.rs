use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use api::models::{
    BranchDetails, CreateBranchRequest, CreateBranchResponse, EndpointDetails, EndpointState,
    Operation, OperationStatus, ResetPasswordResponse, RestoreBranchRequest,
    RestoreBranchResponse, RoleDetails,
};
use api::{ApiError, NeonApi};
use async_trait::async_trait;

/// Project id expected by [`MockNeonApi`].
pub const MOCK_PROJECT_ID: &str = "proj-test";

/// Id of the default branch listed by [`MockNeonApi`].
pub const MOCK_DEFAULT_BRANCH_ID: &str = "br-default";

/// Host reported for every endpoint of [`MockNeonApi`].
pub const MOCK_HOST: &str = "ep.region.neon.tech";

/// Password revealed for every role of [`MockNeonApi`].
pub const MOCK_PASSWORD: &str = "secret";

/// A call received by [`MockNeonApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub method: &'static str,
    pub args: Vec<String>,
}

/// Failure injected into a [`MockNeonApi`] method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// A 429 response without `Retry-After`.
    RateLimited,
    /// A non-success response with the given status.
    Status(u16),
}

impl MockFailure {
    fn into_error(self) -> ApiError {
        match self {
            MockFailure::RateLimited => ApiError::Status {
                status: 429,
                retry_after: None,
                body: "too many requests".to_string(),
            },
            MockFailure::Status(status) => ApiError::Status {
                status,
                retry_after: None,
                body: format!("mock failure with status {status}"),
            },
        }
    }
}

#[derive(Debug)]
struct ScriptedOperation {
    statuses: VecDeque<OperationStatus>,
    error: Option<String>,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<ApiCall>,
    created: u32,
    created_branch_id: Option<String>,
    create_operations: Option<Vec<Operation>>,
    endpoints: HashMap<String, VecDeque<EndpointState>>,
    operations: HashMap<String, ScriptedOperation>,
    password: String,
    reset_password_response: Option<ResetPasswordResponse>,
    restore_operations: Vec<Operation>,
    branches: Vec<BranchDetails>,
    failures: HashMap<&'static str, VecDeque<MockFailure>>,
    persistent_failures: HashMap<&'static str, MockFailure>,
}

/// Scripted in-memory [`NeonApi`].
///
/// Without scripting, created branches get ids `br-created-{n}` with an endpoint `ep-{n}` that
/// is immediately active, operations are finished and the project default branch is
/// [`MOCK_DEFAULT_BRANCH_ID`].
#[derive(Debug)]
pub struct MockNeonApi {
    state: Mutex<MockState>,
}

impl Default for MockNeonApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNeonApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                created: 0,
                created_branch_id: None,
                create_operations: None,
                endpoints: HashMap::new(),
                operations: HashMap::new(),
                password: MOCK_PASSWORD.to_string(),
                reset_password_response: None,
                restore_operations: vec![Self::operation(
                    "op-restore",
                    OperationStatus::Finished,
                    None,
                )],
                branches: vec![Self::branch(MOCK_DEFAULT_BRANCH_ID, true)],
                failures: HashMap::new(),
                persistent_failures: HashMap::new(),
            }),
        }
    }

    /// Builds an operation.
    pub fn operation(id: &str, status: OperationStatus, endpoint_id: Option<&str>) -> Operation {
        Operation {
            id: id.to_string(),
            action: String::new(),
            status,
            endpoint_id: endpoint_id.map(str::to_string),
            error: None,
        }
    }

    /// Builds a branch listing entry.
    pub fn branch(id: &str, default: bool) -> BranchDetails {
        BranchDetails {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: None,
            default,
            primary: false,
        }
    }

    /// Returns every call received so far, in order.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns the methods called so far, in order.
    pub fn call_names(&self) -> Vec<&'static str> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|call| call.method)
            .collect()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Makes the next created branch use `branch_id`.
    pub fn set_created_branch_id(&self, branch_id: &str) {
        self.state.lock().unwrap().created_branch_id = Some(branch_id.to_string());
    }

    /// Replaces the operations returned when creating branches.
    pub fn set_create_operations(&self, operations: Vec<Operation>) {
        self.state.lock().unwrap().create_operations = Some(operations);
    }

    /// Scripts the states reported for `endpoint_id`, the last one repeating.
    pub fn script_endpoint(&self, endpoint_id: &str, states: Vec<EndpointState>) {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .insert(endpoint_id.to_string(), states.into());
    }

    /// Scripts the statuses reported for `operation_id`, the last one repeating.
    pub fn script_operation(&self, operation_id: &str, statuses: Vec<OperationStatus>) {
        self.state.lock().unwrap().operations.insert(
            operation_id.to_string(),
            ScriptedOperation {
                statuses: statuses.into(),
                error: None,
            },
        );
    }

    /// Makes `operation_id` fail with `error`.
    pub fn script_operation_error(&self, operation_id: &str, error: &str) {
        self.state.lock().unwrap().operations.insert(
            operation_id.to_string(),
            ScriptedOperation {
                statuses: VecDeque::from([OperationStatus::Failed]),
                error: Some(error.to_string()),
            },
        );
    }

    pub fn set_password(&self, password: &str) {
        self.state.lock().unwrap().password = password.to_string();
    }

    pub fn set_reset_password_response(&self, response: ResetPasswordResponse) {
        self.state.lock().unwrap().reset_password_response = Some(response);
    }

    pub fn set_restore_operations(&self, operations: Vec<Operation>) {
        self.state.lock().unwrap().restore_operations = operations;
    }

    pub fn set_branches(&self, branches: Vec<BranchDetails>) {
        self.state.lock().unwrap().branches = branches;
    }

    /// Makes the next calls of `method` fail, one failure per call.
    pub fn fail_next(&self, method: &'static str, failures: Vec<MockFailure>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(method)
            .or_default()
            .extend(failures);
    }

    /// Makes every call of `method` fail.
    pub fn fail_always(&self, method: &'static str, failure: MockFailure) {
        self.state
            .lock()
            .unwrap()
            .persistent_failures
            .insert(method, failure);
    }

    /// Makes every branch deletion fail.
    pub fn fail_deletes(&self) {
        self.fail_always("delete_branch", MockFailure::Status(500));
    }

    fn record(&self, method: &'static str, args: &[&str]) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall {
            method,
            args: args.iter().map(|arg| arg.to_string()).collect(),
        });

        if let Some(failure) = state
            .failures
            .get_mut(method)
            .and_then(|failures| failures.pop_front())
        {
            return Err(failure.into_error());
        }

        if let Some(failure) = state.persistent_failures.get(method) {
            return Err(failure.clone().into_error());
        }

        Ok(())
    }
}

fn next_scripted<T: Copy>(queue: &mut VecDeque<T>, default: T) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(default)
    } else {
        queue.front().copied().unwrap_or(default)
    }
}

#[async_trait]
impl NeonApi for MockNeonApi {
    async fn create_branch(
        &self,
        project_id: &str,
        request: &CreateBranchRequest,
    ) -> Result<CreateBranchResponse, ApiError> {
        self.record(
            "create_branch",
            &[
                project_id,
                &request.branch.name,
                request.branch.parent_id.as_deref().unwrap_or(""),
                request.branch.expires_at.as_deref().unwrap_or(""),
            ],
        )?;

        let mut state = self.state.lock().unwrap();
        state.created += 1;
        let n = state.created;

        let branch_id = state
            .created_branch_id
            .take()
            .unwrap_or_else(|| format!("br-created-{n}"));
        let operations = state.create_operations.clone().unwrap_or_else(|| {
            vec![Self::operation(
                &format!("op-create-{n}"),
                OperationStatus::Finished,
                Some(&format!("ep-{n}")),
            )]
        });
        let parent_id = request
            .branch
            .parent_id
            .clone()
            .or_else(|| Some(MOCK_DEFAULT_BRANCH_ID.to_string()));

        state.branches.push(BranchDetails {
            id: branch_id.clone(),
            name: request.branch.name.clone(),
            parent_id: parent_id.clone(),
            default: false,
            primary: false,
        });

        Ok(CreateBranchResponse {
            branch: BranchDetails {
                id: branch_id,
                name: request.branch.name.clone(),
                parent_id,
                default: false,
                primary: false,
            },
            endpoints: Vec::new(),
            operations,
        })
    }

    async fn get_endpoint(
        &self,
        project_id: &str,
        endpoint_id: &str,
    ) -> Result<EndpointDetails, ApiError> {
        self.record("get_endpoint", &[project_id, endpoint_id])?;

        let mut state = self.state.lock().unwrap();
        let current_state = match state.endpoints.get_mut(endpoint_id) {
            Some(states) => next_scripted(states, EndpointState::Active),
            None => EndpointState::Active,
        };

        Ok(EndpointDetails {
            id: endpoint_id.to_string(),
            host: MOCK_HOST.to_string(),
            current_state,
        })
    }

    async fn reveal_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<String, ApiError> {
        self.record("reveal_role_password", &[project_id, branch_id, role])?;

        Ok(self.state.lock().unwrap().password.clone())
    }

    async fn reset_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<ResetPasswordResponse, ApiError> {
        self.record("reset_role_password", &[project_id, branch_id, role])?;

        let state = self.state.lock().unwrap();
        Ok(state
            .reset_password_response
            .clone()
            .unwrap_or_else(|| ResetPasswordResponse {
                role: RoleDetails {
                    name: role.to_string(),
                    password: state.password.clone(),
                },
                operations: Vec::new(),
            }))
    }

    async fn restore_branch(
        &self,
        project_id: &str,
        branch_id: &str,
        request: &RestoreBranchRequest,
    ) -> Result<RestoreBranchResponse, ApiError> {
        self.record(
            "restore_branch",
            &[project_id, branch_id, &request.source_branch_id],
        )?;

        Ok(RestoreBranchResponse {
            operations: self.state.lock().unwrap().restore_operations.clone(),
        })
    }

    async fn get_operation(
        &self,
        project_id: &str,
        operation_id: &str,
    ) -> Result<Operation, ApiError> {
        self.record("get_operation", &[project_id, operation_id])?;

        let mut state = self.state.lock().unwrap();
        let (status, error) = match state.operations.get_mut(operation_id) {
            Some(scripted) => (
                next_scripted(&mut scripted.statuses, OperationStatus::Finished),
                scripted.error.clone(),
            ),
            None => (OperationStatus::Finished, None),
        };

        Ok(Operation {
            id: operation_id.to_string(),
            action: String::new(),
            status,
            endpoint_id: None,
            error,
        })
    }

    async fn list_branches(&self, project_id: &str) -> Result<Vec<BranchDetails>, ApiError> {
        self.record("list_branches", &[project_id])?;

        Ok(self.state.lock().unwrap().branches.clone())
    }

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<(), ApiError> {
        self.record("delete_branch", &[project_id, branch_id])?;

        self.state
            .lock()
            .unwrap()
            .branches
            .retain(|branch| branch.id != branch_id);

        Ok(())
    }
}
