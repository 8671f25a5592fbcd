//! Request and response bodies of the Neon management API.
//!
//! Only the fields used by the workspace are modeled, unknown fields are ignored.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Body of `POST /projects/{project_id}/branches`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateBranchRequest {
    pub branch: BranchSpec,
    pub endpoints: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Absolute expiry in RFC 3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSpec {
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    ReadWrite,
    ReadOnly,
}

impl CreateBranchRequest {
    /// Creates a request for a branch with a single read-write endpoint.
    pub fn read_write(
        name: impl Into<String>,
        parent_id: Option<String>,
        expires_at: Option<String>,
    ) -> Self {
        Self {
            branch: BranchSpec {
                name: name.into(),
                parent_id,
                expires_at,
            },
            endpoints: vec![EndpointSpec {
                endpoint_type: EndpointType::ReadWrite,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BranchDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub primary: bool,
}

impl BranchDetails {
    /// Returns `true` for the project's default branch.
    ///
    /// Older projects flag it as `primary`, newer ones as `default`.
    pub fn is_default(&self) -> bool {
        self.default || self.primary
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateBranchResponse {
    pub branch: BranchDetails,
    #[serde(default)]
    pub endpoints: Vec<EndpointDetails>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListBranchesResponse {
    pub branches: Vec<BranchDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndpointResponse {
    pub endpoint: EndpointDetails,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndpointDetails {
    pub id: String,
    #[serde(default)]
    pub host: String,
    pub current_state: EndpointState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Init,
    Active,
    Idle,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            EndpointState::Init => "init",
            EndpointState::Active => "active",
            EndpointState::Idle => "idle",
            EndpointState::Unknown => "unknown",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RevealPasswordResponse {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResetPasswordResponse {
    pub role: RoleDetails,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoleDetails {
    #[serde(default)]
    pub name: String,
    pub password: String,
}

/// Body of `POST /projects/{project_id}/branches/{branch_id}/restore`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreBranchRequest {
    pub source_branch_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestoreBranchResponse {
    #[serde(default)]
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationResponse {
    pub operation: Operation,
}

/// Asynchronous provider-side work started by a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub action: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Scheduling,
    Running,
    Finished,
    Failed,
    Error,
    Cancelling,
    Cancelled,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl OperationStatus {
    /// Returns `true` when the operation completed and needs no more waiting.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            OperationStatus::Finished | OperationStatus::Skipped | OperationStatus::Cancelled
        )
    }

    /// Returns `true` when the operation completed unsuccessfully.
    pub fn is_failed(&self) -> bool {
        matches!(self, OperationStatus::Failed | OperationStatus::Error)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            OperationStatus::Scheduling => "scheduling",
            OperationStatus::Running => "running",
            OperationStatus::Finished => "finished",
            OperationStatus::Failed => "failed",
            OperationStatus::Error => "error",
            OperationStatus::Cancelling => "cancelling",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Skipped => "skipped",
            OperationStatus::Unknown => "unknown",
        };
        f.write_str(status)
    }
}
