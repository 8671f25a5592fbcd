use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ApiError, parse_retry_after};
use crate::models::{
    BranchDetails, CreateBranchRequest, CreateBranchResponse, EndpointDetails, EndpointResponse,
    ListBranchesResponse, Operation, OperationResponse, ResetPasswordResponse,
    RestoreBranchRequest, RestoreBranchResponse, RevealPasswordResponse,
};

/// Timeout applied to every request sent to the Neon API.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations of the Neon management API needed to provision test branches.
#[async_trait]
pub trait NeonApi: Send + Sync {
    async fn create_branch(
        &self,
        project_id: &str,
        request: &CreateBranchRequest,
    ) -> Result<CreateBranchResponse, ApiError>;

    async fn get_endpoint(
        &self,
        project_id: &str,
        endpoint_id: &str,
    ) -> Result<EndpointDetails, ApiError>;

    /// Returns the current password of `role` without rotating it.
    async fn reveal_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<String, ApiError>;

    /// Rotates the password of `role`, the returned operations apply the change.
    async fn reset_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<ResetPasswordResponse, ApiError>;

    async fn restore_branch(
        &self,
        project_id: &str,
        branch_id: &str,
        request: &RestoreBranchRequest,
    ) -> Result<RestoreBranchResponse, ApiError>;

    async fn get_operation(
        &self,
        project_id: &str,
        operation_id: &str,
    ) -> Result<Operation, ApiError>;

    async fn list_branches(&self, project_id: &str) -> Result<Vec<BranchDetails>, ApiError>;

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<(), ApiError>;
}

/// [`NeonApi`] implementation talking JSON over HTTPS with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpNeonClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpNeonClient {
    /// Creates a client for the API rooted at `base_url`, e.g. `https://console.neon.tech/api/v2`.
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let url = response.url().path().to_string();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        warn!(
            status = %status,
            path = %url,
            body = %body,
            "Neon API request failed"
        );

        Err(ApiError::Status {
            status: status.as_u16(),
            retry_after,
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;

        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl NeonApi for HttpNeonClient {
    async fn create_branch(
        &self,
        project_id: &str,
        request: &CreateBranchRequest,
    ) -> Result<CreateBranchResponse, ApiError> {
        debug!(project_id, branch_name = %request.branch.name, "creating branch");

        let builder = self
            .request(Method::POST, &format!("/projects/{project_id}/branches"))
            .json(request);
        self.send_json(builder).await
    }

    async fn get_endpoint(
        &self,
        project_id: &str,
        endpoint_id: &str,
    ) -> Result<EndpointDetails, ApiError> {
        let builder = self.request(
            Method::GET,
            &format!("/projects/{project_id}/endpoints/{endpoint_id}"),
        );
        let response: EndpointResponse = self.send_json(builder).await?;

        Ok(response.endpoint)
    }

    async fn reveal_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<String, ApiError> {
        let builder = self.request(
            Method::GET,
            &format!("/projects/{project_id}/branches/{branch_id}/roles/{role}/reveal_password"),
        );
        let response: RevealPasswordResponse = self.send_json(builder).await?;

        Ok(response.password)
    }

    async fn reset_role_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<ResetPasswordResponse, ApiError> {
        let builder = self.request(
            Method::POST,
            &format!("/projects/{project_id}/branches/{branch_id}/roles/{role}/reset_password"),
        );
        self.send_json(builder).await
    }

    async fn restore_branch(
        &self,
        project_id: &str,
        branch_id: &str,
        request: &RestoreBranchRequest,
    ) -> Result<RestoreBranchResponse, ApiError> {
        let builder = self
            .request(
                Method::POST,
                &format!("/projects/{project_id}/branches/{branch_id}/restore"),
            )
            .json(request);
        self.send_json(builder).await
    }

    async fn get_operation(
        &self,
        project_id: &str,
        operation_id: &str,
    ) -> Result<Operation, ApiError> {
        let builder = self.request(
            Method::GET,
            &format!("/projects/{project_id}/operations/{operation_id}"),
        );
        let response: OperationResponse = self.send_json(builder).await?;

        Ok(response.operation)
    }

    async fn list_branches(&self, project_id: &str) -> Result<Vec<BranchDetails>, ApiError> {
        let builder = self.request(Method::GET, &format!("/projects/{project_id}/branches"));
        let response: ListBranchesResponse = self.send_json(builder).await?;

        Ok(response.branches)
    }

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<(), ApiError> {
        debug!(project_id, branch_id, "deleting branch");

        let builder = self.request(
            Method::DELETE,
            &format!("/projects/{project_id}/branches/{branch_id}"),
        );
        self.send(builder).await?;

        Ok(())
    }
}
