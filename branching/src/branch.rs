use std::fmt;

use serde::{Deserialize, Serialize};

/// A provisioned branch, ready to accept connections.
///
/// Serialized as JSON to share it between worker processes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    branch_id: String,
    project_id: String,
    connection_string: String,
    host: String,
    parent_id: Option<String>,
    endpoint_id: Option<String>,
}

impl Branch {
    pub fn new(
        branch_id: impl Into<String>,
        project_id: impl Into<String>,
        connection_string: impl Into<String>,
        host: impl Into<String>,
        parent_id: Option<String>,
        endpoint_id: Option<String>,
    ) -> Self {
        Self {
            branch_id: branch_id.into(),
            project_id: project_id.into(),
            connection_string: connection_string.into(),
            host: host.into(),
            parent_id,
            endpoint_id,
        }
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Returns the `postgresql://` URL of the branch, including its password.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the branch this one was forked from. Required to reset the branch.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.endpoint_id.as_deref()
    }
}

// The connection string embeds the password, keep it out of logs.
impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("branch_id", &self.branch_id)
            .field("project_id", &self.project_id)
            .field("connection_string", &"REDACTED")
            .field("host", &self.host)
            .field("parent_id", &self.parent_id)
            .field("endpoint_id", &self.endpoint_id)
            .finish()
    }
}
