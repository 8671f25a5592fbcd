use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The database name used in connection strings cannot be empty.
    #[error("`database` cannot be empty")]
    EmptyDatabase,
    /// The role name used in connection strings cannot be empty.
    #[error("`role` cannot be empty")]
    EmptyRole,
    /// The name of the environment variable receiving the connection string cannot be empty.
    #[error("`env_var` cannot be empty")]
    EmptyEnvVar,
    /// The Neon API base URL must be an absolute http(s) URL.
    #[error("Invalid `api_base_url` `{0}`: expected an absolute http(s) URL")]
    InvalidApiBaseUrl(String),
}
