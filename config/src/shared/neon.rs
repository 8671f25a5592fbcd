use std::time::Duration;

use secrecy::SecretString;

use crate::shared::{SharingPolicy, ValidationError};

/// Database name used in connection strings when none is configured.
pub const DEFAULT_DATABASE: &str = "neondb";

/// Role name used in connection strings when none is configured.
pub const DEFAULT_ROLE: &str = "neondb_owner";

/// Environment variable receiving the connection string when none is configured.
pub const DEFAULT_ENV_VAR: &str = "DATABASE_URL";

/// Branch expiry applied when none is configured, in seconds.
pub const DEFAULT_BRANCH_EXPIRY_SECS: u64 = 600;

/// Base URL of the Neon management API.
pub const DEFAULT_API_BASE_URL: &str = "https://console.neon.tech/api/v2";

/// Resolved, immutable settings for one test session.
///
/// Built by [`crate::load_neon_config`]. The API key is kept as a [`SecretString`] so that it is
/// redacted from debug output and logs.
#[derive(Debug, Clone)]
pub struct NeonConfig {
    /// Neon API key used as bearer token.
    pub api_key: SecretString,
    /// Project in which test branches are created.
    pub project_id: String,
    /// Branch from which test branches are forked, the project default branch when `None`.
    pub parent_branch_id: Option<String>,
    /// Database name placed in connection strings.
    pub database: String,
    /// Role name placed in connection strings.
    pub role: String,
    /// Keeps branches after the session instead of deleting them.
    pub keep_branches: bool,
    /// Absolute expiry applied to created branches, in seconds. `0` disables expiry.
    pub branch_expiry_secs: u64,
    /// Name of the environment variable receiving the connection string.
    pub env_var: String,
    /// Optional token included in generated branch names.
    pub branch_name_prefix: Option<String>,
    /// Sharing policy for branches across tests and workers.
    pub sharing: SharingPolicy,
    /// Base URL of the Neon management API.
    pub api_base_url: String,
}

impl NeonConfig {
    /// Creates a configuration with default values for everything but the credentials.
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::new(api_key.into()),
            project_id: project_id.into(),
            parent_branch_id: None,
            database: DEFAULT_DATABASE.to_string(),
            role: DEFAULT_ROLE.to_string(),
            keep_branches: false,
            branch_expiry_secs: DEFAULT_BRANCH_EXPIRY_SECS,
            env_var: DEFAULT_ENV_VAR.to_string(),
            branch_name_prefix: None,
            sharing: SharingPolicy::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }

    /// Returns the branch expiry as a [`Duration`], or `None` when expiry is disabled.
    pub fn branch_expiry(&self) -> Option<Duration> {
        (self.branch_expiry_secs > 0).then(|| Duration::from_secs(self.branch_expiry_secs))
    }

    /// Validates the [`NeonConfig`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.database.is_empty() {
            return Err(ValidationError::EmptyDatabase);
        }

        if self.role.is_empty() {
            return Err(ValidationError::EmptyRole);
        }

        if self.env_var.is_empty() {
            return Err(ValidationError::EmptyEnvVar);
        }

        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"))
        {
            return Err(ValidationError::InvalidApiBaseUrl(self.api_base_url.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NeonConfig::new("key", "proj");

        assert_eq!(config.database, "neondb");
        assert_eq!(config.role, "neondb_owner");
        assert_eq!(config.env_var, "DATABASE_URL");
        assert_eq!(config.branch_expiry(), Some(Duration::from_secs(600)));
        assert!(!config.keep_branches);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_expiry_disables_expiry() {
        let mut config = NeonConfig::new("key", "proj");
        config.branch_expiry_secs = 0;

        assert_eq!(config.branch_expiry(), None);
    }

    #[test]
    fn test_api_key_is_redacted() {
        let config = NeonConfig::new("super-secret-key", "proj");

        assert!(!format!("{config:?}").contains("super-secret-key"));
    }

    #[test]
    fn test_validate_rejects_relative_api_url() {
        let mut config = NeonConfig::new("key", "proj");
        config.api_base_url = "console.neon.tech".to_string();

        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidApiBaseUrl(
                "console.neon.tech".to_string()
            ))
        );
    }
}
