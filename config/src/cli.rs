use clap::Args;

use crate::shared::SharingPolicy;

/// Command line overrides for the Neon settings.
///
/// Values given here take precedence over environment variables, the ini file and defaults.
/// The struct can be flattened into the argument parser of a custom test harness.
#[derive(Debug, Clone, Default, Args)]
#[command(next_help_heading = "Neon database branching")]
pub struct CliOverrides {
    /// Neon API key (default: NEON_API_KEY env var).
    #[arg(long = "neon-api-key")]
    pub api_key: Option<String>,
    /// Neon project ID (default: NEON_PROJECT_ID env var).
    #[arg(long = "neon-project-id")]
    pub project_id: Option<String>,
    /// Parent branch ID to create test branches from (default: project default branch).
    #[arg(long = "neon-parent-branch")]
    pub parent_branch_id: Option<String>,
    /// Database name (default: neondb).
    #[arg(long = "neon-database")]
    pub database: Option<String>,
    /// Database role (default: neondb_owner).
    #[arg(long = "neon-role")]
    pub role: Option<String>,
    /// Don't delete branches after tests (useful for debugging).
    #[arg(long = "neon-keep-branches")]
    pub keep_branches: bool,
    /// Branch auto-expiry in seconds (default: 600). Set to 0 to disable.
    #[arg(long = "neon-branch-expiry")]
    pub branch_expiry_secs: Option<u64>,
    /// Environment variable to set with the connection string (default: DATABASE_URL).
    #[arg(long = "neon-env-var")]
    pub env_var: Option<String>,
    /// Token included in generated branch names.
    #[arg(long = "neon-branch-name-prefix")]
    pub branch_name_prefix: Option<String>,
    /// Branch sharing policy across tests and workers (default: session).
    #[arg(long = "neon-sharing", value_enum)]
    pub sharing: Option<SharingPolicy>,
}
