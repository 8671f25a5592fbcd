use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use rust_cli_config::{ConfigError, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::cli::CliOverrides;
use crate::shared::{
    DEFAULT_API_BASE_URL, DEFAULT_BRANCH_EXPIRY_SECS, DEFAULT_DATABASE, DEFAULT_ENV_VAR,
    DEFAULT_ROLE, NeonConfig, SharingPolicy, ValidationError,
};

/// Name of the environment variable pointing to an explicit ini file.
pub const CONFIG_FILE_ENV_NAME: &str = "NEON_CONFIG_FILE";

/// Ini file looked up in the working directory when [`CONFIG_FILE_ENV_NAME`] is not set.
pub const DEFAULT_CONFIG_FILE: &str = "neon.ini";

/// Environment variables that can provide a setting, with the setting key they map to.
///
/// Settings missing from this table can only come from CLI overrides, the ini file or defaults.
const ENV_VAR_KEYS: &[(&str, &str)] = &[
    ("NEON_API_KEY", "api_key"),
    ("NEON_PROJECT_ID", "project_id"),
    ("NEON_PARENT_BRANCH_ID", "parent_branch_id"),
    ("NEON_DATABASE", "database"),
    ("NEON_ROLE", "role"),
    ("NEON_BRANCH_NAME_PREFIX", "branch_name_prefix"),
];

/// Errors that can occur while resolving the Neon settings.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// An explicitly requested ini file does not exist.
    #[error("configuration file `{0}` does not exist")]
    ConfigurationFileMissing(PathBuf),

    /// The ini file existed but could not be parsed.
    #[error("failed to load configuration from `{path}`: {source}")]
    ConfigurationFileLoad {
        path: PathBuf,
        source: ConfigError,
    },

    /// Failed to register defaults or overrides on the configuration builder.
    #[error("failed to initialize configuration builder: {0}")]
    Builder(#[source] ConfigError),

    /// The sources were merged but deserialization failed.
    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] ConfigError),

    /// The resolved configuration is invalid.
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

/// Where the settings are read from.
///
/// [`ConfigSources::from_process`] captures the real process environment, while
/// [`ConfigSources::new`] starts empty so tests can describe every source explicitly.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    overrides: CliOverrides,
    ini_file: Option<IniFile>,
    env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct IniFile {
    path: PathBuf,
    required: bool,
}

impl ConfigSources {
    /// Creates sources holding only the given CLI overrides.
    pub fn new(overrides: CliOverrides) -> Self {
        Self {
            overrides,
            ini_file: None,
            env: HashMap::new(),
        }
    }

    /// Creates sources from the current process.
    ///
    /// The ini file is taken from [`CONFIG_FILE_ENV_NAME`] when set (and must then exist),
    /// otherwise [`DEFAULT_CONFIG_FILE`] is used if present in the working directory.
    pub fn from_process(overrides: CliOverrides) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();

        let ini_file = match env.get(CONFIG_FILE_ENV_NAME) {
            Some(path) if !path.is_empty() => Some(IniFile {
                path: PathBuf::from(path),
                required: true,
            }),
            _ => Some(IniFile {
                path: PathBuf::from(DEFAULT_CONFIG_FILE),
                required: false,
            }),
        };

        Self {
            overrides,
            ini_file,
            env,
        }
    }

    /// Uses `path` as a required ini file.
    pub fn with_ini_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ini_file = Some(IniFile {
            path: path.as_ref().to_path_buf(),
            required: true,
        });
        self
    }

    /// Adds an environment variable to the sources.
    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

/// Raw settings as produced by the merged sources, before validation.
#[derive(Debug, Deserialize)]
struct RawNeonSettings {
    api_key: Option<String>,
    project_id: Option<String>,
    parent_branch_id: Option<String>,
    database: String,
    role: String,
    keep_branches: bool,
    branch_expiry_secs: u64,
    env_var: String,
    branch_name_prefix: Option<String>,
    sharing: SharingPolicy,
    api_base_url: String,
}

/// Resolves the Neon settings from `sources`.
///
/// Precedence, highest first: CLI override, environment variable, ini file, default.
///
/// Returns `Ok(None)` when the API key or the project id is missing (or empty), which callers
/// treat as "skip everything that needs a branch" rather than as a failure.
pub fn load_neon_config(sources: &ConfigSources) -> Result<Option<NeonConfig>, LoadConfigError> {
    let mut builder = defaults()?;

    if let Some(ini_file) = &sources.ini_file {
        if ini_file.required && !ini_file.path.is_file() {
            return Err(LoadConfigError::ConfigurationFileMissing(
                ini_file.path.clone(),
            ));
        }

        builder = builder.add_source(
            File::from(ini_file.path.clone())
                .format(FileFormat::Ini)
                .required(ini_file.required),
        );
        validate_configuration_source(&builder, &ini_file.path)?;
    }

    let env_settings = ENV_VAR_KEYS
        .iter()
        .filter_map(|(env_name, key)| {
            sources
                .env
                .get(*env_name)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect::<HashMap<_, _>>();
    builder = builder.add_source(
        Environment::default().source(Some(env_settings.into_iter().collect())),
    );

    let settings = apply_overrides(builder, &sources.overrides)?
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize::<RawNeonSettings>()
        .map_err(LoadConfigError::Deserialization)?;

    let Some(api_key) = non_empty(settings.api_key) else {
        return Ok(None);
    };
    let Some(project_id) = non_empty(settings.project_id) else {
        return Ok(None);
    };

    let config = NeonConfig {
        api_key: SecretString::new(api_key),
        project_id,
        parent_branch_id: non_empty(settings.parent_branch_id),
        database: settings.database,
        role: settings.role,
        keep_branches: settings.keep_branches,
        branch_expiry_secs: settings.branch_expiry_secs,
        env_var: settings.env_var,
        branch_name_prefix: non_empty(settings.branch_name_prefix),
        sharing: settings.sharing,
        api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
    };
    config.validate()?;

    Ok(Some(config))
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    rust_cli_config::Config::builder()
        .set_default("database", DEFAULT_DATABASE)
        .and_then(|b| b.set_default("role", DEFAULT_ROLE))
        .and_then(|b| b.set_default("keep_branches", false))
        .and_then(|b| b.set_default("branch_expiry_secs", DEFAULT_BRANCH_EXPIRY_SECS.to_string()))
        .and_then(|b| b.set_default("env_var", DEFAULT_ENV_VAR))
        .and_then(|b| b.set_default("sharing", SharingPolicy::default().as_str()))
        .and_then(|b| b.set_default("api_base_url", DEFAULT_API_BASE_URL))
        .map_err(LoadConfigError::Builder)
}

fn apply_overrides(
    builder: ConfigBuilder<DefaultState>,
    overrides: &CliOverrides,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    builder
        .set_override_option("api_key", overrides.api_key.clone())
        .and_then(|b| b.set_override_option("project_id", overrides.project_id.clone()))
        .and_then(|b| {
            b.set_override_option("parent_branch_id", overrides.parent_branch_id.clone())
        })
        .and_then(|b| b.set_override_option("database", overrides.database.clone()))
        .and_then(|b| b.set_override_option("role", overrides.role.clone()))
        // The flag can only switch keeping on, its absence must not mask the ini file.
        .and_then(|b| {
            b.set_override_option("keep_branches", overrides.keep_branches.then_some(true))
        })
        .and_then(|b| {
            b.set_override_option(
                "branch_expiry_secs",
                overrides.branch_expiry_secs.map(|secs| secs.to_string()),
            )
        })
        .and_then(|b| b.set_override_option("env_var", overrides.env_var.clone()))
        .and_then(|b| {
            b.set_override_option("branch_name_prefix", overrides.branch_name_prefix.clone())
        })
        .and_then(|b| b.set_override_option("sharing", overrides.sharing.map(|s| s.as_str())))
        .map_err(LoadConfigError::Builder)
}

fn validate_configuration_source(
    builder: &ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<(), LoadConfigError> {
    builder
        .clone()
        .build()
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            path: path.to_path_buf(),
            source,
        })
        .map(|_| ())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
