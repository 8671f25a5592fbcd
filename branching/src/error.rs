//! Error types and result definitions for branch provisioning.
//!
//! [`BranchError`] carries an [`ErrorKind`] for programmatic handling, a static description,
//! an optional dynamic detail, the originating error and the location where it was raised.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use api::ApiError;
use config::LoadConfigError;
use postgres::driver::DriverError;

/// Convenient result type for branch provisioning using [`BranchError`] as the error type.
pub type BranchResult<T> = Result<T, BranchError>;

/// Main error type for branch provisioning.
#[derive(Debug, Clone)]
pub struct BranchError {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
}

/// Categories of failures that can occur while provisioning branches.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration Errors
    ConfigurationMissing,
    ConfigError,

    // Provider Errors
    RateLimitExhausted,
    ProviderRequestFailed,
    MissingEndpoint,
    EndpointTimeout,
    OperationFailed,
    OperationTimeout,

    // Lifecycle Errors
    SafetyViolation,
    MissingParent,
    ResetFailed,
    InvalidState,

    // Coordination Errors
    SignalTimeout,
    CoordinationIo,
    SerializationError,
    DeserializationError,

    // Migration & Database Errors
    MigrationFailed,
    SchemaInspectionFailed,
    DriverUnavailable,
}

impl BranchError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        BranchError {
            kind,
            description,
            detail,
            source,
            location: Location::caller(),
        }
    }
}

impl PartialEq for BranchError {
    fn eq(&self, other: &BranchError) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Display for BranchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            self.kind,
            self.description,
            self.location.file(),
            self.location.line(),
            self.location.column()
        )?;

        if let Some(detail) = self.detail.as_deref() {
            if detail.trim().is_empty() {
                write!(f, "\n  Detail: <empty>")?;
            } else {
                write!(f, "\n  Detail:")?;
                for line in detail.lines() {
                    write!(f, "\n    {line}")?;
                }
            }
        }

        Ok(())
    }
}

impl error::Error for BranchError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

/// Creates a [`BranchError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for BranchError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> BranchError {
        BranchError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`BranchError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for BranchError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> BranchError {
        BranchError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Converts [`std::io::Error`] to [`BranchError`] with [`ErrorKind::CoordinationIo`].
///
/// The filesystem is only touched by worker coordination.
impl From<std::io::Error> for BranchError {
    #[track_caller]
    fn from(err: std::io::Error) -> BranchError {
        let detail = err.to_string();
        BranchError::from_components(
            ErrorKind::CoordinationIo,
            Cow::Borrowed("Coordination file operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`BranchError`] with the appropriate error kind.
impl From<serde_json::Error> for BranchError {
    #[track_caller]
    fn from(err: serde_json::Error) -> BranchError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => {
                (ErrorKind::CoordinationIo, "JSON I/O operation failed")
            }
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        BranchError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`ApiError`] to [`BranchError`] with the appropriate error kind.
///
/// Callers going through the rate-limited caller never see rate limit errors converted here,
/// they are either retried or reported as [`ErrorKind::RateLimitExhausted`].
impl From<ApiError> for BranchError {
    #[track_caller]
    fn from(err: ApiError) -> BranchError {
        let kind = if err.is_rate_limited() {
            ErrorKind::RateLimitExhausted
        } else {
            ErrorKind::ProviderRequestFailed
        };

        let detail = err.to_string();
        BranchError::from_components(
            kind,
            Cow::Borrowed("Neon API request failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`LoadConfigError`] to [`BranchError`] with [`ErrorKind::ConfigError`].
impl From<LoadConfigError> for BranchError {
    #[track_caller]
    fn from(err: LoadConfigError) -> BranchError {
        let detail = err.to_string();
        BranchError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Loading the Neon configuration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`DriverError`] to [`BranchError`] with the appropriate error kind.
impl From<DriverError> for BranchError {
    #[track_caller]
    fn from(err: DriverError) -> BranchError {
        let (kind, description) = match err {
            DriverError::MissingDriver => {
                (ErrorKind::DriverUnavailable, "No database driver is available")
            }
            #[allow(unreachable_patterns)]
            _ => (
                ErrorKind::SchemaInspectionFailed,
                "Database operation failed",
            ),
        };

        let detail = err.to_string();
        BranchError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`tokio::task::JoinError`] from blocking coordination work.
impl From<tokio::task::JoinError> for BranchError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> BranchError {
        let detail = err.to_string();
        BranchError::from_components(
            ErrorKind::CoordinationIo,
            Cow::Borrowed("Blocking coordination task failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
