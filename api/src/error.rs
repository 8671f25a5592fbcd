use thiserror::Error;

/// Message fragments that identify a rate limit in opaque provider messages.
const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate limit", "too many requests"];

#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered with a non-success status.
    #[error("Neon API returned status {status}: {body}")]
    Status {
        status: u16,
        /// Value of the `Retry-After` header in seconds, when present and numeric.
        retry_after: Option<f64>,
        body: String,
    },

    #[error("An error occurred while sending a request to the Neon API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("An error occurred while decoding a Neon API response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Failure reported by another client implementation as a bare message.
    ///
    /// Only the message is known, so rate limits are recognized by text.
    #[error("{0}")]
    Provider(String),
}

impl ApiError {
    /// Returns `true` when the provider rejected the request because of its rate limit.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429,
            ApiError::Provider(message) => {
                let message = message.to_lowercase();
                RATE_LIMIT_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            ApiError::Transport(err) => err.status().is_some_and(|status| status.as_u16() == 429),
            ApiError::Decode(_) => false,
        }
    }

    /// Returns the delay in seconds suggested by the provider before retrying.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            ApiError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Parses a `Retry-After` header value expressed in seconds.
///
/// HTTP dates are not supported and yield `None`, as do non-finite values. Negative hints are
/// kept, the caller applies its own floor.
pub fn parse_retry_after(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite())
}
