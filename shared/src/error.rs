//! Error types for the loader and web apps.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving requests or calling Google APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Required environment value missing or malformed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential acquisition failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Upstream API answered with a non-success status
    #[error("{service} error ({status}): {message}")]
    Remote {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// An attempt exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The owning session went away mid-call
    #[error("Request cancelled")]
    Cancelled,

    /// Upstream response was missing expected fields
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_)
            | Error::Remote { .. }
            | Error::MalformedResponse(_)
            | Error::Http(_) => 502,
            Error::Timeout(_) => 504,
            Error::Cancelled => 503,
            _ => 500,
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Network failures, timeouts, rate limiting and server-side errors are
    /// transient; everything else is reported straight away.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Timeout(_) => true,
            Error::Remote { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Validation(errors.to_string())
    }
}
