//! Verification error types.
//!
//! Errors raised while provisioning or inspecting are converted into failed
//! scenario results by the runner. They never abort sibling scenarios.
//!
//! Retry policy by variant:
//! - `TransientApi`: retried by the inspector with backoff, then surfaced
//! - `Provisioning`: retried by the runner only when the message matches a
//!   configured retryable pattern
//! - everything else: never retried

use thiserror::Error;

/// Verification error type.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Bad input: missing working directory, empty variable set, invalid
    /// scenario declaration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The IaC tool failed, timed out, or was cancelled.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Throttling or network failure talking to the cloud API.
    #[error("Transient API error: {0}")]
    TransientApi(String),

    /// An identifier (resource or output) does not resolve.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A field path does not exist in the snapshot type.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The cloud API rejected the request for a non-retryable reason.
    #[error("Cloud API error: {0}")]
    CloudApi(String),

    /// Local I/O failure (reading declarations, writing reports).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VerifyError {
    /// Whether the inspector may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerifyError::TransientApi(_))
    }

    /// Short stable label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::Configuration(_) => "configuration",
            VerifyError::Provisioning(_) => "provisioning",
            VerifyError::TransientApi(_) => "transient_api",
            VerifyError::NotFound(_) => "not_found",
            VerifyError::SchemaMismatch(_) => "schema_mismatch",
            VerifyError::CloudApi(_) => "cloud_api",
            VerifyError::Io(_) => "io",
            VerifyError::Json(_) => "json",
        }
    }
}

/// Result type alias using `VerifyError`.
pub type Result<T> = std::result::Result<T, VerifyError>;
