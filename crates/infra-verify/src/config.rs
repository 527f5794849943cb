//! Runner configuration.
//!
//! Configuration is loaded from environment variables with defaults. Values
//! are constructed once and copied into every scenario; nothing here is
//! shared mutable state.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default IaC tool binary.
pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";

/// Default cloud CLI binary.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Default region when neither the scenario nor its variables name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default number of scenarios running at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Default maximum attempts for a cloud read (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first backoff delay for cloud reads.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default overall budget for one cloud read including retries.
pub const DEFAULT_INSPECT_TIMEOUT_SECONDS: u64 = 120;

/// Default timeout for a single IaC invocation (init, plan, apply, destroy).
pub const DEFAULT_LIFECYCLE_TIMEOUT_SECONDS: u64 = 1800;

/// Default number of retries for IaC invocations matching a retryable pattern.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between retried IaC invocations.
pub const DEFAULT_TIME_BETWEEN_RETRIES_SECONDS: u64 = 5;

/// IaC failures known to be transient.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    r"(?i)timeout while waiting for plugin to start",
    r"(?i)failed to query available provider packages",
    r"(?i)could not download module",
    r"(?i)TLS handshake timeout",
    r"(?i)RequestLimitExceeded",
    r"(?i)Throttling",
    r"(?i)connection reset by peer",
    r"(?i)error installing provider",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Backoff settings for cloud reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after every failure.
    pub initial_delay: Duration,
    /// Budget for all attempts together.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_INSPECT_TIMEOUT_SECONDS),
        }
    }
}

/// Retry settings for IaC invocations, applied by the runner.
#[derive(Debug, Clone)]
pub struct ProvisionRetry {
    pub max_retries: u32,
    pub time_between_retries: Duration,
    /// Regular expressions matched against the error text.
    pub retryable_errors: Vec<String>,
}

impl Default for ProvisionRetry {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            time_between_retries: Duration::from_secs(DEFAULT_TIME_BETWEEN_RETRIES_SECONDS),
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path or name of the terraform binary.
    pub terraform_bin: PathBuf,

    /// Path or name of the aws CLI binary.
    pub aws_bin: PathBuf,

    /// Region used when a scenario does not name one.
    pub default_region: String,

    /// Scenarios running at once.
    pub parallelism: usize,

    /// Backoff for cloud reads.
    pub inspect_retry: RetryPolicy,

    /// Timeout for one IaC invocation.
    pub lifecycle_timeout: Duration,

    /// Retry policy for IaC invocations.
    pub provision_retry: ProvisionRetry,

    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            terraform_bin: PathBuf::from(DEFAULT_TERRAFORM_BIN),
            aws_bin: PathBuf::from(DEFAULT_AWS_BIN),
            default_region: DEFAULT_REGION.to_string(),
            parallelism: DEFAULT_PARALLELISM,
            inspect_retry: RetryPolicy::default(),
            lifecycle_timeout: Duration::from_secs(DEFAULT_LIFECYCLE_TIMEOUT_SECONDS),
            provision_retry: ProvisionRetry::default(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let terraform_bin = vars
            .get("INFRA_VERIFY_TERRAFORM_BIN")
            .map_or_else(|| PathBuf::from(DEFAULT_TERRAFORM_BIN), PathBuf::from);

        let aws_bin = vars
            .get("INFRA_VERIFY_AWS_BIN")
            .map_or_else(|| PathBuf::from(DEFAULT_AWS_BIN), PathBuf::from);

        let default_region = vars
            .get("INFRA_VERIFY_DEFAULT_REGION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let parallelism: usize =
            parse_or(vars, "INFRA_VERIFY_PARALLELISM", DEFAULT_PARALLELISM)?;
        if parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "INFRA_VERIFY_PARALLELISM must be at least 1".to_string(),
            ));
        }

        let max_attempts: u32 = parse_or(vars, "INFRA_VERIFY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "INFRA_VERIFY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let initial_backoff_ms: u64 = parse_or(
            vars,
            "INFRA_VERIFY_INITIAL_BACKOFF_MS",
            DEFAULT_INITIAL_BACKOFF_MS,
        )?;

        let inspect_timeout_seconds: u64 = parse_or(
            vars,
            "INFRA_VERIFY_INSPECT_TIMEOUT_SECONDS",
            DEFAULT_INSPECT_TIMEOUT_SECONDS,
        )?;

        let lifecycle_timeout_seconds: u64 = parse_or(
            vars,
            "INFRA_VERIFY_LIFECYCLE_TIMEOUT_SECONDS",
            DEFAULT_LIFECYCLE_TIMEOUT_SECONDS,
        )?;

        let max_retries: u32 = parse_or(vars, "INFRA_VERIFY_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;

        let time_between_retries_seconds: u64 = parse_or(
            vars,
            "INFRA_VERIFY_TIME_BETWEEN_RETRIES_SECONDS",
            DEFAULT_TIME_BETWEEN_RETRIES_SECONDS,
        )?;

        let json_logs = vars
            .get("INFRA_VERIFY_JSON_LOGS")
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");

        Ok(Self {
            terraform_bin,
            aws_bin,
            default_region,
            parallelism,
            inspect_retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(initial_backoff_ms),
                timeout: Duration::from_secs(inspect_timeout_seconds),
            },
            lifecycle_timeout: Duration::from_secs(lifecycle_timeout_seconds),
            provision_retry: ProvisionRetry {
                max_retries,
                time_between_retries: Duration::from_secs(time_between_retries_seconds),
                ..ProvisionRetry::default()
            },
            json_logs,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}
