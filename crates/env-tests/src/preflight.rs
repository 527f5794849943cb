//! Toolchain and account preflight checks.
//!
//! `Toolchain` validates that the IaC tool, the cloud CLI, credentials and
//! the stack directory are usable before any test provisions anything.

use infra_verify::config::{Config, ConfigError};
use infra_verify::errors::VerifyError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Environment variable naming the terraform configuration under test.
pub const STACK_DIR_VAR: &str = "ENV_TESTS_STACK_DIR";

/// Stack location relative to the workspace root when the variable is unset.
pub const DEFAULT_STACK_DIR: &str = "infra";

const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Preflight errors.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("'{binary}' is not runnable ({message}). Install it or set {env_var}")]
    ToolMissing {
        binary: String,
        env_var: &'static str,
        message: String,
    },

    #[error("AWS credentials rejected: {message}. Export credentials for a disposable test account")]
    CredentialsInvalid { message: String },

    #[error("Stack directory {} not found. Set ENV_TESTS_STACK_DIR to the terraform configuration", .path.display())]
    StackNotFound { path: PathBuf },

    #[error("Invalid runner configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Runner setup failed: {0}")]
    Runner(#[from] VerifyError),
}

/// Validated tools and stack location.
pub struct Toolchain {
    pub config: Config,
    pub stack_dir: PathBuf,
}

impl Toolchain {
    /// Load configuration from the environment and check every tool.
    ///
    /// Returns actionable error messages when something is missing.
    pub async fn new() -> Result<Self, PreflightError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let config = Config::from_vars(&vars)?;
        let stack_dir = stack_dir_from(&vars);

        if !stack_dir.is_dir() {
            return Err(PreflightError::StackNotFound { path: stack_dir });
        }

        let toolchain = Self { config, stack_dir };
        toolchain.terraform_version().await?;
        toolchain.aws_version().await?;
        Ok(toolchain)
    }

    /// `terraform version` first line, e.g. `Terraform v1.9.5`.
    pub async fn terraform_version(&self) -> Result<String, PreflightError> {
        let output = run_tool(
            &self.config.terraform_bin,
            &["version"],
            "INFRA_VERIFY_TERRAFORM_BIN",
        )
        .await?;
        Ok(first_line(&output.stdout))
    }

    /// `aws --version` output, e.g. `aws-cli/2.17.0 ...`.
    pub async fn aws_version(&self) -> Result<String, PreflightError> {
        let output = run_tool(&self.config.aws_bin, &["--version"], "INFRA_VERIFY_AWS_BIN").await?;
        // aws-cli v1 prints its version on stderr.
        let text = if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        Ok(first_line(text))
    }

    /// Account id of the active credentials.
    pub async fn caller_identity(&self) -> Result<String, PreflightError> {
        let output = Command::new(&self.config.aws_bin)
            .args(["sts", "get-caller-identity", "--output", "json"])
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(TOOL_TIMEOUT, output)
            .await
            .map_err(|_| PreflightError::CredentialsInvalid {
                message: format!("sts get-caller-identity timed out after {TOOL_TIMEOUT:?}"),
            })?
            .map_err(|e| PreflightError::ToolMissing {
                binary: self.config.aws_bin.display().to_string(),
                env_var: "INFRA_VERIFY_AWS_BIN",
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(PreflightError::CredentialsInvalid {
                message: first_line(&output.stderr),
            });
        }
        parse_account(&output.stdout)
    }
}

/// Stack directory from `ENV_TESTS_STACK_DIR`, else `<workspace>/infra`.
pub fn stack_dir_from(vars: &HashMap<String, String>) -> PathBuf {
    match vars.get(STACK_DIR_VAR) {
        Some(dir) => PathBuf::from(dir),
        None => workspace_root().join(DEFAULT_STACK_DIR),
    }
}

/// Workspace root, two levels above this crate's manifest.
pub fn workspace_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .parent()
        .and_then(Path::parent)
        .unwrap_or(manifest)
        .to_path_buf()
}

async fn run_tool(
    binary: &Path,
    args: &[&str],
    env_var: &'static str,
) -> Result<Output, PreflightError> {
    let missing = |message: String| PreflightError::ToolMissing {
        binary: binary.display().to_string(),
        env_var,
        message,
    };

    let output = tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(binary).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| missing(format!("timed out after {TOOL_TIMEOUT:?}")))?
    .map_err(|e| missing(e.to_string()))?;

    if !output.status.success() {
        return Err(missing(format!("exited with {}", output.status)));
    }
    Ok(output)
}

fn first_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parse_account(stdout: &[u8]) -> Result<String, PreflightError> {
    let identity: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| PreflightError::CredentialsInvalid {
            message: format!("unreadable caller identity: {e}"),
        })?;
    identity
        .get("Account")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PreflightError::CredentialsInvalid {
            message: "caller identity has no Account".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_dir_defaults_to_workspace_infra() {
        let dir = stack_dir_from(&HashMap::new());
        assert!(dir.ends_with(DEFAULT_STACK_DIR));
        assert!(workspace_root().join("crates/env-tests").is_dir());

        let mut vars = HashMap::new();
        vars.insert(STACK_DIR_VAR.to_string(), "/tmp/stack".to_string());
        assert_eq!(stack_dir_from(&vars), PathBuf::from("/tmp/stack"));
    }

    #[test]
    fn test_parse_account() {
        let stdout = br#"{"UserId": "AIDA", "Account": "123456789012", "Arn": "arn:aws:iam::123456789012:user/ci"}"#;
        assert_eq!(parse_account(stdout).unwrap(), "123456789012");
        assert!(parse_account(b"{}").is_err());
        assert!(parse_account(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_actionable() {
        let err = run_tool(
            Path::new("/nonexistent/terraform"),
            &["version"],
            "INFRA_VERIFY_TERRAFORM_BIN",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("INFRA_VERIFY_TERRAFORM_BIN"));
    }
}
