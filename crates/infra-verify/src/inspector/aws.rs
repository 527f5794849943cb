//! AWS CLI implementation of [`CloudApi`].
//!
//! Each describe runs one read-only `aws` command with `--output json`.
//! Credentials come from the standard AWS environment (profile, env vars,
//! instance role); nothing here handles them.

use super::{CloudApi, ResourceKind};
use crate::errors::{Result, VerifyError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Maximum length of CLI error output quoted in error messages.
const MAX_ERROR_BODY_LEN: usize = 512;

/// `An error occurred (InvalidVpcID.NotFound) when calling ...`
static ERROR_CODE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"An error occurred \(([A-Za-z0-9_.]+)\)").ok());

/// Error codes the API returns for throttling and temporary outages.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "TooManyRequestsException",
    "RequestTimeout",
    "RequestTimeoutException",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
];

/// Error codes that mean the identifier does not resolve, beyond the
/// `*NotFound` / `*NotFoundFault` naming convention.
const NOT_FOUND_CODES: &[&str] = &["ResourceNotFoundException", "ClusterNotFoundException"];

/// Messages the CLI prints for network failures, with no error code.
const TRANSIENT_MESSAGES: &[&str] = &[
    "Could not connect to the endpoint URL",
    "Read timeout on endpoint URL",
    "Connect timeout on endpoint URL",
    "Connection was closed before we received a valid response",
];

/// Environment for every invocation. The CLI's own retries are disabled so
/// the inspector's retry policy bounds the number of API calls.
const CLI_ENV: &[(&str, &str)] = &[
    ("AWS_PAGER", ""),
    ("AWS_RETRY_MODE", "standard"),
    ("AWS_MAX_ATTEMPTS", "1"),
];

/// Runs the `aws` binary.
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: PathBuf,
}

impl AwsCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, args: &[String]) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(args)
            .envs(CLI_ENV.iter().copied())
            .kill_on_drop(true);
        command
    }
}

#[async_trait::async_trait]
impl CloudApi for AwsCli {
    async fn describe(
        &self,
        kind: ResourceKind,
        id: &str,
        region: &str,
    ) -> Result<serde_json::Value> {
        let args = describe_args(kind, id, region);

        debug!(
            target: "infra_verify.inspector.aws",
            kind = %kind,
            id = %id,
            region = %region,
            "Running aws describe"
        );

        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|e| {
                VerifyError::CloudApi(format!("failed to run {}: {e}", self.binary.display()))
            })?;

        if !output.status.success() {
            return Err(classify_cli_error(
                kind,
                id,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Arguments for the read-only describe call of one resource.
pub(crate) fn describe_args(kind: ResourceKind, id: &str, region: &str) -> Vec<String> {
    let args: Vec<String> = match kind {
        ResourceKind::Vpc => vec!["ec2", "describe-vpcs", "--vpc-ids", id],
        ResourceKind::Subnet => vec!["ec2", "describe-subnets", "--subnet-ids", id],
        ResourceKind::SecurityGroup => {
            vec!["ec2", "describe-security-groups", "--group-ids", id]
        }
        ResourceKind::RouteTable => vec!["ec2", "describe-route-tables", "--route-table-ids", id],
        ResourceKind::InternetGateway if id.starts_with("vpc-") => {
            return with_common(
                vec![
                    "ec2".to_string(),
                    "describe-internet-gateways".to_string(),
                    "--filters".to_string(),
                    format!("Name=attachment.vpc-id,Values={id}"),
                ],
                region,
            );
        }
        ResourceKind::InternetGateway => vec![
            "ec2",
            "describe-internet-gateways",
            "--internet-gateway-ids",
            id,
        ],
        ResourceKind::DatabaseInstance => {
            vec!["rds", "describe-db-instances", "--db-instance-identifier", id]
        }
        ResourceKind::CacheCluster => vec![
            "elasticache",
            "describe-cache-clusters",
            "--cache-cluster-id",
            id,
        ],
        ResourceKind::LogGroup => vec!["logs", "describe-log-groups", "--log-group-name-prefix", id],
        ResourceKind::ContainerCluster => vec!["ecs", "describe-clusters", "--clusters", id],
    }
    .into_iter()
    .map(String::from)
    .collect();

    with_common(args, region)
}

fn with_common(mut args: Vec<String>, region: &str) -> Vec<String> {
    args.extend([
        "--region".to_string(),
        region.to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]);
    args
}

/// Map CLI error output onto the error taxonomy.
pub(crate) fn classify_cli_error(kind: ResourceKind, id: &str, stderr: &str) -> VerifyError {
    let stderr = stderr.trim();
    let code = ERROR_CODE_PATTERN
        .as_ref()
        .and_then(|re| re.captures(stderr))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());

    match code {
        Some(code)
            if code.ends_with("NotFound")
                || code.ends_with("NotFoundFault")
                || NOT_FOUND_CODES.contains(&code) =>
        {
            VerifyError::NotFound(format!("{kind} '{id}' ({code})"))
        }
        Some(code) if TRANSIENT_CODES.contains(&code) => {
            VerifyError::TransientApi(format!("describe {kind} '{id}': {}", truncate(stderr)))
        }
        Some(_) => VerifyError::CloudApi(format!("describe {kind} '{id}': {}", truncate(stderr))),
        None if TRANSIENT_MESSAGES.iter().any(|m| stderr.contains(m)) => {
            VerifyError::TransientApi(format!("describe {kind} '{id}': {}", truncate(stderr)))
        }
        None => VerifyError::CloudApi(format!("describe {kind} '{id}': {}", truncate(stderr))),
    }
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LEN {
        let mut end = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", body.get(..end).unwrap_or_default())
    } else {
        body.to_string()
    }
}
