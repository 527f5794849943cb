//! Scenario runner.
//!
//! Drives one scenario through
//! `Pending -> Provisioning -> Inspecting -> Asserting -> TearingDown -> Completed`.
//! Any error jumps straight to `TearingDown`. Teardown always runs:
//!
//! - normal, error and cancellation paths call the async destroy
//! - a [`TeardownGuard`] armed before apply runs the blocking destroy from
//!   `Drop` when the async path never ran (panic, dropped future)
//!
//! Errors never escape [`ScenarioRunner::run`]; they become a failed
//! [`ScenarioResult`].

use crate::assertions::{self, AssertionResult, Expectation};
use crate::config::{Config, ProvisionRetry};
use crate::drift;
use crate::environment::{EnvConfig, EnvironmentHandle, OutputSet};
use crate::errors::{Result, VerifyError};
use crate::inspector::{AwsCli, ResourceInspector, ResourceSnapshot};
use crate::provisioning::{IacTool, PlanResult, ProvisioningDriver, TerraformCli};
use crate::scenario::{Check, Scenario, ScenarioMode};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Pending,
    Provisioning,
    Inspecting,
    Asserting,
    TearingDown,
    Completed,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioPhase::Pending => "pending",
            ScenarioPhase::Provisioning => "provisioning",
            ScenarioPhase::Inspecting => "inspecting",
            ScenarioPhase::Asserting => "asserting",
            ScenarioPhase::TearingDown => "tearing_down",
            ScenarioPhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub mode: String,
    /// Present once the environment was initialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub passed: bool,
    pub assertions: Vec<AssertionResult>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    /// Error that stopped the scenario (configuration, provisioning,
    /// inspection, schema).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

impl ScenarioResult {
    /// Result for a scenario whose task panicked. Teardown already ran from
    /// the guard during unwinding.
    pub fn panicked(name: impl Into<String>, mode: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: mode.to_string(),
            run_id: None,
            passed: false,
            assertions: Vec::new(),
            duration: Duration::ZERO,
            started_at: Utc::now(),
            error: Some(format!("scenario panicked: {}", message.into())),
            error_kind: Some("panic".to_string()),
            teardown_error: None,
        }
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &AssertionResult> {
        self.assertions.iter().filter(|a| !a.passed)
    }
}

fn serialize_millis<S: serde::Serializer>(
    d: &Duration,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// IaC failures the runner retries, compiled from [`ProvisionRetry`].
#[derive(Debug, Clone)]
pub struct RetryableErrors {
    patterns: Vec<Regex>,
    max_retries: u32,
    pause: Duration,
}

impl RetryableErrors {
    pub fn new(config: &ProvisionRetry) -> Result<Self> {
        let patterns = config
            .retryable_errors
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    VerifyError::Configuration(format!("invalid retryable error pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            max_retries: config.max_retries,
            pause: config.time_between_retries,
        })
    }

    /// Never retry.
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            max_retries: 0,
            pause: Duration::ZERO,
        }
    }

    /// Whether a provisioning failure text matches a known transient error.
    pub fn matches(&self, err: &VerifyError) -> bool {
        match err {
            VerifyError::Provisioning(message) => self.patterns.iter().any(|p| p.is_match(message)),
            _ => false,
        }
    }

    fn should_retry(&self, retries_done: u32, err: &VerifyError) -> bool {
        retries_done < self.max_retries && self.matches(err)
    }

    async fn pause(&self, scenario: &str, step: &str, retry: u32, err: &VerifyError) {
        warn!(
            target: "infra_verify.runner",
            scenario = %scenario,
            step = %step,
            retry,
            max_retries = self.max_retries,
            error = %err,
            "Retryable IaC error, retrying"
        );
        tokio::time::sleep(self.pause).await;
    }
}

/// Destroys the environment from `Drop` if the async teardown never ran.
pub struct TeardownGuard {
    tool: Arc<dyn IacTool>,
    scenario: String,
    armed: Option<EnvConfig>,
}

impl TeardownGuard {
    pub fn new(tool: Arc<dyn IacTool>, scenario: impl Into<String>) -> Self {
        Self {
            tool,
            scenario: scenario.into(),
            armed: None,
        }
    }

    /// Resources may exist from now on.
    pub fn arm(&mut self, config: EnvConfig) {
        self.armed = Some(config);
    }

    /// The async teardown ran; nothing left to do on drop.
    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(config) = self.armed.take() else {
            return;
        };

        warn!(
            target: "infra_verify.runner",
            scenario = %self.scenario,
            panicking = std::thread::panicking(),
            "Scenario ended without teardown, destroying from guard"
        );

        if let Err(e) = self.tool.destroy_blocking(&config) {
            error!(
                target: "infra_verify.runner",
                scenario = %self.scenario,
                working_dir = %config.working_dir.display(),
                error = %e,
                "Guard teardown failed, resources may remain"
            );
        }
    }
}

/// Mutable state of one run.
struct Progress<'a> {
    scenario: &'a str,
    phase: ScenarioPhase,
    assertions: Vec<AssertionResult>,
    error: Option<VerifyError>,
}

impl<'a> Progress<'a> {
    fn new(scenario: &'a str) -> Self {
        Self {
            scenario,
            phase: ScenarioPhase::Pending,
            assertions: Vec::new(),
            error: None,
        }
    }

    fn enter(&mut self, next: ScenarioPhase) {
        debug!(
            target: "infra_verify.runner",
            scenario = %self.scenario,
            from = %self.phase,
            to = %next,
            "Phase transition"
        );
        self.phase = next;
    }

    fn fail(&mut self, err: VerifyError) {
        warn!(
            target: "infra_verify.runner",
            scenario = %self.scenario,
            phase = %self.phase,
            error_kind = err.kind(),
            error = %err,
            "Scenario step failed"
        );
        self.error = Some(err);
    }
}

/// A check's target after inspection.
enum Target {
    Found {
        subject: String,
        snapshot: ResourceSnapshot,
    },
    Missing {
        subject: String,
        reason: String,
    },
}

/// Runs scenarios against one IaC tool and one cloud API.
#[derive(Clone)]
pub struct ScenarioRunner {
    driver: ProvisioningDriver,
    inspector: ResourceInspector,
    retryable: RetryableErrors,
}

impl ScenarioRunner {
    pub fn new(
        driver: ProvisioningDriver,
        inspector: ResourceInspector,
        retryable: RetryableErrors,
    ) -> Self {
        Self {
            driver,
            inspector,
            retryable,
        }
    }

    /// Runner over the real `terraform` and `aws` binaries.
    pub fn from_config(config: &Config) -> Result<Self> {
        let driver = ProvisioningDriver::new(
            Arc::new(TerraformCli::new(config.terraform_bin.clone())),
            config.lifecycle_timeout,
        );
        let inspector = ResourceInspector::new(
            Arc::new(AwsCli::new(config.aws_bin.clone())),
            config.inspect_retry,
        );
        Ok(Self::new(
            driver,
            inspector,
            RetryableErrors::new(&config.provision_retry)?,
        ))
    }

    pub fn driver(&self) -> &ProvisioningDriver {
        &self.driver
    }

    pub fn inspector(&self) -> &ResourceInspector {
        &self.inspector
    }

    /// Run one scenario to completion. Never fails; errors are recorded on
    /// the result.
    pub async fn run(&self, scenario: Scenario, cancel: CancellationToken) -> ScenarioResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut progress = Progress::new(&scenario.name);
        let mut guard = TeardownGuard::new(self.driver.tool(), scenario.name.clone());

        info!(
            target: "infra_verify.runner",
            scenario = %scenario.name,
            mode = scenario.mode.name(),
            "Starting scenario"
        );

        let mut run_id = None;
        let mut teardown_error = None;

        progress.enter(ScenarioPhase::Provisioning);
        let initialized = match scenario.validate() {
            Ok(()) => cancellable(&cancel, "init", self.init_with_retry(&scenario)).await,
            Err(e) => Err(e),
        };

        match initialized {
            Ok(mut handle) => {
                run_id = Some(handle.run_id().to_string());

                if let Err(e) = self
                    .execute(&scenario, &mut handle, &mut guard, &cancel, &mut progress)
                    .await
                {
                    progress.fail(e);
                }

                progress.enter(ScenarioPhase::TearingDown);
                if let Err(e) = self.driver.destroy(&mut handle).await {
                    error!(
                        target: "infra_verify.runner",
                        scenario = %scenario.name,
                        run_id = %handle.run_id(),
                        error = %e,
                        "Teardown failed"
                    );
                    teardown_error = Some(e.to_string());
                }
                guard.disarm();
            }
            Err(e) => {
                progress.fail(e);
                progress.enter(ScenarioPhase::TearingDown);
            }
        }

        progress.enter(ScenarioPhase::Completed);

        let passed = progress.error.is_none()
            && teardown_error.is_none()
            && assertions::all_passed(&progress.assertions);

        let result = ScenarioResult {
            name: scenario.name.clone(),
            mode: scenario.mode.name().to_string(),
            run_id,
            passed,
            duration: start.elapsed(),
            started_at,
            error_kind: progress.error.as_ref().map(|e| e.kind().to_string()),
            error: progress.error.as_ref().map(ToString::to_string),
            assertions: progress.assertions,
            teardown_error,
        };

        info!(
            target: "infra_verify.runner",
            scenario = %result.name,
            passed = result.passed,
            assertions = result.assertions.len(),
            failed = result.failed_assertions().count(),
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Scenario completed"
        );

        result
    }

    async fn execute(
        &self,
        scenario: &Scenario,
        handle: &mut EnvironmentHandle,
        guard: &mut TeardownGuard,
        cancel: &CancellationToken,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        match &scenario.mode {
            ScenarioMode::Verify { checks, outputs } => {
                guard.arm(handle.config().clone());
                let applied = cancellable(cancel, "apply", self.apply_with_retry(handle)).await?;

                progress.enter(ScenarioPhase::Inspecting);
                let region = handle.region().to_string();
                let mut targets = Vec::with_capacity(checks.len());
                for check in checks {
                    targets.push(self.inspect_check(check, &applied, &region, cancel).await?);
                }

                progress.enter(ScenarioPhase::Asserting);
                for (check, target) in checks.iter().zip(targets) {
                    match target {
                        Target::Found { subject, snapshot } => {
                            for result in
                                assertions::evaluate_snapshot(&snapshot, &check.expectations)?
                            {
                                progress.assertions.push(result.with_subject(subject.clone()));
                            }
                        }
                        Target::Missing { subject, reason } => {
                            for expectation in &check.expectations {
                                progress.assertions.push(
                                    AssertionResult::failed(expectation, reason.clone())
                                        .with_subject(subject.clone()),
                                );
                            }
                        }
                    }
                }
                progress
                    .assertions
                    .extend(evaluate_outputs(&applied, outputs)?);
            }
            ScenarioMode::DriftCheck => {
                guard.arm(handle.config().clone());
                cancellable(cancel, "apply", self.apply_with_retry(handle)).await?;

                progress.enter(ScenarioPhase::Inspecting);
                let assertion = cancellable(cancel, "plan", self.drift_with_retry(handle)).await?;

                progress.enter(ScenarioPhase::Asserting);
                progress.assertions.push(assertion);
            }
            ScenarioMode::PlanOnly { expectations } => {
                progress.enter(ScenarioPhase::Inspecting);
                let plan = cancellable(cancel, "plan", self.plan_with_retry(handle)).await?;

                progress.enter(ScenarioPhase::Asserting);
                progress
                    .assertions
                    .extend(evaluate_plan(&plan, expectations)?);
            }
        }
        Ok(())
    }

    async fn inspect_check(
        &self,
        check: &Check,
        outputs: &OutputSet,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<Target> {
        let id = match check.id.resolve(outputs) {
            Ok(id) => id,
            Err(e @ VerifyError::NotFound(_)) => {
                return Ok(Target::Missing {
                    subject: format!("{} {}", check.kind, check.id),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let subject = format!("{} {id}", check.kind);

        match cancellable(cancel, "inspect", self.inspector.inspect(check.kind, &id, region)).await
        {
            Ok(snapshot) => Ok(Target::Found { subject, snapshot }),
            Err(e @ VerifyError::NotFound(_)) => {
                warn!(
                    target: "infra_verify.runner",
                    kind = %check.kind,
                    id = %id,
                    "Check target not found"
                );
                Ok(Target::Missing {
                    subject,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn init_with_retry(&self, scenario: &Scenario) -> Result<EnvironmentHandle> {
        let mut retries = 0;
        loop {
            match self.driver.init(scenario.env.clone()).await {
                Err(e) if self.retryable.should_retry(retries, &e) => {
                    retries += 1;
                    self.retryable.pause(&scenario.name, "init", retries, &e).await;
                }
                result => return result,
            }
        }
    }

    async fn apply_with_retry(&self, handle: &mut EnvironmentHandle) -> Result<OutputSet> {
        let mut retries = 0;
        loop {
            match self.driver.apply(handle).await {
                Err(e) if self.retryable.should_retry(retries, &e) => {
                    retries += 1;
                    self.retryable.pause(handle.run_id(), "apply", retries, &e).await;
                }
                result => return result,
            }
        }
    }

    async fn plan_with_retry(&self, handle: &mut EnvironmentHandle) -> Result<PlanResult> {
        let mut retries = 0;
        loop {
            match self.driver.plan(handle).await {
                Err(e) if self.retryable.should_retry(retries, &e) => {
                    retries += 1;
                    self.retryable.pause(handle.run_id(), "plan", retries, &e).await;
                }
                result => return result,
            }
        }
    }

    async fn drift_with_retry(&self, handle: &mut EnvironmentHandle) -> Result<AssertionResult> {
        let mut retries = 0;
        loop {
            match drift::check_drift(&self.driver, handle).await {
                Err(e) if self.retryable.should_retry(retries, &e) => {
                    retries += 1;
                    self.retryable.pause(handle.run_id(), "plan", retries, &e).await;
                }
                result => return result,
            }
        }
    }
}

/// Race `fut` against cancellation. Dropping `fut` interrupts any child
/// process it started.
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(VerifyError::Provisioning(format!("cancelled during {step}")))
        }
        result = fut => result,
    }
}

/// Expectations over the output set. A path naming a missing output is a
/// failed assertion rather than a schema error.
fn evaluate_outputs(
    outputs: &OutputSet,
    expectations: &[Expectation],
) -> Result<Vec<AssertionResult>> {
    let json = outputs.to_json();
    expectations
        .iter()
        .map(|expectation| {
            let missing = match expectation.path.segments().first() {
                Some(assertions::path::Segment::Key(name)) => outputs.get(name).err(),
                _ => None,
            };
            match missing {
                Some(e) => {
                    Ok(AssertionResult::failed(expectation, e.to_string()).with_subject("outputs"))
                }
                None => assertions::check(&json, expectation).map(|r| r.with_subject("outputs")),
            }
        })
        .collect()
}

fn evaluate_plan(plan: &PlanResult, expectations: &[Expectation]) -> Result<Vec<AssertionResult>> {
    let json = serde_json::to_value(plan)?;
    Ok(assertions::evaluate(&json, expectations)?
        .into_iter()
        .map(|r| r.with_subject("plan"))
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::indexing_slicing,
        clippy::panic
    )]

    use super::*;
    use crate::assertions::Predicate;
    use crate::config::RetryPolicy;
    use crate::environment::OutputValue;
    use crate::inspector::mock::{self, MockCloudApi};
    use crate::inspector::{CloudApi, ResourceKind};
    use crate::provisioning::mock::MockIacTool;
    use crate::provisioning::PlannedChange;
    use crate::scenario::IdSource;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn outputs() -> OutputSet {
        let mut values = BTreeMap::new();
        values.insert("vpc_id".to_string(), OutputValue::Text("vpc-0abc".to_string()));
        values.insert("rds_sg_id".to_string(), OutputValue::Text("sg-rds".to_string()));
        values.insert(
            "private_subnet_ids".to_string(),
            OutputValue::List(vec!["subnet-a".to_string(), "subnet-b".to_string()]),
        );
        OutputSet::new(values)
    }

    fn cloud() -> MockCloudApi {
        MockCloudApi::new()
            .with_resource(
                ResourceKind::Vpc,
                "vpc-0abc",
                mock::aws_vpc("vpc-0abc", "10.0.0.0/16"),
            )
            .with_resource(
                ResourceKind::SecurityGroup,
                "sg-rds",
                mock::aws_security_group("sg-rds", &[(5432, 5432)]),
            )
    }

    fn runner(tool: &Arc<MockIacTool>, api: Arc<dyn CloudApi>) -> ScenarioRunner {
        ScenarioRunner::new(
            ProvisioningDriver::new(tool.clone(), Duration::from_secs(1800)),
            ResourceInspector::new(api, RetryPolicy::default()),
            RetryableErrors::none(),
        )
    }

    fn expect(path: &str, predicate: Predicate) -> Expectation {
        Expectation::new(path, predicate).unwrap()
    }

    fn vpc_scenario(dir: &Path, cidr: &str) -> Scenario {
        Scenario::new(
            "vpc",
            EnvConfig::new(dir, "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::Verify {
                checks: vec![Check::new(
                    ResourceKind::Vpc,
                    IdSource::output("vpc_id"),
                    vec![expect("cidr_block", Predicate::Equals(json!(cidr)))],
                )],
                outputs: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_verify_passes_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(result.passed, "unexpected failure: {result:?}");
        assert_eq!(result.assertions.len(), 1);
        assert_eq!(result.assertions[0].subject.as_deref(), Some("vpc vpc-0abc"));
        assert!(result.run_id.is_some());
        assert_eq!(tool.calls(), ["init", "apply", "output", "destroy"]);
    }

    #[tokio::test]
    async fn test_assertion_failure_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.1.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert!(result.error.is_none());
        assert_eq!(result.assertions[0].observed, Some(json!("10.0.0.0/16")));
        assert_eq!(tool.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_inspection_error_fails_scenario_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let api = MockCloudApi::new().with_permanent_failure(
            ResourceKind::Vpc,
            "vpc-0abc",
            "UnauthorizedOperation",
        );
        let runner = runner(&tool, Arc::new(api));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(result.error_kind.as_deref(), Some("cloud_api"));
        assert_eq!(tool.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_target_fails_its_expectations_only() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "mixed",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::Verify {
                checks: vec![
                    Check::new(
                        ResourceKind::DatabaseInstance,
                        IdSource::literal("app-db"),
                        vec![
                            expect("status", Predicate::Equals(json!("available"))),
                            expect("backup_retention_period", Predicate::GreaterThan(0.0)),
                        ],
                    ),
                    Check::new(
                        ResourceKind::SecurityGroup,
                        IdSource::output("rds_sg_id"),
                        vec![expect("ip_permissions", Predicate::LengthEquals(1))],
                    ),
                    Check::new(
                        ResourceKind::CacheCluster,
                        IdSource::output("redis_id"),
                        vec![expect("status", Predicate::Equals(json!("available")))],
                    ),
                ],
                outputs: vec![],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(!result.passed);
        assert!(result.error.is_none());
        let passed: Vec<bool> = result.assertions.iter().map(|a| a.passed).collect();
        assert_eq!(passed, [false, false, true, false]);
        assert!(result.assertions[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("app-db"));
        assert!(result.assertions[3]
            .detail
            .as_ref()
            .unwrap()
            .contains("redis_id"));
        assert_eq!(tool.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_tag_keeps_other_results() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "tags",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::Verify {
                checks: vec![Check::new(
                    ResourceKind::Vpc,
                    IdSource::output("vpc_id"),
                    vec![
                        expect("cidr_block", Predicate::Equals(json!("10.0.0.0/16"))),
                        expect("tags.Name", Predicate::Equals(json!("main"))),
                    ],
                )],
                outputs: vec![],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(!result.passed);
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        let passed: Vec<bool> = result.assertions.iter().map(|a| a.passed).collect();
        assert_eq!(passed, [true, false]);
        assert_eq!(tool.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "typo",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::Verify {
                checks: vec![Check::new(
                    ResourceKind::Vpc,
                    IdSource::output("vpc_id"),
                    vec![expect("cidr", Predicate::NonEmpty)],
                )],
                outputs: vec![],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(!result.passed);
        assert_eq!(result.error_kind.as_deref(), Some("schema_mismatch"));
        assert_eq!(tool.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_failure_has_no_assertions_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .failing_apply("Error: creating RDS instance: quota exceeded"),
        );
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert!(result.assertions.is_empty());
        assert_eq!(result.error_kind.as_deref(), Some("provisioning"));
        assert!(result.error.unwrap().contains("quota exceeded"));
        assert_eq!(tool.destroy_count(), 1, "partial apply must be torn down");
    }

    #[tokio::test]
    async fn test_init_failure_skips_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().failing_init("Error: backend unreachable"));
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert!(result.run_id.is_none());
        assert_eq!(tool.calls(), ["init"]);
    }

    #[tokio::test]
    async fn test_invalid_scenario_never_provisions() {
        let tool = Arc::new(MockIacTool::new());
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(Path::new("/no/such/dir"), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(result.error_kind.as_deref(), Some("configuration"));
        assert!(tool.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_apply_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .with_apply_delay(Duration::from_secs(600)),
        );
        let runner = runner(&tool, Arc::new(cloud()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), cancel)
            .await;

        assert!(!result.passed);
        assert_eq!(result.error_kind.as_deref(), Some("provisioning"));
        assert!(result.error.unwrap().contains("cancelled during apply"));
        assert_eq!(tool.destroy_count(), 1);
        assert_eq!(tool.blocking_destroy_count(), 0);
    }

    struct PanickingApi;

    #[async_trait::async_trait]
    impl CloudApi for PanickingApi {
        async fn describe(
            &self,
            _kind: ResourceKind,
            _id: &str,
            _region: &str,
        ) -> Result<serde_json::Value> {
            panic!("describe exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_is_torn_down_by_guard() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(PanickingApi));
        let scenario = vpc_scenario(dir.path(), "10.0.0.0/16");

        let joined = tokio::spawn(async move {
            runner.run(scenario, CancellationToken::new()).await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(tool.blocking_destroy_count(), 1);
        assert_eq!(tool.calls().last().map(String::as_str), Some("destroy_blocking"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_is_torn_down_by_guard() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .with_apply_delay(Duration::from_secs(600)),
        );
        let runner = runner(&tool, Arc::new(cloud()));

        let timed_out = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new()),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(tool.blocking_destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_drift_check() {
        let dir = tempfile::tempdir().unwrap();
        let drifted = PlanResult::with_changes(vec![PlannedChange {
            address: "aws_security_group.ecs".to_string(),
            action: "update".to_string(),
        }]);
        let tool = Arc::new(MockIacTool::new().with_plan_results(vec![drifted]));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "drift",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::DriftCheck,
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(!result.passed);
        assert!(result.error.is_none());
        assert!(result.assertions[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("aws_security_group.ecs"));
        assert_eq!(tool.calls(), ["init", "apply", "output", "plan", "destroy"]);
    }

    #[tokio::test]
    async fn test_plan_only_never_applies() {
        let dir = tempfile::tempdir().unwrap();
        let plan = PlanResult::with_changes(vec![PlannedChange {
            address: "aws_vpc.main".to_string(),
            action: "create".to_string(),
        }]);
        let tool = Arc::new(MockIacTool::new().with_plan_results(vec![plan]));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "plan",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::PlanOnly {
                expectations: vec![expect("change_count", Predicate::GreaterThan(0.0))],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(result.passed, "unexpected failure: {result:?}");
        assert_eq!(tool.calls(), ["init", "plan"]);
        assert_eq!(tool.destroy_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_only_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().failing_plan("Error: Invalid reference"));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "plan",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::PlanOnly {
                expectations: vec![],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        assert!(!result.passed);
        assert!(result.assertions.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_failure_fails_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .failing_destroy("Error: DependencyViolation"),
        );
        let runner = runner(&tool, Arc::new(cloud()));

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert!(result.error.is_none());
        assert!(result.teardown_error.unwrap().contains("DependencyViolation"));
        assert_eq!(tool.blocking_destroy_count(), 0);
    }

    #[tokio::test]
    async fn test_output_expectations() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(MockIacTool::new().with_outputs(outputs()));
        let runner = runner(&tool, Arc::new(cloud()));
        let scenario = Scenario::new(
            "outputs",
            EnvConfig::new(dir.path(), "us-east-1").with_var("region", "us-east-1"),
            ScenarioMode::Verify {
                checks: vec![],
                outputs: vec![
                    expect("private_subnet_ids", Predicate::LengthEquals(2)),
                    expect("vpc_id", Predicate::Matches("^vpc-".to_string())),
                    expect("db_endpoint", Predicate::NonEmpty),
                ],
            },
        );

        let result = runner.run(scenario, CancellationToken::new()).await;

        let passed: Vec<bool> = result.assertions.iter().map(|a| a.passed).collect();
        assert_eq!(passed, [true, true, false]);
        assert!(result.error.is_none());
        assert_eq!(result.assertions[2].label(), "outputs: db_endpoint");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_apply_error_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .failing_apply_times(1, "Error: timeout while waiting for plugin to start"),
        );
        let retryable = RetryableErrors::new(&ProvisionRetry::default()).unwrap();
        let runner = ScenarioRunner::new(
            ProvisioningDriver::new(tool.clone(), Duration::from_secs(1800)),
            ResourceInspector::new(Arc::new(cloud()), RetryPolicy::default()),
            retryable,
        );

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(result.passed, "unexpected failure: {result:?}");
        assert_eq!(tool.apply_count(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_apply_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(
            MockIacTool::new()
                .with_outputs(outputs())
                .failing_apply_times(1, "Error: InvalidParameterValue"),
        );
        let runner = ScenarioRunner::new(
            ProvisioningDriver::new(tool.clone(), Duration::from_secs(1800)),
            ResourceInspector::new(Arc::new(cloud()), RetryPolicy::default()),
            RetryableErrors::new(&ProvisionRetry::default()).unwrap(),
        );

        let result = runner
            .run(vpc_scenario(dir.path(), "10.0.0.0/16"), CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(tool.apply_count(), 1);
    }

    #[test]
    fn test_invalid_retry_pattern() {
        let config = ProvisionRetry {
            retryable_errors: vec!["(".to_string()],
            ..ProvisionRetry::default()
        };
        assert!(matches!(
            RetryableErrors::new(&config).unwrap_err(),
            VerifyError::Configuration(_)
        ));
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let result = ScenarioResult::panicked("boom", "verify", "index out of bounds");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 0);
        assert_eq!(json["passed"], false);
        assert!(json.get("teardown_error").is_none());
    }
}
