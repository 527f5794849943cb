//! Provisioning driver.
//!
//! Wraps the external IaC tool behind [`IacTool`] and owns the lifecycle of
//! each [`EnvironmentHandle`]: init, plan, apply, output, destroy.
//!
//! The driver never retries on its own. Retries of IaC invocations are a
//! runner policy (see [`crate::runner`]).

pub mod mock;
pub mod terraform;

pub use terraform::TerraformCli;

use crate::environment::{EnvConfig, EnvironmentHandle, LifecycleState, OutputSet};
use crate::errors::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Length of the short run identifier substituted for `${run_id}`.
const RUN_ID_LEN: usize = 8;

/// One resource the plan would touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    /// Resource address, e.g. `aws_security_group.rds`.
    pub address: String,
    /// Planned action (`create`, `update`, `delete`, `replace`, ...).
    pub action: String,
}

/// Result of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Resources to add, change or remove.
    pub change_count: usize,
    /// Exit code of the plan (0 = no changes, 2 = changes present).
    pub exit_code: i32,
    /// Individual planned changes.
    pub changes: Vec<PlannedChange>,
}

impl PlanResult {
    /// A plan that would change nothing.
    pub fn no_changes() -> Self {
        Self {
            change_count: 0,
            exit_code: 0,
            changes: Vec::new(),
        }
    }

    /// A plan touching the given resources.
    pub fn with_changes(changes: Vec<PlannedChange>) -> Self {
        Self {
            change_count: changes.len(),
            exit_code: if changes.is_empty() { 0 } else { 2 },
            changes,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.change_count == 0
    }
}

/// Seam to the external IaC tool.
///
/// Implementations run one tool command per call against the given
/// configuration. They hold no per-environment state.
#[async_trait::async_trait]
pub trait IacTool: Send + Sync {
    /// Prepare the working directory (providers, modules, backend).
    async fn init(&self, env: &EnvConfig) -> Result<()>;

    /// Compute pending changes without touching real resources.
    async fn plan(&self, env: &EnvConfig) -> Result<PlanResult>;

    /// Create or update resources.
    async fn apply(&self, env: &EnvConfig) -> Result<()>;

    /// Read the outputs of the applied configuration.
    async fn output(&self, env: &EnvConfig) -> Result<OutputSet>;

    /// Destroy every resource of the configuration.
    async fn destroy(&self, env: &EnvConfig) -> Result<()>;

    /// Synchronous destroy for drop paths where no executor is available.
    fn destroy_blocking(&self, env: &EnvConfig) -> Result<()>;
}

/// Drives one IaC tool through the environment lifecycle.
#[derive(Clone)]
pub struct ProvisioningDriver {
    tool: Arc<dyn IacTool>,
    timeout: Duration,
}

impl ProvisioningDriver {
    pub fn new(tool: Arc<dyn IacTool>, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    /// The underlying tool.
    pub fn tool(&self) -> Arc<dyn IacTool> {
        Arc::clone(&self.tool)
    }

    /// Validate the configuration, assign a run id and initialize the tool.
    ///
    /// `${run_id}` in variable values is replaced before anything runs.
    pub async fn init(&self, config: EnvConfig) -> Result<EnvironmentHandle> {
        let run_id = new_run_id();
        let config = config.for_run(&run_id);
        config.validate()?;

        info!(
            target: "infra_verify.provisioning",
            run_id = %run_id,
            working_dir = %config.working_dir.display(),
            variables = ?config.variables,
            "Initializing environment"
        );

        self.bounded("init", self.tool.init(&config)).await?;

        Ok(EnvironmentHandle::new(run_id, config))
    }

    /// Plan against the handle's configuration.
    pub async fn plan(&self, handle: &mut EnvironmentHandle) -> Result<PlanResult> {
        if handle.state() == LifecycleState::Destroyed {
            return Err(VerifyError::Provisioning(format!(
                "cannot plan destroyed environment {}",
                handle.run_id()
            )));
        }

        let result = self.bounded("plan", self.tool.plan(handle.config())).await?;

        if handle.state() == LifecycleState::Uninitialized {
            handle.set_state(LifecycleState::Planned);
        }

        info!(
            target: "infra_verify.provisioning",
            run_id = %handle.run_id(),
            change_count = result.change_count,
            exit_code = result.exit_code,
            "Plan complete"
        );

        Ok(result)
    }

    /// Provision the environment and read its outputs.
    ///
    /// Returns the cached outputs when the handle is already applied. A failed
    /// apply leaves the handle `Applied` without outputs so teardown still
    /// covers whatever was partially created.
    pub async fn apply(&self, handle: &mut EnvironmentHandle) -> Result<OutputSet> {
        match handle.state() {
            LifecycleState::Destroyed => {
                return Err(VerifyError::Provisioning(format!(
                    "cannot apply destroyed environment {}",
                    handle.run_id()
                )));
            }
            LifecycleState::Applied => {
                if let Some(outputs) = handle.outputs() {
                    debug!(
                        target: "infra_verify.provisioning",
                        run_id = %handle.run_id(),
                        "Environment already applied, returning cached outputs"
                    );
                    return Ok(outputs.clone());
                }
            }
            LifecycleState::Uninitialized | LifecycleState::Planned => {}
        }

        handle.set_state(LifecycleState::Applied);

        info!(
            target: "infra_verify.provisioning",
            run_id = %handle.run_id(),
            "Applying environment"
        );

        self.bounded("apply", self.tool.apply(handle.config())).await?;
        let outputs = self.bounded("output", self.tool.output(handle.config())).await?;
        handle.set_outputs(outputs.clone());

        info!(
            target: "infra_verify.provisioning",
            run_id = %handle.run_id(),
            output_count = outputs.len(),
            "Environment applied"
        );

        Ok(outputs)
    }

    /// Re-read outputs of an applied environment.
    pub async fn output(&self, handle: &EnvironmentHandle) -> Result<OutputSet> {
        if handle.state() != LifecycleState::Applied {
            return Err(VerifyError::Provisioning(format!(
                "environment {} is {}, outputs require an applied environment",
                handle.run_id(),
                handle.state()
            )));
        }
        self.bounded("output", self.tool.output(handle.config())).await
    }

    /// Tear the environment down. Safe to call any number of times.
    pub async fn destroy(&self, handle: &mut EnvironmentHandle) -> Result<()> {
        match handle.state() {
            LifecycleState::Destroyed => {
                debug!(
                    target: "infra_verify.provisioning",
                    run_id = %handle.run_id(),
                    "Environment already destroyed, skipping"
                );
                return Ok(());
            }
            LifecycleState::Uninitialized | LifecycleState::Planned => {
                debug!(
                    target: "infra_verify.provisioning",
                    run_id = %handle.run_id(),
                    state = %handle.state(),
                    "Environment never applied, nothing to destroy"
                );
                handle.set_state(LifecycleState::Destroyed);
                return Ok(());
            }
            LifecycleState::Applied => {}
        }

        info!(
            target: "infra_verify.provisioning",
            run_id = %handle.run_id(),
            "Destroying environment"
        );

        if let Err(e) = self.bounded("destroy", self.tool.destroy(handle.config())).await {
            warn!(
                target: "infra_verify.provisioning",
                run_id = %handle.run_id(),
                error = %e,
                "Destroy failed, resources may remain"
            );
            return Err(e);
        }

        handle.set_state(LifecycleState::Destroyed);

        info!(
            target: "infra_verify.provisioning",
            run_id = %handle.run_id(),
            "Environment destroyed"
        );

        Ok(())
    }

    async fn bounded<T>(&self, step: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(VerifyError::Provisioning(format!(
                "{step} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

fn new_run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(RUN_ID_LEN);
    id
}
