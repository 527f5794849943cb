//! Stack fixture.
//!
//! Loads the declarations under `scenarios/`, points them at the stack
//! directory chosen by preflight and runs them with the real terraform and
//! aws binaries.

use crate::preflight::{PreflightError, Toolchain};
use infra_verify::assertions::AssertionResult;
use infra_verify::errors::{Result, VerifyError};
use infra_verify::inspector::ResourceInspector;
use infra_verify::observability;
use infra_verify::report::Aggregator;
use infra_verify::runner::{ScenarioResult, ScenarioRunner};
use infra_verify::scenario::{self, Scenario};
use std::path::PathBuf;
use std::sync::Once;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static TRACING: Once = Once::new();

/// Runs declared scenarios against the live stack.
pub struct StackFixture {
    toolchain: Toolchain,
    runner: ScenarioRunner,
}

impl StackFixture {
    /// Preflight the toolchain and build a runner from the environment.
    pub async fn new() -> std::result::Result<Self, PreflightError> {
        init_tracing_once();

        let toolchain = Toolchain::new().await?;
        let runner = ScenarioRunner::from_config(&toolchain.config)?;

        Ok(Self { toolchain, runner })
    }

    /// Directory holding the declaration files.
    pub fn scenarios_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios")
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn inspector(&self) -> &ResourceInspector {
        self.runner.inspector()
    }

    /// Load one named scenario from a declaration file, retargeted at the
    /// stack directory.
    pub fn scenario(&self, file: &str, name: &str) -> Result<Scenario> {
        let path = Self::scenarios_dir().join(file);
        let mut scenario = scenario::load_file(&path, &self.toolchain.config.default_region)?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                VerifyError::Configuration(format!("no scenario '{name}' in {}", path.display()))
            })?;

        scenario.env.working_dir = self.toolchain.stack_dir.clone();
        scenario.validate()?;
        Ok(scenario)
    }

    /// Run one scenario to completion, teardown included.
    pub async fn run(&self, scenario: Scenario) -> ScenarioResult {
        info!(
            target: "env_tests.stack",
            scenario = %scenario.name,
            stack_dir = %self.toolchain.stack_dir.display(),
            "Running scenario against live stack"
        );
        self.runner.run(scenario, CancellationToken::new()).await
    }
}

/// Install the log subscriber unless another harness already has one.
fn init_tracing_once() {
    TRACING.call_once(|| {
        if let Err(e) = observability::init_tracing(false) {
            debug!(
                target: "env_tests.stack",
                error = %e,
                "Using the already installed tracing subscriber"
            );
        }
    });
}

/// Panic with the rendered report unless the scenario passed.
pub fn assert_passed(result: &ScenarioResult) {
    if !result.passed {
        let mut aggregator = Aggregator::new();
        aggregator.record(result.clone());
        panic!(
            "scenario '{}' failed:\n{}",
            result.name,
            aggregator.finish().render_text()
        );
    }
}

/// The assertion recorded for `label` (`subject: path`).
pub fn assertion<'a>(result: &'a ScenarioResult, label: &str) -> Option<&'a AssertionResult> {
    result.assertions.iter().find(|a| a.label() == label)
}

/// Identifier of the first inspected resource whose subject starts with
/// `kind`, e.g. the VPC id from `vpc vpc-0abc`.
pub fn inspected_id(result: &ScenarioResult, kind: &str) -> Option<String> {
    result.assertions.iter().find_map(|a| {
        a.subject
            .as_deref()
            .and_then(|s| s.strip_prefix(kind))
            .and_then(|rest| rest.strip_prefix(' '))
            .map(str::to_string)
    })
}
