//! Drift detection.
//!
//! After apply, a second plan must be a no-op. Pending changes are a failed
//! assertion that names every resource the plan would touch; they are not
//! an error.

use crate::assertions::AssertionResult;
use crate::environment::EnvironmentHandle;
use crate::errors::Result;
use crate::provisioning::{PlanResult, ProvisioningDriver};
use serde_json::Value;
use tracing::{info, warn};

/// Path recorded on drift assertions.
pub const DRIFT_PATH: &str = "plan.change_count";

/// Turn a post-apply plan into the drift assertion.
pub fn drift_assertion(plan: &PlanResult) -> AssertionResult {
    let detail = if plan.is_noop() {
        None
    } else if plan.changes.is_empty() {
        Some(format!("{} pending change(s)", plan.change_count))
    } else {
        let changed: Vec<String> = plan
            .changes
            .iter()
            .map(|c| format!("{} ({})", c.address, c.action))
            .collect();
        Some(format!("drift detected: {}", changed.join(", ")))
    };

    AssertionResult {
        subject: Some("drift".to_string()),
        path: DRIFT_PATH.to_string(),
        predicate: "equals 0".to_string(),
        passed: plan.is_noop(),
        observed: Some(Value::from(plan.change_count)),
        expected: Some(Value::from(0)),
        detail,
    }
}

/// Re-plan an applied environment and check that nothing would change.
pub async fn check_drift(
    driver: &ProvisioningDriver,
    handle: &mut EnvironmentHandle,
) -> Result<AssertionResult> {
    let plan = driver.plan(handle).await?;
    let assertion = drift_assertion(&plan);

    if assertion.passed {
        info!(
            target: "infra_verify.drift",
            run_id = %handle.run_id(),
            "No drift after apply"
        );
    } else {
        warn!(
            target: "infra_verify.drift",
            run_id = %handle.run_id(),
            change_count = plan.change_count,
            detail = assertion.detail.as_deref().unwrap_or_default(),
            "Drift detected after apply"
        );
    }

    Ok(assertion)
}
