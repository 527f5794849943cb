//! P1 Tests: Drift Detection
//!
//! Applies the stack and plans again. The second plan must be a no-op;
//! anything else means the configuration does not converge.

#![cfg(feature = "drift")]

use env_tests::fixtures::stack::assertion;
use env_tests::fixtures::{assert_passed, StackFixture};
use serial_test::serial;

#[tokio::test]
#[serial(stack)]
async fn test_no_drift_after_apply() {
    let fixture = StackFixture::new()
        .await
        .expect("Preflight failed - run the 00_preflight tests for details");
    let scenario = fixture
        .scenario("drift.json", "drift")
        .expect("drift scenario should load");

    let result = fixture.run(scenario).await;

    assert_passed(&result);
    assert_eq!(result.mode, "drift_check");

    let drift = assertion(&result, "drift: plan.change_count").expect("drift assertion");
    assert_eq!(drift.observed, Some(serde_json::Value::from(0)));
    assert!(result.teardown_error.is_none());
}
