//! P0 Smoke Tests: Toolchain Preflight
//!
//! These tests validate that terraform, the aws CLI and credentials for the
//! test account are usable, and that every declaration under `scenarios/`
//! parses. All other tests depend on these passing.

#![cfg(feature = "smoke")]

use env_tests::fixtures::StackFixture;
use env_tests::preflight::Toolchain;
use infra_verify::scenario;

/// Helper to run preflight for tests.
async fn toolchain() -> Toolchain {
    Toolchain::new()
        .await
        .expect("Preflight failed - install terraform and the aws CLI, and set ENV_TESTS_STACK_DIR")
}

#[tokio::test]
async fn test_terraform_available() {
    let toolchain = toolchain().await;

    let version = toolchain
        .terraform_version()
        .await
        .expect("terraform version should succeed");
    assert!(
        version.starts_with("Terraform v"),
        "Unexpected terraform version output: {version}"
    );
}

#[tokio::test]
async fn test_aws_cli_available() {
    let toolchain = toolchain().await;

    let version = toolchain
        .aws_version()
        .await
        .expect("aws --version should succeed");
    assert!(
        version.starts_with("aws-cli/"),
        "Unexpected aws CLI version output: {version}"
    );
}

#[tokio::test]
async fn test_credentials_valid() {
    let toolchain = toolchain().await;

    let account = toolchain
        .caller_identity()
        .await
        .expect("sts get-caller-identity should succeed with the exported credentials");
    assert_eq!(account.len(), 12, "AWS account ids are 12 digits, got {account}");
    assert!(account.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn test_declarations_valid() {
    let toolchain = toolchain().await;

    let mut files: Vec<_> = std::fs::read_dir(StackFixture::scenarios_dir())
        .expect("scenarios directory should be readable")
        .map(|entry| entry.expect("directory entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    assert!(!files.is_empty(), "No declarations under scenarios/");

    let mut names = Vec::new();
    for file in &files {
        let scenarios = scenario::load_file(file, &toolchain.config.default_region)
            .unwrap_or_else(|e| panic!("{} should parse: {e}", file.display()));
        for mut scenario in scenarios {
            // Declarations point at <workspace>/infra; preflight may override it.
            scenario.env.working_dir = toolchain.stack_dir.clone();
            scenario
                .validate()
                .unwrap_or_else(|e| panic!("{} should validate: {e}", scenario.name));
            names.push(scenario.name);
        }
    }

    assert_eq!(names, vec!["drift", "plan", "stack"]);
}
