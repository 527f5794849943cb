//! Live Infrastructure Test Suite
//!
//! This crate runs infra-verify scenarios against a real cloud account. The
//! stack under test is a terraform configuration (VPC, subnets, RDS, Redis,
//! ECS, CloudWatch logs); the tests provision it, check the live resources
//! and always destroy it again.
//!
//! # Features
//!
//! - `smoke`: Toolchain and credentials preflight, declaration validation,
//!   plan-only validation (no resources created)
//! - `provision`: Apply the stack and check live resources (15-25min)
//! - `drift`: Apply the stack and require a no-op follow-up plan
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. `terraform` and `aws` in PATH (or `INFRA_VERIFY_TERRAFORM_BIN` /
//!    `INFRA_VERIFY_AWS_BIN`)
//! 2. AWS credentials for a disposable account
//! 3. `ENV_TESTS_STACK_DIR` pointing at the terraform configuration
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs 0 env-tests (no default features)
//! cargo test
//!
//! # Preflight and plan validation only
//! cargo test -p env-tests --features smoke
//!
//! # Full suite
//! cargo test -p env-tests --features all
//! ```

pub mod eventual;
pub mod fixtures;
pub mod preflight;
