//! infra-verify
//!
//! Provisions ephemeral cloud environments with an IaC tool, inspects the
//! live resources, evaluates declarative expectations against them and
//! always tears the environment down again.
//!
//! # Architecture
//!
//! ```text
//! scenario (declarations) -> suite -> runner -> provisioning (IacTool)
//!                                          \-> inspector (CloudApi) -> assertions
//!                                          \-> drift
//!                           suite -> report
//! ```
//!
//! # Modules
//!
//! - `assertions` - Field paths, predicates and assertion results
//! - `config` - Runner configuration from environment
//! - `drift` - Post-apply no-op plan check
//! - `environment` - Environment configuration, handles and outputs
//! - `errors` - Error taxonomy
//! - `inspector` - Typed snapshots of live resources
//! - `observability` - Tracing subscriber setup
//! - `provisioning` - IaC lifecycle driver
//! - `report` - Result aggregation and rendering
//! - `runner` - Per-scenario state machine with guaranteed teardown
//! - `scenario` - Scenario model and declaration files
//! - `suite` - Parallel execution with cancellation

pub mod assertions;
pub mod config;
pub mod drift;
pub mod environment;
pub mod errors;
pub mod inspector;
pub mod observability;
pub mod provisioning;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod suite;

pub use errors::{Result, VerifyError};
