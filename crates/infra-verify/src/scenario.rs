//! Scenario declarations.
//!
//! A scenario names one IaC configuration, its input variables and what to
//! verify once it is provisioned. Declarations are JSON files holding one
//! scenario object or an array of them:
//!
//! ```json
//! {
//!   "name": "security-groups",
//!   "working_dir": "../infra",
//!   "variables": {"region": "us-east-1", "db_password": {"value": "x", "sensitive": true}},
//!   "mode": {"type": "verify", "checks": [
//!     {"kind": "security_group", "id": {"output": "rds_sg_id"},
//!      "expectations": [
//!        {"path": "ip_permissions", "predicate": {"op": "length_equals", "value": 1}}
//!      ]}
//!   ]}
//! }
//! ```

use crate::assertions::Expectation;
use crate::environment::{EnvConfig, OutputSet, VariableValue};
use crate::errors::{Result, VerifyError};
use crate::inspector::ResourceKind;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a check's resource identifier comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdSource {
    Literal(String),
    /// A named output; `index` selects one element of a list output.
    Output {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
}

impl IdSource {
    pub fn literal(id: impl Into<String>) -> Self {
        IdSource::Literal(id.into())
    }

    pub fn output(name: impl Into<String>) -> Self {
        IdSource::Output {
            output: name.into(),
            index: None,
        }
    }

    pub fn output_index(name: impl Into<String>, index: usize) -> Self {
        IdSource::Output {
            output: name.into(),
            index: Some(index),
        }
    }

    /// The concrete identifier, looked up in `outputs` when needed.
    pub fn resolve(&self, outputs: &OutputSet) -> Result<String> {
        match self {
            IdSource::Literal(id) => Ok(id.clone()),
            IdSource::Output {
                output,
                index: None,
            } => Ok(outputs.get_string(output)?.to_string()),
            IdSource::Output {
                output,
                index: Some(index),
            } => outputs
                .get_list(output)?
                .get(*index)
                .cloned()
                .ok_or_else(|| VerifyError::NotFound(format!("output '{output}[{index}]'"))),
        }
    }
}

impl fmt::Display for IdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdSource::Literal(id) => f.write_str(id),
            IdSource::Output {
                output,
                index: None,
            } => write!(f, "output.{output}"),
            IdSource::Output {
                output,
                index: Some(index),
            } => write!(f, "output.{output}[{index}]"),
        }
    }
}

/// Expectations over one live resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Check {
    pub kind: ResourceKind,
    pub id: IdSource,
    pub expectations: Vec<Expectation>,
}

impl Check {
    pub fn new(kind: ResourceKind, id: IdSource, expectations: Vec<Expectation>) -> Self {
        Self {
            kind,
            id,
            expectations,
        }
    }
}

/// What a scenario does after provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioMode {
    /// Apply, then inspect resources and evaluate expectations.
    Verify {
        #[serde(default)]
        checks: Vec<Check>,
        /// Expectations over the output set itself.
        #[serde(default)]
        outputs: Vec<Expectation>,
    },
    /// Apply, then require a no-op plan.
    DriftCheck,
    /// Plan only; optional expectations over the plan result.
    PlanOnly {
        #[serde(default)]
        expectations: Vec<Expectation>,
    },
}

impl ScenarioMode {
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioMode::Verify { .. } => "verify",
            ScenarioMode::DriftCheck => "drift_check",
            ScenarioMode::PlanOnly { .. } => "plan_only",
        }
    }

    fn expectations(&self) -> Box<dyn Iterator<Item = &Expectation> + '_> {
        match self {
            ScenarioMode::Verify { checks, outputs } => Box::new(
                checks
                    .iter()
                    .flat_map(|c| c.expectations.iter())
                    .chain(outputs.iter()),
            ),
            ScenarioMode::DriftCheck => Box::new(std::iter::empty()),
            ScenarioMode::PlanOnly { expectations } => Box::new(expectations.iter()),
        }
    }
}

/// One runnable scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub env: EnvConfig,
    pub mode: ScenarioMode,
}

impl Scenario {
    pub fn new(name: impl Into<String>, env: EnvConfig, mode: ScenarioMode) -> Self {
        Self {
            name: name.into(),
            env,
            mode,
        }
    }

    /// Everything that can be checked without provisioning.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VerifyError::Configuration(
                "scenario name is empty".to_string(),
            ));
        }
        self.env
            .validate()
            .map_err(|e| prefixed(&self.name, e))?;

        if let ScenarioMode::Verify { checks, outputs } = &self.mode {
            if checks.is_empty() && outputs.is_empty() {
                return Err(VerifyError::Configuration(format!(
                    "scenario '{}': verify mode declares no checks",
                    self.name
                )));
            }
        }

        for expectation in self.mode.expectations() {
            expectation
                .validate()
                .map_err(|e| prefixed(&self.name, e))?;
        }
        Ok(())
    }
}

fn prefixed(name: &str, err: VerifyError) -> VerifyError {
    match err {
        VerifyError::Configuration(msg) => {
            VerifyError::Configuration(format!("scenario '{name}': {msg}"))
        }
        other => other,
    }
}

// ----------------------------------------------------------------------------
// Declaration files
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioDecl {
    name: String,
    working_dir: PathBuf,
    #[serde(default)]
    variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    region: Option<String>,
    mode: ScenarioMode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VariableDecl {
    Detailed {
        value: serde_json::Value,
        #[serde(default)]
        sensitive: bool,
    },
    Plain(serde_json::Value),
}

impl VariableDecl {
    fn into_value(self) -> VariableValue {
        match self {
            VariableDecl::Detailed {
                value,
                sensitive: true,
            } => VariableValue::Sensitive(SecretString::from(variable_text(value))),
            VariableDecl::Detailed { value, .. } | VariableDecl::Plain(value) => {
                VariableValue::Plain(variable_text(value))
            }
        }
    }
}

/// Strings pass through; lists, maps and scalars are handed over as JSON
/// text, which the IaC tool accepts as variable syntax.
fn variable_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

impl ScenarioDecl {
    fn into_scenario(self, base_dir: &Path, default_region: &str) -> Scenario {
        let working_dir = if self.working_dir.is_relative() {
            base_dir.join(&self.working_dir)
        } else {
            self.working_dir
        };

        let variables: BTreeMap<String, VariableValue> = self
            .variables
            .into_iter()
            .map(|(name, decl)| (name, decl.into_value()))
            .collect();

        let region = self
            .region
            .or_else(|| match variables.get("region") {
                Some(VariableValue::Plain(region)) => Some(region.clone()),
                _ => None,
            })
            .unwrap_or_else(|| default_region.to_string());

        Scenario {
            name: self.name,
            env: EnvConfig {
                working_dir,
                variables,
                region,
            },
            mode: self.mode,
        }
    }
}

/// Parse declarations from a JSON document. Relative working directories
/// resolve against `base_dir`.
pub fn parse_declarations(
    text: &str,
    base_dir: &Path,
    default_region: &str,
) -> Result<Vec<Scenario>> {
    let invalid =
        |e: serde_json::Error| VerifyError::Configuration(format!("invalid declaration: {e}"));

    let doc: serde_json::Value = serde_json::from_str(text).map_err(invalid)?;
    let decls: Vec<ScenarioDecl> = if doc.is_array() {
        serde_json::from_value(doc).map_err(invalid)?
    } else {
        vec![serde_json::from_value(doc).map_err(invalid)?]
    };

    Ok(decls
        .into_iter()
        .map(|d| d.into_scenario(base_dir, default_region))
        .collect())
}

/// Load one declaration file.
pub fn load_file(path: &Path, default_region: &str) -> Result<Vec<Scenario>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        VerifyError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    parse_declarations(&text, base_dir, default_region).map_err(|e| match e {
        VerifyError::Configuration(msg) => {
            VerifyError::Configuration(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Load and validate every file. Scenario names must be unique across the
/// whole set.
pub fn load_all<P: AsRef<Path>>(paths: &[P], default_region: &str) -> Result<Vec<Scenario>> {
    let mut scenarios = Vec::new();
    for path in paths {
        scenarios.extend(load_file(path.as_ref(), default_region)?);
    }

    let mut seen = HashSet::new();
    for scenario in &scenarios {
        scenario.validate()?;
        if !seen.insert(scenario.name.as_str()) {
            return Err(VerifyError::Configuration(format!(
                "duplicate scenario name '{}'",
                scenario.name
            )));
        }
    }

    Ok(scenarios)
}
