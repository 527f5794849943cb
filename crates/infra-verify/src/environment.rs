//! Environment handles, input variables and output sets.
//!
//! An [`EnvironmentHandle`] identifies one provisioned copy of the
//! infrastructure. It is owned by exactly one scenario run and moves through
//! [`LifecycleState`] under the control of the provisioning driver.

use crate::errors::{Result, VerifyError};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Placeholder replaced with the run identifier in variable values.
pub const RUN_ID_PLACEHOLDER: &str = "${run_id}";

/// Value of one IaC input variable.
///
/// Sensitive values are held in a [`SecretString`] so they are redacted in
/// `Debug` output and never reach logs. They are handed to the tool through
/// its environment rather than its argument list.
#[derive(Clone)]
pub enum VariableValue {
    Plain(String),
    Sensitive(SecretString),
}

impl VariableValue {
    pub fn is_sensitive(&self) -> bool {
        matches!(self, VariableValue::Sensitive(_))
    }

    /// The raw value as passed to the tool.
    pub fn expose(&self) -> &str {
        match self {
            VariableValue::Plain(v) => v,
            VariableValue::Sensitive(v) => v.expose_secret(),
        }
    }

    fn with_run_id(&self, run_id: &str) -> Self {
        match self {
            VariableValue::Plain(v) => VariableValue::Plain(v.replace(RUN_ID_PLACEHOLDER, run_id)),
            VariableValue::Sensitive(v) => VariableValue::Sensitive(SecretString::from(
                v.expose_secret().replace(RUN_ID_PLACEHOLDER, run_id),
            )),
        }
    }
}

impl fmt::Debug for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Plain(v) => write!(f, "{v:?}"),
            VariableValue::Sensitive(_) => write!(f, "[REDACTED]"),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Plain(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Plain(value)
    }
}

/// Configuration a handle is created from.
///
/// Built per scenario and passed by value; never shared between runs.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Directory holding the IaC configuration.
    pub working_dir: PathBuf,

    /// Input variables, ordered by name.
    pub variables: BTreeMap<String, VariableValue>,

    /// Region queried by the inspector.
    pub region: String,
}

impl EnvConfig {
    pub fn new(working_dir: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            variables: BTreeMap::new(),
            region: region.into(),
        }
    }

    /// Add a plain variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .insert(name.into(), VariableValue::Plain(value.into()));
        self
    }

    /// Add a sensitive variable.
    #[must_use]
    pub fn with_secret_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(
            name.into(),
            VariableValue::Sensitive(SecretString::from(value.into())),
        );
        self
    }

    /// Copy of this config with `${run_id}` substituted in every variable.
    #[must_use]
    pub fn for_run(&self, run_id: &str) -> Self {
        Self {
            working_dir: self.working_dir.clone(),
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.with_run_id(run_id)))
                .collect(),
            region: self.region.clone(),
        }
    }

    /// Identity of the IaC state this config drives: the canonical working
    /// directory, or the path as given when it cannot be resolved.
    pub fn state_key(&self) -> PathBuf {
        std::fs::canonicalize(&self.working_dir).unwrap_or_else(|_| self.working_dir.clone())
    }

    /// Reject configs the tool could never run against.
    pub fn validate(&self) -> Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(VerifyError::Configuration(
                "working directory is empty".to_string(),
            ));
        }
        if !self.working_dir.is_dir() {
            return Err(VerifyError::Configuration(format!(
                "working directory {} is not reachable",
                self.working_dir.display()
            )));
        }
        if self.variables.is_empty() {
            return Err(VerifyError::Configuration(format!(
                "no input variables declared for {}",
                self.working_dir.display()
            )));
        }
        Ok(())
    }
}

/// Lifecycle of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Planned,
    Applied,
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Planned => "planned",
            LifecycleState::Applied => "applied",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// One provisioned instance of the infrastructure.
#[derive(Debug)]
pub struct EnvironmentHandle {
    run_id: String,
    config: EnvConfig,
    state: LifecycleState,
    outputs: Option<OutputSet>,
}

impl EnvironmentHandle {
    pub(crate) fn new(run_id: impl Into<String>, config: EnvConfig) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            state: LifecycleState::Uninitialized,
            outputs: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn working_dir(&self) -> &Path {
        &self.config.working_dir
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Outputs read after the last successful apply.
    pub fn outputs(&self) -> Option<&OutputSet> {
        self.outputs.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn set_outputs(&mut self, outputs: OutputSet) {
        self.outputs = Some(outputs);
    }
}

/// Value of one IaC output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputValue {
    Text(String),
    List(Vec<String>),
    /// Any other shape (numbers, maps, nested lists), kept as JSON.
    Json(serde_json::Value),
}

impl OutputValue {
    /// Interpret a raw JSON output value.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => OutputValue::Text(s),
            serde_json::Value::Array(items)
                if items.iter().all(serde_json::Value::is_string) =>
            {
                OutputValue::List(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            serde_json::Value::String(s) => Some(s),
                            _ => None,
                        })
                        .collect(),
                )
            }
            other => OutputValue::Json(other),
        }
    }
}

/// Outputs of one applied environment. Immutable once read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutputSet {
    values: BTreeMap<String, OutputValue>,
}

impl OutputSet {
    pub fn new(values: BTreeMap<String, OutputValue>) -> Self {
        Self { values }
    }

    /// Parse the document printed by `terraform output -json`.
    ///
    /// Each entry is `{"sensitive": bool, "type": ..., "value": ...}`.
    pub fn from_terraform_json(doc: &serde_json::Value) -> Result<Self> {
        let entries = doc.as_object().ok_or_else(|| {
            VerifyError::Provisioning("terraform output is not a JSON object".to_string())
        })?;

        let values = entries
            .iter()
            .map(|(name, entry)| {
                let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
                (name.clone(), OutputValue::from_json(value))
            })
            .collect();

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Result<&OutputValue> {
        self.values
            .get(name)
            .ok_or_else(|| VerifyError::NotFound(format!("output '{name}'")))
    }

    /// A string output.
    pub fn get_string(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            OutputValue::Text(s) => Ok(s),
            other => Err(VerifyError::Configuration(format!(
                "output '{name}' is not a string: {other:?}"
            ))),
        }
    }

    /// A list output.
    pub fn get_list(&self, name: &str) -> Result<&[String]> {
        match self.get(name)? {
            OutputValue::List(items) => Ok(items),
            other => Err(VerifyError::Configuration(format!(
                "output '{name}' is not a list of strings: {other:?}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
