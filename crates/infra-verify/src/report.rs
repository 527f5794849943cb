//! Result aggregation and reporting.
//!
//! Scenario tasks send their [`ScenarioResult`] over a channel to a single
//! collecting task. Nothing else touches the aggregate, so there is no
//! shared mutable state between scenarios.

use crate::errors::Result;
use crate::runner::ScenarioResult;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Collects scenario results in completion order.
#[derive(Debug)]
pub struct Aggregator {
    results: Vec<ScenarioResult>,
    started: Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, result: ScenarioResult) {
        debug!(
            target: "infra_verify.report",
            scenario = %result.name,
            passed = result.passed,
            "Result recorded"
        );
        self.results.push(result);
    }

    /// Spawn a collecting task. The summary is produced once every sender
    /// has been dropped.
    pub fn spawn(buffer: usize) -> (mpsc::Sender<ScenarioResult>, JoinHandle<Summary>) {
        let (tx, mut rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(async move {
            let mut aggregator = Aggregator::new();
            while let Some(result) = rx.recv().await {
                aggregator.record(result);
            }
            aggregator.finish()
        });
        (tx, handle)
    }

    /// Summary of what has been recorded so far.
    pub fn summary(&self) -> Summary {
        summarize(self.results.clone(), self.started)
    }

    pub fn finish(self) -> Summary {
        summarize(self.results, self.started)
    }
}

fn summarize(results: Vec<ScenarioResult>, started: Instant) -> Summary {
    let passed = results.iter().filter(|r| r.passed).count();
    let failures = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.clone())
        .collect();
    Summary {
        total: results.len(),
        passed,
        failed: results.len() - passed,
        failures,
        duration: started.elapsed(),
        results,
    }
}

/// Aggregate outcome of a suite.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Names of failed scenarios, completion order.
    pub failures: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Completion order.
    pub results: Vec<ScenarioResult>,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Failed scenarios in completion order.
    pub fn failed_results(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Process exit code: 0 when every scenario passed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.all_passed())
    }

    /// Human-readable report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        for result in &self.results {
            let status = if result.passed { "ok  " } else { "FAIL" };
            let _ = writeln!(
                out,
                "{status} {} ({}, {} assertion(s), {:.1}s)",
                result.name,
                result.mode,
                result.assertions.len(),
                result.duration.as_secs_f64()
            );
        }

        if self.failed > 0 {
            out.push_str("\nFailures:\n");
        }
        for result in self.failed_results() {
            let run = result.run_id.as_deref().unwrap_or("-");
            let _ = writeln!(out, "\n{} (run {run})", result.name);
            if let Some(error) = &result.error {
                let _ = writeln!(out, "  error: {error}");
            }
            if let Some(error) = &result.teardown_error {
                let _ = writeln!(out, "  teardown: {error}");
            }
            for assertion in result.failed_assertions() {
                let _ = write!(out, "  x {} {}", assertion.label(), assertion.predicate);
                match (&assertion.observed, &assertion.detail) {
                    (_, Some(detail)) => {
                        let _ = writeln!(out, ": {detail}");
                    }
                    (Some(observed), None) => {
                        let _ = writeln!(out, ": observed {}", compact(observed));
                    }
                    (None, None) => out.push('\n'),
                }
            }
        }

        let _ = writeln!(
            out,
            "\n{} scenario(s): {} passed, {} failed in {:.1}s",
            self.total,
            self.passed,
            self.failed,
            self.duration.as_secs_f64()
        );
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the JSON report to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

fn serialize_millis<S: serde::Serializer>(
    d: &Duration,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
