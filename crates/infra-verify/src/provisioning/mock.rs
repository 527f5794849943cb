//! Mock IaC tool for testing.
//!
//! Records every call and returns scripted results. Used by unit tests in
//! this crate and by the integration tests under `tests/`.

use super::{IacTool, PlanResult};
use crate::environment::{EnvConfig, OutputSet};
use crate::errors::{Result, VerifyError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Scripted IaC tool.
pub struct MockIacTool {
    outputs: OutputSet,
    /// Plan results returned in order; the last one repeats.
    plan_results: Mutex<VecDeque<PlanResult>>,
    init_error: Option<String>,
    plan_error: Option<String>,
    apply_error: Option<String>,
    /// Number of apply calls that fail before apply starts succeeding.
    apply_failures_left: AtomicU32,
    destroy_error: Option<String>,
    apply_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    apply_count: AtomicUsize,
    destroy_count: AtomicUsize,
    blocking_destroy_count: AtomicUsize,
}

impl Default for MockIacTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIacTool {
    /// A tool where every command succeeds, plans are no-ops and there are
    /// no outputs.
    pub fn new() -> Self {
        Self {
            outputs: OutputSet::default(),
            plan_results: Mutex::new(VecDeque::new()),
            init_error: None,
            plan_error: None,
            apply_error: None,
            apply_failures_left: AtomicU32::new(0),
            destroy_error: None,
            apply_delay: None,
            calls: Mutex::new(Vec::new()),
            apply_count: AtomicUsize::new(0),
            destroy_count: AtomicUsize::new(0),
            blocking_destroy_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: OutputSet) -> Self {
        self.outputs = outputs;
        self
    }

    /// Plans returned in sequence; the last one repeats.
    #[must_use]
    pub fn with_plan_results(self, results: Vec<PlanResult>) -> Self {
        *self
            .plan_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = results.into();
        self
    }

    #[must_use]
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    #[must_use]
    pub fn failing_plan(mut self, message: impl Into<String>) -> Self {
        self.plan_error = Some(message.into());
        self
    }

    /// Every apply fails with `message`.
    #[must_use]
    pub fn failing_apply(self, message: impl Into<String>) -> Self {
        self.failing_apply_times(u32::MAX, message)
    }

    /// The first `times` applies fail with `message`, later ones succeed.
    #[must_use]
    pub fn failing_apply_times(mut self, times: u32, message: impl Into<String>) -> Self {
        self.apply_error = Some(message.into());
        self.apply_failures_left = AtomicU32::new(times);
        self
    }

    #[must_use]
    pub fn failing_destroy(mut self, message: impl Into<String>) -> Self {
        self.destroy_error = Some(message.into());
        self
    }

    /// Apply sleeps this long before returning.
    #[must_use]
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    /// Commands invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }

    /// Successful and failed destroys, async and blocking.
    pub fn destroy_count(&self) -> usize {
        self.destroy_count.load(Ordering::SeqCst) + self.blocking_destroy_count()
    }

    pub fn blocking_destroy_count(&self) -> usize {
        self.blocking_destroy_count.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.to_string());
    }
}

#[async_trait::async_trait]
impl IacTool for MockIacTool {
    async fn init(&self, _env: &EnvConfig) -> Result<()> {
        self.record("init");
        match &self.init_error {
            Some(message) => Err(VerifyError::Provisioning(message.clone())),
            None => Ok(()),
        }
    }

    async fn plan(&self, _env: &EnvConfig) -> Result<PlanResult> {
        self.record("plan");
        if let Some(message) = &self.plan_error {
            return Err(VerifyError::Provisioning(message.clone()));
        }
        let mut queue = self
            .plan_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let result = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(result.unwrap_or_else(PlanResult::no_changes))
    }

    async fn apply(&self, _env: &EnvConfig) -> Result<()> {
        self.record("apply");
        self.apply_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = &self.apply_error {
            let failing = self
                .apply_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok();
            if failing {
                return Err(VerifyError::Provisioning(message.clone()));
            }
        }
        Ok(())
    }

    async fn output(&self, _env: &EnvConfig) -> Result<OutputSet> {
        self.record("output");
        Ok(self.outputs.clone())
    }

    async fn destroy(&self, _env: &EnvConfig) -> Result<()> {
        self.record("destroy");
        self.destroy_count.fetch_add(1, Ordering::SeqCst);
        match &self.destroy_error {
            Some(message) => Err(VerifyError::Provisioning(message.clone())),
            None => Ok(()),
        }
    }

    fn destroy_blocking(&self, _env: &EnvConfig) -> Result<()> {
        self.record("destroy_blocking");
        self.blocking_destroy_count.fetch_add(1, Ordering::SeqCst);
        match &self.destroy_error {
            Some(message) => Err(VerifyError::Provisioning(message.clone())),
            None => Ok(()),
        }
    }
}
