//! Parallel suite execution.
//!
//! Each scenario runs on its own task, bounded by a semaphore. Scenarios
//! sharing a working directory share IaC state, so they never overlap. A
//! panicking scenario is caught at its task boundary, torn down by its
//! guard, and reported as failed without affecting the others.

use crate::report::{Aggregator, Summary};
use crate::runner::{ScenarioResult, ScenarioRunner};
use crate::scenario::Scenario;
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Run every scenario with at most `parallelism` in flight.
///
/// Cancelling `cancel` stops scenarios that have not started and makes
/// running ones skip to teardown. The summary always covers every scenario.
#[instrument(skip_all, name = "infra_verify.suite")]
pub async fn run_suite(
    runner: Arc<ScenarioRunner>,
    scenarios: Vec<Scenario>,
    parallelism: usize,
    cancel: CancellationToken,
) -> Summary {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let (results, collector) = Aggregator::spawn(scenarios.len());
    let mut tasks = JoinSet::new();
    let mut dir_locks: HashMap<PathBuf, Arc<Mutex<()>>> = HashMap::new();

    info!(
        target: "infra_verify.suite",
        scenarios = scenarios.len(),
        parallelism,
        "Starting suite"
    );

    for scenario in scenarios {
        let runner = Arc::clone(&runner);
        let semaphore = Arc::clone(&semaphore);
        let token = cancel.child_token();
        let results = results.clone();
        let dir_lock = Arc::clone(dir_locks.entry(scenario.env.state_key()).or_default());

        tasks.spawn(async move {
            // Cancellation while queued skips the waits; the runner then
            // returns without provisioning. The directory lock comes first
            // so a waiting scenario never holds a permit.
            let _dir_guard = tokio::select! {
                guard = dir_lock.lock_owned() => Some(guard),
                _ = token.cancelled() => None,
            };
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = token.cancelled() => None,
            };

            let name = scenario.name.clone();
            let mode = scenario.mode.name();
            let run = tokio::spawn(async move { runner.run(scenario, token).await });

            let result = match run.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(
                        target: "infra_verify.suite",
                        scenario = %name,
                        panic = %message,
                        "Scenario task panicked"
                    );
                    ScenarioResult::panicked(name, mode, message)
                }
                Err(e) => ScenarioResult::panicked(name, mode, e.to_string()),
            };

            if results.send(result).await.is_err() {
                warn!(target: "infra_verify.suite", "Result collector closed early");
            }
        });
    }
    drop(results);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(target: "infra_verify.suite", error = %e, "Suite task failed");
        }
    }

    let summary = match collector.await {
        Ok(summary) => summary,
        Err(e) => {
            error!(target: "infra_verify.suite", error = %e, "Result collector failed");
            Aggregator::new().finish()
        }
    };

    info!(
        target: "infra_verify.suite",
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        "Suite complete"
    );

    summary
}

/// Cancel `cancel` on SIGINT or SIGTERM.
pub fn cancel_on_shutdown_signal(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(target: "infra_verify.suite", "Received SIGINT, cancelling scenarios"),
                Err(e) => {
                    error!(target: "infra_verify.suite", error = %e, "Failed to listen for SIGINT");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!(target: "infra_verify.suite", "Received SIGTERM, cancelling scenarios");
                }
                Err(e) => {
                    error!(target: "infra_verify.suite", error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
            () = cancel.cancelled() => return,
        }

        cancel.cancel();
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |s| (*s).to_string()),
    }
}
