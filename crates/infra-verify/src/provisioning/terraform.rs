//! Terraform CLI implementation of [`IacTool`].
//!
//! Every call spawns one `terraform` process in the environment's working
//! directory. Plain variables are passed as `-var name=value`; sensitive
//! variables go through `TF_VAR_<name>` so they never appear in the process
//! argument list or in error messages.
//!
//! A call whose future is dropped (cancellation or a lifecycle timeout)
//! interrupts terraform with SIGINT instead of killing it, so it can
//! persist state and release its lock. The next call in the same working
//! directory waits for that graceful stop, bounded by the interrupt grace
//! period, before it starts.

use super::{IacTool, PlanResult, PlannedChange};
use crate::environment::{EnvConfig, OutputSet};
use crate::errors::{Result, VerifyError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum length of tool output quoted in error messages.
const MAX_ERROR_OUTPUT_LEN: usize = 2048;

/// `terraform plan -detailed-exitcode`: succeeded, empty diff.
const PLAN_EXIT_NO_CHANGES: i32 = 0;

/// `terraform plan -detailed-exitcode`: succeeded, non-empty diff.
const PLAN_EXIT_CHANGES: i32 = 2;

/// Time an interrupted terraform gets to stop before it is killed.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(120);

/// Destroy waits this long for a state lock held by a process that is
/// still shutting down.
const DESTROY_LOCK_TIMEOUT: &str = "-lock-timeout=5m";

/// Background tasks waiting for interrupted processes, per state directory.
type Interrupted = Arc<Mutex<HashMap<PathBuf, Vec<JoinHandle<()>>>>>;

/// Runs the `terraform` binary.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: PathBuf,
    interrupt_grace: Duration,
    interrupted: Interrupted,
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            interrupted: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, env: &EnvConfig, args: Vec<String>) -> Result<Output> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let state_key = env.state_key();

        self.wait_for_interrupted(&state_key).await;

        debug!(
            target: "infra_verify.provisioning.terraform",
            subcommand = %subcommand,
            working_dir = %env.working_dir.display(),
            "Running terraform"
        );

        let spawn_error = |e: std::io::Error| {
            VerifyError::Provisioning(format!(
                "failed to run {} {subcommand}: {e}",
                self.binary.display()
            ))
        };

        let child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .current_dir(&env.working_dir)
            .envs(tool_env(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let mut running = RunningTool::new(child, state_key, self);
        running.output().await.map_err(spawn_error)
    }

    async fn run_checked(&self, env: &EnvConfig, args: Vec<String>) -> Result<Output> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let output = self.run(env, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_error(&subcommand, &output, env))
        }
    }

    async fn wait_for_interrupted(&self, state_key: &Path) {
        let pending = lock(&self.interrupted)
            .remove(state_key)
            .unwrap_or_default();

        for reaper in pending {
            debug!(
                target: "infra_verify.provisioning.terraform",
                working_dir = %state_key.display(),
                "Waiting for interrupted terraform to stop"
            );
            if let Err(e) = reaper.await {
                warn!(
                    target: "infra_verify.provisioning.terraform",
                    error = %e,
                    "Interrupted terraform reaper failed"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A spawned terraform process. Dropped before completion, it interrupts
/// the process and hands it to a background task that drains its output
/// and kills it once the grace period runs out.
struct RunningTool {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    state_key: PathBuf,
    grace: Duration,
    interrupted: Interrupted,
}

impl RunningTool {
    fn new(mut child: Child, state_key: PathBuf, cli: &TerraformCli) -> Self {
        Self {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child: Some(child),
            state_key,
            grace: cli.interrupt_grace,
            interrupted: Arc::clone(&cli.interrupted),
        }
    }

    async fn output(&mut self) -> std::io::Result<Output> {
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other("process already collected"));
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (status, _, _) = tokio::try_join!(
            child.wait(),
            read_pipe(self.stdout.as_mut(), &mut stdout),
            read_pipe(self.stderr.as_mut(), &mut stderr),
        )?;

        self.child = None;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

impl Drop for RunningTool {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        // Outside a runtime the child is killed when dropped.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        interrupt(&mut child);
        warn!(
            target: "infra_verify.provisioning.terraform",
            pid = child.id(),
            working_dir = %self.state_key.display(),
            grace_secs = self.grace.as_secs(),
            "Interrupted terraform, waiting for it to stop"
        );

        let grace = self.grace;
        let mut stdout = self.stdout.take();
        let mut stderr = self.stderr.take();
        let reaper = runtime.spawn(async move {
            // Terraform exits on a broken stdout, so keep the pipes drained.
            let stop = async {
                let (mut out_sink, mut err_sink) = (Vec::new(), Vec::new());
                let _drained = tokio::join!(
                    read_pipe(stdout.as_mut(), &mut out_sink),
                    read_pipe(stderr.as_mut(), &mut err_sink),
                );
                child.wait().await
            };
            let stopped = tokio::time::timeout(grace, stop).await;
            if stopped.is_err() {
                warn!(
                    target: "infra_verify.provisioning.terraform",
                    "Terraform ignored the interrupt, killing it"
                );
                if let Err(e) = child.kill().await {
                    warn!(
                        target: "infra_verify.provisioning.terraform",
                        error = %e,
                        "Failed to kill terraform"
                    );
                }
            }
        });

        lock(&self.interrupted)
            .entry(self.state_key.clone())
            .or_default()
            .push(reaper);
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(
    pipe: Option<&mut R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read_to_end(buf).await,
        None => Ok(0),
    }
}

/// Ask the process to stop the way Ctrl-C would.
#[cfg(unix)]
fn interrupt(child: &mut Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory effects; the pid belongs to a child
    // that has not been reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        warn!(
            target: "infra_verify.provisioning.terraform",
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to interrupt terraform"
        );
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(
            target: "infra_verify.provisioning.terraform",
            error = %e,
            "Failed to stop terraform"
        );
    }
}

#[async_trait::async_trait]
impl IacTool for TerraformCli {
    async fn init(&self, env: &EnvConfig) -> Result<()> {
        self.run_checked(env, init_args()).await?;
        Ok(())
    }

    async fn plan(&self, env: &EnvConfig) -> Result<PlanResult> {
        let output = self.run(env, plan_args(env)).await?;
        let exit_code = output.status.code().unwrap_or(-1);

        match exit_code {
            PLAN_EXIT_NO_CHANGES | PLAN_EXIT_CHANGES => {
                parse_plan_stream(&String::from_utf8_lossy(&output.stdout), exit_code)
            }
            _ => Err(command_error("plan", &output, env)),
        }
    }

    async fn apply(&self, env: &EnvConfig) -> Result<()> {
        self.run_checked(env, lifecycle_args("apply", env)).await?;
        Ok(())
    }

    async fn output(&self, env: &EnvConfig) -> Result<OutputSet> {
        let output = self.run_checked(env, output_args()).await?;
        let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        OutputSet::from_terraform_json(&doc)
    }

    async fn destroy(&self, env: &EnvConfig) -> Result<()> {
        self.run_checked(env, destroy_args(env)).await?;
        Ok(())
    }

    fn destroy_blocking(&self, env: &EnvConfig) -> Result<()> {
        let output = std::process::Command::new(&self.binary)
            .args(destroy_args(env))
            .current_dir(&env.working_dir)
            .envs(tool_env(env))
            .output()
            .map_err(|e| {
                VerifyError::Provisioning(format!(
                    "failed to run {} destroy: {e}",
                    self.binary.display()
                ))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(command_error("destroy", &output, env))
        }
    }
}

fn init_args() -> Vec<String> {
    ["init", "-input=false", "-no-color"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn output_args() -> Vec<String> {
    ["output", "-json", "-no-color"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn plan_args(env: &EnvConfig) -> Vec<String> {
    let mut args: Vec<String> = ["plan", "-input=false", "-no-color", "-json", "-detailed-exitcode"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(var_args(env));
    args
}

fn lifecycle_args(subcommand: &str, env: &EnvConfig) -> Vec<String> {
    let mut args: Vec<String> = [subcommand, "-input=false", "-no-color", "-auto-approve"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(var_args(env));
    args
}

fn destroy_args(env: &EnvConfig) -> Vec<String> {
    let mut args = lifecycle_args("destroy", env);
    args.insert(1, DESTROY_LOCK_TIMEOUT.to_string());
    args
}

fn var_args(env: &EnvConfig) -> Vec<String> {
    env.variables
        .iter()
        .filter(|(_, value)| !value.is_sensitive())
        .flat_map(|(name, value)| ["-var".to_string(), format!("{name}={}", value.expose())])
        .collect()
}

fn tool_env(env: &EnvConfig) -> Vec<(String, String)> {
    let mut vars = vec![
        ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
        ("TF_INPUT".to_string(), "0".to_string()),
    ];
    vars.extend(
        env.variables
            .iter()
            .filter(|(_, value)| value.is_sensitive())
            .map(|(name, value)| (format!("TF_VAR_{name}"), value.expose().to_string())),
    );
    vars
}

fn command_error(subcommand: &str, output: &Output, env: &EnvConfig) -> VerifyError {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let diagnostics = diagnostics_from_stream(&stdout);
    let detail = if !diagnostics.is_empty() {
        diagnostics.join("; ")
    } else if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };

    VerifyError::Provisioning(format!(
        "terraform {subcommand} exited with {}: {}",
        output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string()),
        sanitize_tool_output(&detail, env)
    ))
}

/// Remove sensitive variable values and truncate to the last
/// `MAX_ERROR_OUTPUT_LEN` bytes, where terraform prints the actual error.
pub(crate) fn sanitize_tool_output(text: &str, env: &EnvConfig) -> String {
    let mut sanitized = text.to_string();
    for value in env.variables.values().filter(|v| v.is_sensitive()) {
        if !value.expose().is_empty() {
            sanitized = sanitized.replace(value.expose(), "[REDACTED]");
        }
    }

    if sanitized.len() > MAX_ERROR_OUTPUT_LEN {
        let mut start = sanitized.len() - MAX_ERROR_OUTPUT_LEN;
        while !sanitized.is_char_boundary(start) {
            start += 1;
        }
        format!("[truncated]...{}", sanitized.get(start..).unwrap_or_default())
    } else {
        sanitized
    }
}

/// One line of the `terraform plan -json` machine-readable stream.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "@level", default)]
    level: Option<String>,
    #[serde(rename = "@message", default)]
    message: Option<String>,
    #[serde(default)]
    change: Option<StreamChange>,
    #[serde(default)]
    changes: Option<ChangeSummary>,
}

#[derive(Debug, Deserialize)]
struct StreamChange {
    resource: StreamResource,
    action: String,
}

#[derive(Debug, Deserialize)]
struct StreamResource {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct ChangeSummary {
    #[serde(default)]
    add: usize,
    #[serde(default)]
    change: usize,
    #[serde(default)]
    remove: usize,
}

/// Build a [`PlanResult`] from the `-json` plan stream.
///
/// The change count comes from the `change_summary` message; when absent the
/// number of `planned_change` messages is used. Non-JSON lines are ignored.
pub(crate) fn parse_plan_stream(stream: &str, exit_code: i32) -> Result<PlanResult> {
    let mut changes = Vec::new();
    let mut summary_count = None;

    for line in stream.lines().filter(|l| l.trim_start().starts_with('{')) {
        let Ok(message) = serde_json::from_str::<StreamMessage>(line) else {
            continue;
        };

        match message.kind.as_str() {
            "planned_change" => {
                if let Some(change) = message.change {
                    changes.push(PlannedChange {
                        address: change.resource.addr,
                        action: change.action,
                    });
                }
            }
            "change_summary" => {
                if let Some(summary) = message.changes {
                    summary_count = Some(summary.add + summary.change + summary.remove);
                }
            }
            _ => {}
        }
    }

    let change_count = summary_count.unwrap_or(changes.len());

    if exit_code == PLAN_EXIT_CHANGES && change_count == 0 && changes.is_empty() {
        return Err(VerifyError::Provisioning(
            "plan reported changes but the change stream was empty".to_string(),
        ));
    }

    Ok(PlanResult {
        change_count,
        exit_code,
        changes,
    })
}

fn diagnostics_from_stream(stream: &str) -> Vec<String> {
    stream
        .lines()
        .filter_map(|line| serde_json::from_str::<StreamMessage>(line).ok())
        .filter(|m| m.kind == "diagnostic" && m.level.as_deref() == Some("error"))
        .filter_map(|m| m.message)
        .collect()
}
