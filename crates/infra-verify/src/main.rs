//! infra-verify CLI
//!
//! Loads scenario declarations, runs them against real infrastructure and
//! prints a report. Exit code 0 when every scenario passed, 1 when any
//! failed, 2 on configuration errors.

use anyhow::Context;
use clap::{Parser, Subcommand};
use infra_verify::config::Config;
use infra_verify::observability;
use infra_verify::runner::ScenarioRunner;
use infra_verify::scenario;
use infra_verify::suite::{cancel_on_shutdown_signal, run_suite};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Provision, inspect, assert and tear down cloud environments
#[derive(Parser)]
#[command(name = "infra-verify")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON logs (overrides INFRA_VERIFY_JSON_LOGS)
    #[arg(long, global = true)]
    json_logs: bool,

    /// Region for scenarios that do not name one
    #[arg(long, global = true)]
    region: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios from declaration files
    Run {
        /// Declaration files (JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Scenarios running at once (overrides INFRA_VERIFY_PARALLELISM)
        #[arg(long, short = 'j')]
        parallelism: Option<usize>,

        /// Write a JSON report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Parse and validate declaration files without provisioning
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("infra-verify: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    config.json_logs |= cli.json_logs;
    if let Some(region) = cli.region {
        config.default_region = region;
    }

    if let Err(e) = observability::init_tracing(config.json_logs) {
        eprintln!("infra-verify: failed to initialize tracing: {e}");
    }

    match cli.command {
        Commands::Validate { files } => validate(&config, &files),
        Commands::Run {
            files,
            parallelism,
            report,
        } => {
            if let Some(parallelism) = parallelism {
                config.parallelism = parallelism.max(1);
            }
            match run(&config, &files, report).await {
                Ok(code) => code,
                Err(e) => {
                    error!(target: "infra_verify.cli", error = ?e, "Run aborted");
                    eprintln!("infra-verify: {e:#}");
                    ExitCode::from(EXIT_CONFIG)
                }
            }
        }
    }
}

fn validate(config: &Config, files: &[PathBuf]) -> ExitCode {
    match scenario::load_all(files, &config.default_region) {
        Ok(scenarios) => {
            for s in &scenarios {
                println!("ok   {} ({})", s.name, s.mode.name());
            }
            println!("{} scenario(s) valid", scenarios.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("infra-verify: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(
    config: &Config,
    files: &[PathBuf],
    report: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let scenarios = scenario::load_all(files, &config.default_region)
        .context("failed to load scenarios")?;
    let runner = Arc::new(
        ScenarioRunner::from_config(config).context("invalid runner configuration")?,
    );

    info!(
        target: "infra_verify.cli",
        scenarios = scenarios.len(),
        parallelism = config.parallelism,
        terraform = %config.terraform_bin.display(),
        aws = %config.aws_bin.display(),
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let signals = cancel_on_shutdown_signal(cancel.clone());

    let summary = run_suite(runner, scenarios, config.parallelism, cancel).await;

    signals.abort();

    print!("{}", summary.render_text());

    if let Some(path) = report {
        summary
            .write_json(&path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(target: "infra_verify.cli", path = %path.display(), "Report written");
    }

    Ok(ExitCode::from(summary.exit_code()))
}
