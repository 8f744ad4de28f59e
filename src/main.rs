//! pkgplan-exec v0.1 — entry point
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pkgplan_exec::collaborators::{
    LineProgressReporter, ShellBuildRunner, ShellInstallRunner, TracingAlertSink,
};
use pkgplan_exec::config::{self, ExecutorConfig};
use pkgplan_exec::error::ExecError;
use pkgplan_exec::plan::{PlanConfig, PlanRowInput};
use pkgplan_exec::scheduler::Scheduler;
use pkgplan_exec::schema::{ErrorResponse, Response};

#[derive(Debug, Parser)]
#[command(name = "pkgplan-exec")]
#[command(about = "Bounded-parallelism package build/install plan executor", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the plan file (a JSON array of plan rows).
    #[arg(long)]
    plan: PathBuf,

    /// Target library directory packages are built for and installed into.
    #[arg(long)]
    lib: Option<String>,

    /// Number of concurrent build/install worker slots.
    #[arg(long = "num-workers")]
    num_workers: Option<usize>,

    /// Optional `pkgplan.toml` defaults file (see README).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell command template for build workers (`{source}`, `{tmp_dir}`,
    /// `{lib}` placeholders).
    #[arg(long, default_value = "R CMD INSTALL --build --library={lib} {source}")]
    build_template: String,

    /// Shell command template for install workers (`{archive}`, `{lib}`
    /// placeholders).
    #[arg(long, default_value = "R CMD INSTALL --library={lib} {archive}")]
    install_template: String,

    /// Scratch directory for build artifacts (defaults to a fresh tempdir).
    #[arg(long)]
    tmp_root: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        if let Some(exec_err) = e.downcast_ref::<ExecError>() {
            ErrorResponse::new(error_code(exec_err), format!("{e:#}"), false).print();
        } else {
            ErrorResponse::new("internal_error", format!("{e:#}"), false).print();
        }
        std::process::exit(1);
    }
}

fn error_code(err: &ExecError) -> &'static str {
    match err {
        ExecError::InvalidInput(_) => "invalid_input",
        ExecError::SpawnFailure { .. } => "spawn_failure",
        ExecError::BuildFailure { .. } => "build_failure",
        ExecError::InstallFailure { .. } => "install_failure",
        ExecError::CompletionAccessorFailure { .. } => "completion_accessor_failure",
        ExecError::SchedulerDeadlock { .. } => "scheduler_deadlock",
        ExecError::Io(_) => "io_error",
        ExecError::Serde(_) => "serde_error",
    }
}

fn run(cli: Cli) -> Result<()> {
    let plan_contents = std::fs::read_to_string(&cli.plan)
        .with_context(|| format!("reading plan file {}", cli.plan.display()))?;
    let inputs: Vec<PlanRowInput> = serde_json::from_str(&plan_contents)
        .with_context(|| format!("parsing plan file {}", cli.plan.display()))?;
    let rows = inputs.into_iter().map(PlanRowInput::into_row).collect();

    let lib = config::resolve_lib(cli.lib.as_deref(), cli.config.as_deref());
    let num_workers = config::resolve_num_workers(cli.num_workers, cli.config.as_deref());
    let exec_config = ExecutorConfig::new(lib.clone(), num_workers)?;

    let tmp_root = match cli.tmp_root {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating tmp_root {}", dir.display()))?;
            dir
        }
        None => std::env::temp_dir().join(format!("pkgplan-exec-{}", std::process::id())),
    };

    let mut scheduler = Scheduler::new(
        Box::new(ShellBuildRunner {
            template: cli.build_template,
        }),
        Box::new(ShellInstallRunner {
            template: cli.install_template,
        }),
        Box::new(TracingAlertSink),
        Box::new(LineProgressReporter::default()),
        tmp_root,
    );

    let report = scheduler.execute(
        rows,
        PlanConfig {
            lib: exec_config.lib,
            num_workers: exec_config.num_workers,
        },
    )?;

    Response::new("execution_report", report).print();
    Ok(())
}
