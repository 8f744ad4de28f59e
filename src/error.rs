//! Error taxonomy for the plan executor.
//!
//! Mirrors the table in SPEC_FULL.md §7: every fatal condition the scheduler
//! can hit gets its own variant so callers can branch on `ExecError` kind
//! instead of parsing message strings.

use thiserror::Error;

/// Errors raised while validating input or executing a plan.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Plan missing required columns, `lib` not a valid path, or
    /// `num_workers < 1`. Raised before any worker is spawned.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A collaborator (`BuildRunner`/`InstallRunner`) failed to start a
    /// child process.
    #[error("failed to spawn {kind} worker for package {package}: {source}")]
    SpawnFailure {
        kind: &'static str,
        package: String,
        #[source]
        source: std::io::Error,
    },

    /// A build worker exited non-zero.
    #[error("build failed for package {package} (exit code {exit_code:?})")]
    BuildFailure {
        package: String,
        exit_code: Option<i32>,
    },

    /// An install worker exited non-zero.
    #[error("install failed for package {package} (exit code {exit_code:?})")]
    InstallFailure {
        package: String,
        exit_code: Option<i32>,
    },

    /// The completion artifact accessor (built-file path lookup) raised.
    #[error("could not locate built artifact for package {package}: {reason}")]
    CompletionAccessorFailure { package: String, reason: String },

    /// The selector found no selectable task while rows remain unfinished
    /// and no worker is live — unsatisfiable dependencies.
    #[error("scheduler deadlock: no task selectable with {pending} row(s) still pending install")]
    SchedulerDeadlock { pending: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
