//! The authoritative in-memory plan state: immutable row inputs, mutable
//! per-row execution fields, and the residual dependency sets that gate
//! task selection.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How a row's package should be obtained / treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Cran,
    Bioc,
    Standard,
    Local,
    Github,
    Deps,
    Installed,
}

impl PackageType {
    /// Rows of these types are pre-seeded as already built and installed;
    /// they never spawn a worker (spec.md §3 Invariants, Pre-seed).
    pub fn is_preinstalled(self) -> bool {
        matches!(self, PackageType::Deps | PackageType::Installed)
    }
}

/// Tri-state answer to "does this source package need compilation?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeedsCompilation {
    Yes,
    No,
    Unknown,
}

/// Recognised display metadata keys (§6): `RemoteUsername`, `RemoteRepo`,
/// `RemoteSha`. Stored as a map so unrecognised keys round-trip untouched.
pub type Metadata = HashMap<String, String>;

/// `build_time`/`install_time` (spec.md §9 Open Question): a tagged variant
/// instead of an overloaded start-stamp-or-duration field.
#[derive(Debug, Clone, Copy, Default)]
pub enum RowTiming {
    #[default]
    NotStarted,
    Running(Instant),
    Elapsed(Duration),
}

impl RowTiming {
    pub fn start(&mut self) {
        *self = RowTiming::Running(Instant::now());
    }

    /// Finalize a running timer into an elapsed duration. No-op if not running.
    pub fn finish(&mut self) {
        if let RowTiming::Running(start) = *self {
            *self = RowTiming::Elapsed(start.elapsed());
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            RowTiming::Elapsed(d) => Some(*d),
            RowTiming::Running(start) => Some(start.elapsed()),
            RowTiming::NotStarted => None,
        }
    }
}

/// The immutable inputs plus mutable execution fields for one package
/// (spec.md §3 PlanRow).
#[derive(Debug, Clone)]
pub struct PlanRow {
    // ---- immutable inputs ----
    pub package: String,
    pub version: String,
    pub kind: PackageType,
    pub binary: bool,
    pub file: PathBuf,
    pub sources: Vec<PathBuf>,
    pub dependencies: HashSet<String>,
    pub vignettes: bool,
    pub needs_compilation: NeedsCompilation,
    pub metadata: Metadata,
    /// Update status relative to the target library, supplied by the
    /// resolver collaborator; consumed only for the summary (§6).
    pub lib_status: LibStatus,

    // ---- mutable execution fields ----
    pub build_done: bool,
    pub install_done: bool,
    pub build_time: RowTiming,
    pub install_time: RowTiming,
    pub build_error: bool,
    pub install_error: bool,
    pub build_stdout: Vec<String>,
    pub build_stderr: Vec<String>,
    pub install_stdout: Vec<String>,
    pub install_stderr: Vec<String>,
    pub worker_id: Option<String>,
    pub deps_left: HashSet<String>,
}

/// Domain for the resolver-supplied `lib_status` column (§6 Result object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LibStatus {
    New,
    Update,
    NoUpdate,
    Current,
}

impl PlanRow {
    /// Build a row from plan inputs, applying the pre-seed rules from
    /// spec.md §3: `type in {deps, installed}` or `binary = true` rows start
    /// with the relevant `*_done` flags already set, and a row's own package
    /// name is never a member of its own `deps_left`.
    pub fn new(
        package: String,
        version: String,
        kind: PackageType,
        binary: bool,
        file: PathBuf,
        sources: Vec<PathBuf>,
        mut dependencies: HashSet<String>,
        vignettes: bool,
        needs_compilation: NeedsCompilation,
        metadata: Metadata,
        lib_status: LibStatus,
    ) -> Self {
        dependencies.remove(&package);
        let preinstalled = kind.is_preinstalled();
        let build_done = preinstalled || binary;
        let install_done = preinstalled;
        let deps_left = dependencies.clone();

        PlanRow {
            package,
            version,
            kind,
            binary,
            file,
            sources,
            dependencies,
            vignettes,
            needs_compilation,
            metadata,
            lib_status,
            build_done,
            install_done,
            build_time: RowTiming::NotStarted,
            install_time: RowTiming::NotStarted,
            build_error: false,
            install_error: false,
            build_stdout: Vec::new(),
            build_stderr: Vec::new(),
            install_stdout: Vec::new(),
            install_stderr: Vec::new(),
            worker_id: None,
            deps_left,
        }
    }
}

/// On-disk/JSON shape of one plan row, as handed to the CLI by the resolver
/// collaborator (spec.md §6: "Parameters"). Deserialize-only; mutable
/// execution fields are never accepted from outside.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanRowInput {
    pub package: String,
    pub version: String,
    pub kind: PackageType,
    pub binary: bool,
    pub file: PathBuf,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default)]
    pub vignettes: bool,
    #[serde(default = "default_needs_compilation")]
    pub needs_compilation: NeedsCompilation,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "default_lib_status")]
    pub lib_status: LibStatus,
}

fn default_needs_compilation() -> NeedsCompilation {
    NeedsCompilation::Unknown
}

fn default_lib_status() -> LibStatus {
    LibStatus::New
}

impl PlanRowInput {
    pub fn into_row(self) -> PlanRow {
        PlanRow::new(
            self.package,
            self.version,
            self.kind,
            self.binary,
            self.file,
            self.sources,
            self.dependencies,
            self.vignettes,
            self.needs_compilation,
            self.metadata,
            self.lib_status,
        )
    }
}

/// One in-flight subprocess plus its captured output (spec.md §3 Worker).
pub struct WorkerSlot {
    pub id: String,
    pub task: Task,
    pub process: Box<dyn crate::worker::WorkerProcess>,
}

/// Tagged task variant (spec.md §9: replace dynamic dispatch on task kind
/// with an exhaustive match over `{Build, Install, Idle}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Build(usize),
    Install(usize),
    Idle,
}

/// Resource limits and target directory (spec.md §6 Parameters).
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub lib: PathBuf,
    pub num_workers: usize,
}

/// The authoritative in-memory record (spec.md §3 PlanState).
pub struct PlanState {
    pub rows: Vec<PlanRow>,
    pub workers: HashMap<String, WorkerSlot>,
    pub config: PlanConfig,
}

impl PlanState {
    /// Construct a fresh plan state and sweep `deps_left` against any rows
    /// that are pre-seeded `install_done` (spec.md §3: `deps_left` equals
    /// `dependencies` minus install-done package names *at all times*,
    /// including before the first selector call — a pre-seeded row never
    /// "transitions" to install_done, so `release_dependents` would
    /// otherwise never run for it).
    pub fn new(rows: Vec<PlanRow>, config: PlanConfig) -> Self {
        let mut state = PlanState {
            rows,
            workers: HashMap::new(),
            config,
        };
        let preinstalled: Vec<String> = state
            .rows
            .iter()
            .filter(|r| r.install_done)
            .map(|r| r.package.clone())
            .collect();
        for package in preinstalled {
            state.release_dependents(&package);
        }
        state
    }

    pub fn all_installed(&self) -> bool {
        self.rows.iter().all(|r| r.install_done)
    }

    /// Remove `package` from every other row's `deps_left` (spec.md §3: "after
    /// a row transitions to install_done = true, its package name is removed
    /// from every other row's deps_left").
    pub fn release_dependents(&mut self, package: &str) {
        for row in &mut self.rows {
            row.deps_left.remove(package);
        }
    }

    /// Invariant checker (spec.md §3 Invariants), exercised by tests directly
    /// and via `debug_assert!` from the scheduler after every task selection.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.workers.len() > self.config.num_workers {
            return Err(format!(
                "worker count {} exceeds num_workers {}",
                self.workers.len(),
                self.config.num_workers
            ));
        }
        for row in &self.rows {
            if row.install_done && !row.build_done {
                return Err(format!(
                    "row {} is install_done but not build_done",
                    row.package
                ));
            }
            if row.deps_left.contains(&row.package) {
                return Err(format!("row {} depends on itself", row.package));
            }
            let owning = self
                .workers
                .values()
                .filter(|w| match w.task {
                    Task::Build(i) | Task::Install(i) => self.rows[i].package == row.package,
                    Task::Idle => false,
                })
                .count();
            let has_worker = row.worker_id.is_some();
            if has_worker && owning != 1 {
                return Err(format!(
                    "row {} has worker_id set but {} workers reference it",
                    row.package, owning
                ));
            }
            if !has_worker && owning != 0 {
                return Err(format!(
                    "row {} has no worker_id but {} workers reference it",
                    row.package, owning
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, kind: PackageType, binary: bool, deps: &[&str]) -> PlanRow {
        PlanRow::new(
            name.to_string(),
            "1.0.0".to_string(),
            kind,
            binary,
            PathBuf::from(format!("{name}.tar.gz")),
            vec![],
            deps.iter().map(|s| s.to_string()).collect(),
            false,
            NeedsCompilation::No,
            Metadata::new(),
            LibStatus::New,
        )
    }

    #[test]
    fn preseed_installed_row_is_fully_done() {
        let r = row("A", PackageType::Installed, false, &[]);
        assert!(r.build_done);
        assert!(r.install_done);
    }

    #[test]
    fn preseed_binary_row_skips_build_only() {
        let r = row("A", PackageType::Standard, true, &[]);
        assert!(r.build_done);
        assert!(!r.install_done);
    }

    #[test]
    fn preseed_source_row_is_pending() {
        let r = row("A", PackageType::Cran, false, &["B"]);
        assert!(!r.build_done);
        assert!(!r.install_done);
        assert_eq!(r.deps_left, ["B".to_string()].into_iter().collect());
    }

    #[test]
    fn self_dependency_is_stripped() {
        let r = row("A", PackageType::Cran, false, &["A", "B"]);
        assert!(!r.deps_left.contains("A"));
        assert!(r.deps_left.contains("B"));
    }

    #[test]
    fn release_dependents_clears_across_rows() {
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &["A"]),
            row("C", PackageType::Cran, false, &["A", "B"]),
        ];
        let mut state = PlanState::new(
            rows,
            PlanConfig {
                lib: PathBuf::from("/lib"),
                num_workers: 2,
            },
        );
        state.release_dependents("A");
        assert!(!state.rows[1].deps_left.contains("A"));
        assert!(state.rows[2].deps_left.contains("B"));
        assert!(!state.rows[2].deps_left.contains("A"));
    }

    #[test]
    fn preseeded_install_done_row_is_swept_from_dependents_deps_left() {
        let rows = vec![
            row("A", PackageType::Installed, false, &[]),
            row("B", PackageType::Cran, false, &["A"]),
        ];
        let state = PlanState::new(
            rows,
            PlanConfig {
                lib: PathBuf::from("/lib"),
                num_workers: 2,
            },
        );
        assert!(
            state.rows[1].deps_left.is_empty(),
            "B should be immediately buildable once its only dependency is pre-installed"
        );
        assert!(state.check_invariants().is_ok());
    }
}
