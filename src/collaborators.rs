//! External collaborator interfaces (spec.md §6): the resolver, the
//! archive/untar subsystem, and the atomic on-disk installer are out of
//! scope (§1) and consumed here only as pluggable traits. Default
//! implementations spawn an arbitrary caller-supplied command template,
//! exactly the way the teacher's `supervise()` spawns a command without
//! understanding its semantics.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::plan::{Metadata, NeedsCompilation};
use crate::worker::{command_from_template, ChildWorker, WorkerKind, WorkerProcess};

/// Given source inputs, start a worker that builds a binary archive.
pub trait BuildRunner: Send + Sync {
    fn spawn_build(
        &self,
        package: &str,
        source_path: &Path,
        tmp_dir: &Path,
        lib: &Path,
        vignettes: bool,
        needs_compilation: NeedsCompilation,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Given a binary archive, start a worker that installs it into `lib`.
pub trait InstallRunner: Send + Sync {
    fn spawn_install(
        &self,
        package: &str,
        archive: &Path,
        lib: &Path,
        metadata: &Metadata,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Alert severities (spec.md §6 AlertSink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Danger,
}

/// User-facing alert sink, decoupled from logging so a CLI, TUI, or test
/// harness can each render alerts differently.
pub trait AlertSink: Send + Sync {
    fn alert(&self, severity: Severity, message: String);
}

/// Progress reporter over total build+install units.
pub trait ProgressReporter: Send {
    fn create(&mut self, total_units: usize);
    fn tick(&mut self, delta: usize);
    fn close(&mut self);
}

/// Default [`BuildRunner`]: renders a shell command template with
/// `{source}`, `{tmp_dir}`, `{lib}` placeholders and spawns it. Standing in
/// for the out-of-scope R-specific build tooling.
pub struct ShellBuildRunner {
    pub template: String,
}

impl BuildRunner for ShellBuildRunner {
    fn spawn_build(
        &self,
        _package: &str,
        source_path: &Path,
        tmp_dir: &Path,
        lib: &Path,
        _vignettes: bool,
        _needs_compilation: NeedsCompilation,
    ) -> Result<Box<dyn WorkerProcess>> {
        let cmd = command_from_template(
            &self.template,
            &[
                ("source", &source_path.display().to_string()),
                ("tmp_dir", &tmp_dir.display().to_string()),
                ("lib", &lib.display().to_string()),
            ],
        );
        let built_file = tmp_dir.join(archive_name_for(source_path));
        let worker = ChildWorker::spawn(
            WorkerKind::Build,
            cmd,
            Some(built_file),
            Some(tmp_dir.to_path_buf()),
        )?;
        Ok(Box::new(worker))
    }
}

/// Default [`InstallRunner`]: renders a shell command template with
/// `{archive}`, `{lib}` placeholders and spawns it.
pub struct ShellInstallRunner {
    pub template: String,
}

impl InstallRunner for ShellInstallRunner {
    fn spawn_install(
        &self,
        _package: &str,
        archive: &Path,
        lib: &Path,
        _metadata: &Metadata,
    ) -> Result<Box<dyn WorkerProcess>> {
        let cmd = command_from_template(
            &self.template,
            &[
                ("archive", &archive.display().to_string()),
                ("lib", &lib.display().to_string()),
            ],
        );
        let worker = ChildWorker::spawn(WorkerKind::Install, cmd, None, None)?;
        Ok(Box::new(worker))
    }
}

fn archive_name_for(source_path: &Path) -> PathBuf {
    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package".to_string());
    PathBuf::from(format!("{stem}.built.tar.gz"))
}

/// Default [`AlertSink`]: emits a `tracing` event at the level mapped from
/// severity (info → info, success → info, danger → warn).
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, severity: Severity, message: String) {
        match severity {
            Severity::Info | Severity::Success => tracing::info!("{message}"),
            Severity::Danger => tracing::warn!("{message}"),
        }
    }
}

/// Default [`ProgressReporter`]: writes `"{done}/{total}"` lines to stderr,
/// a minimal stand-in for the out-of-scope real progress-bar renderer.
pub struct LineProgressReporter {
    done: usize,
    total: usize,
}

impl Default for LineProgressReporter {
    fn default() -> Self {
        LineProgressReporter { done: 0, total: 0 }
    }
}

impl ProgressReporter for LineProgressReporter {
    fn create(&mut self, total_units: usize) {
        self.total = total_units;
        self.done = 0;
    }

    fn tick(&mut self, delta: usize) {
        self.done += delta;
        eprintln!("{}/{}", self.done, self.total);
    }

    fn close(&mut self) {
        eprintln!();
    }
}
