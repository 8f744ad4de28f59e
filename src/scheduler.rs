//! Scheduler Loop (spec.md §4.3) and the two-phase event handler (§4.4) and
//! build/install completion (§4.6).
//!
//! Grounded on the teacher's `run.rs::supervise` control flow — spawn,
//! stream output, wait for exit, finalize persisted state — generalized
//! from "one job" into "a bounded pool of build/install jobs gated by
//! inter-row dependencies".

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::aborter::AbortGuard;
use crate::collaborators::{AlertSink, BuildRunner, InstallRunner, ProgressReporter, Severity};
use crate::error::{ExecError, Result};
use crate::plan::{PlanConfig, PlanRow, PlanState, Task, WorkerSlot};
use crate::poller::{self, POLL_TIMEOUT_MS};
use crate::selector;
use crate::summary::{self, ExecutionReport};
use crate::worker::split_lines;

/// Orchestrates the poller, selector, and worker lifecycle described in
/// spec.md §2/§4.3.
pub struct Scheduler {
    build_runner: Box<dyn BuildRunner>,
    install_runner: Box<dyn InstallRunner>,
    alert_sink: Box<dyn AlertSink>,
    progress: Box<dyn ProgressReporter>,
    tmp_root: std::path::PathBuf,
    next_worker_id: AtomicU64,
}

impl Scheduler {
    pub fn new(
        build_runner: Box<dyn BuildRunner>,
        install_runner: Box<dyn InstallRunner>,
        alert_sink: Box<dyn AlertSink>,
        progress: Box<dyn ProgressReporter>,
        tmp_root: std::path::PathBuf,
    ) -> Self {
        Scheduler {
            build_runner,
            install_runner,
            alert_sink,
            progress,
            tmp_root,
            next_worker_id: AtomicU64::new(0),
        }
    }

    fn fresh_worker_id(&self) -> String {
        let n = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        format!("w{n}")
    }

    /// Drive `rows` to completion under `config`. Owns a fresh [`PlanState`]
    /// for the duration of the call (spec.md §3 Lifecycle).
    pub fn execute(&mut self, rows: Vec<PlanRow>, config: PlanConfig) -> Result<ExecutionReport> {
        let total_units = rows.iter().filter(|r| !r.kind.is_preinstalled()).count() * 2;
        let mut state = PlanState::new(rows, config);
        let mut guard = AbortGuard::new(&mut state);

        self.progress.create(total_units);
        let result = self.run_loop(guard.state_mut());
        self.progress.close();

        match result {
            Ok(()) => {
                guard.disarm();
                Ok(summary::build_report(&guard.state_mut().rows))
            }
            Err(e) => Err(e),
        }
    }

    fn run_loop(&mut self, state: &mut PlanState) -> Result<()> {
        // 1. Warm start: fill every slot we can.
        for _ in 0..state.config.num_workers {
            self.select_and_spawn(state)?;
        }

        // 2. Loop until done.
        loop {
            if state.all_installed() {
                return Ok(());
            }

            let ready_ids = self.poll_workers(state);
            for id in ready_ids {
                self.handle_ready_worker(state, &id)?;
            }

            self.select_and_spawn(state)?;
        }
    }

    fn poll_workers(&self, state: &mut PlanState) -> Vec<String> {
        if state.workers.is_empty() {
            return Vec::new();
        }
        // `iter_mut()` hands out disjoint `&mut WorkerSlot`s in one pass;
        // sort by id afterward for deterministic handling order.
        let mut entries: Vec<(&String, &mut WorkerSlot)> = state.workers.iter_mut().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let ids: Vec<String> = entries.iter().map(|(id, _)| (*id).clone()).collect();
        let mut handles: Vec<&mut dyn crate::worker::WorkerProcess> = entries
            .into_iter()
            .map(|(_, slot)| slot.process.as_mut())
            .collect();
        let readiness = poller::poll(&mut handles, POLL_TIMEOUT_MS);
        ids.into_iter()
            .zip(readiness)
            .filter_map(|(id, ready)| ready.then_some(id))
            .collect()
    }

    /// Select a task and, if non-idle, spawn and register a worker for it
    /// (spec.md §4.3 step 1 and the re-selection at the end of step 2).
    fn select_and_spawn(&mut self, state: &mut PlanState) -> Result<()> {
        let task = selector::select(state)?;
        let outcome = match task {
            Task::Idle => Ok(()),
            Task::Build(idx) => self.spawn_build(state, idx),
            Task::Install(idx) => self.spawn_install(state, idx),
        };
        debug_assert!(
            state.check_invariants().is_ok(),
            "plan state invariant violated: {:?}",
            state.check_invariants().err()
        );
        outcome
    }

    fn spawn_build(&mut self, state: &mut PlanState, idx: usize) -> Result<()> {
        let lib = state.config.lib.clone();
        let row = &mut state.rows[idx];
        let tmp_dir = self.tmp_root.join(format!("build-{}", row.package));
        std::fs::create_dir_all(&tmp_dir)?;

        let process = self.build_runner.spawn_build(
            &row.package,
            &row.file,
            &tmp_dir,
            &lib,
            row.vignettes,
            row.needs_compilation,
        )?;

        let id = self.fresh_worker_id();
        row.worker_id = Some(id.clone());
        row.build_time.start();
        debug!(package = %row.package, worker_id = %id, "build spawned");
        state.workers.insert(
            id.clone(),
            WorkerSlot {
                id,
                task: Task::Build(idx),
                process,
            },
        );
        Ok(())
    }

    fn spawn_install(&mut self, state: &mut PlanState, idx: usize) -> Result<()> {
        let lib = state.config.lib.clone();
        let row = &mut state.rows[idx];

        let process = self
            .install_runner
            .spawn_install(&row.package, &row.file, &lib, &row.metadata)?;

        let id = self.fresh_worker_id();
        row.worker_id = Some(id.clone());
        row.install_time.start();
        debug!(package = %row.package, worker_id = %id, "install spawned");
        state.workers.insert(
            id.clone(),
            WorkerSlot {
                id,
                task: Task::Install(idx),
                process,
            },
        );
        Ok(())
    }

    /// Two-phase drain protocol (spec.md §4.4).
    fn handle_ready_worker(&mut self, state: &mut PlanState, worker_id: &str) -> Result<()> {
        let Some(slot) = state.workers.get_mut(worker_id) else {
            return Ok(());
        };
        let process = slot.process.as_mut();

        // Step 1/2: drain whatever is available right now. While alive this
        // is a bounded non-blocking read; once exited it's the terminal
        // drain, matching spec.md's "perform a non-blocking read" vs.
        // "perform the terminal drain" branching.
        let alive = process.is_alive();
        let (out_chunk, err_chunk) = if alive {
            (process.read_output(10_000), process.read_error(10_000))
        } else {
            (process.read_all_output(), process.read_all_error())
        };

        let task = slot.task;
        append_output(state, task, &out_chunk, &err_chunk);

        // Step 3: still not finished if alive or a pipe has unread data.
        let slot = state.workers.get_mut(worker_id).expect("worker present");
        if !slot.process.is_ready_to_finish() {
            return Ok(());
        }

        // Step 4: finished. Remove from the worker set and dispatch.
        let slot = state.workers.remove(worker_id).expect("worker present");
        self.finish_worker(state, slot)
    }

    fn finish_worker(&mut self, state: &mut PlanState, slot: WorkerSlot) -> Result<()> {
        let exit_code = slot.process.exit_status();
        match slot.task {
            Task::Build(idx) => self.complete_build(state, idx, slot.process.as_ref(), exit_code),
            Task::Install(idx) => self.complete_install(state, idx, exit_code),
            Task::Idle => Ok(()),
        }
    }

    /// Build completion (spec.md §4.6).
    fn complete_build(
        &mut self,
        state: &mut PlanState,
        idx: usize,
        process: &dyn crate::worker::WorkerProcess,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let package = state.rows[idx].package.clone();

        if exit_code == Some(0) {
            let built_file = process.get_built_file().map_err(|e| {
                state.rows[idx].build_error = true;
                state.rows[idx].build_done = true;
                e
            })?;

            let row = &mut state.rows[idx];
            row.build_time.finish();
            row.file = built_file;
            row.worker_id = None;
            row.build_done = true;
            // install_done intentionally left false.
            self.progress.tick(1);
            self.alert_sink.alert(
                Severity::Success,
                format!(
                    "built {package} {} ({})",
                    row.version,
                    summary::format_duration(row.build_time.elapsed().unwrap_or_default())
                ),
            );
            Ok(())
        } else {
            let row = &mut state.rows[idx];
            row.build_error = true;
            row.build_done = true;
            row.worker_id = None;
            self.alert_sink.alert(
                Severity::Danger,
                format!("build failed for {package} (exit {exit_code:?})"),
            );
            Err(ExecError::BuildFailure {
                package,
                exit_code,
            })
        }
    }

    /// Install completion (spec.md §4.6).
    fn complete_install(
        &mut self,
        state: &mut PlanState,
        idx: usize,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let package = state.rows[idx].package.clone();

        if exit_code == Some(0) {
            let row = &mut state.rows[idx];
            row.install_time.finish();
            row.worker_id = None;
            row.install_done = true;
            let elapsed = row.install_time.elapsed().unwrap_or_default();
            let note = summary::install_note(row);
            let version = row.version.clone();
            state.release_dependents(&package);
            self.progress.tick(1);
            self.alert_sink.alert(
                Severity::Success,
                format!(
                    "installed {package} {version} {note} ({})",
                    summary::format_duration(elapsed)
                ),
            );
            info!(package = %package, "installed");
            Ok(())
        } else {
            let row = &mut state.rows[idx];
            row.install_error = true;
            row.install_done = true;
            row.worker_id = None;
            self.alert_sink.alert(
                Severity::Danger,
                format!("install failed for {package} (exit {exit_code:?})"),
            );
            Err(ExecError::InstallFailure {
                package,
                exit_code,
            })
        }
    }
}

fn append_output(state: &mut PlanState, task: Task, out: &[u8], err: &[u8]) {
    if out.is_empty() && err.is_empty() {
        return;
    }
    let idx = match task {
        Task::Build(i) | Task::Install(i) => i,
        Task::Idle => return,
    };
    let row = &mut state.rows[idx];
    let (out_lines, err_lines) = match task {
        Task::Build(_) => (&mut row.build_stdout, &mut row.build_stderr),
        Task::Install(_) => (&mut row.install_stdout, &mut row.install_stderr),
        Task::Idle => unreachable!(),
    };
    if !out.is_empty() {
        out_lines.extend(split_lines(out));
    }
    if !err.is_empty() {
        err_lines.extend(split_lines(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LineProgressReporter, TracingAlertSink};
    use crate::error::ExecError;
    use crate::plan::{LibStatus, Metadata, NeedsCompilation, PackageType};
    use crate::worker::{Signal, WorkerProcess};
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    /// A worker that "completes" the moment it is polled, with a scripted
    /// exit code and output — deterministic stand-in for a real subprocess.
    struct FakeWorker {
        exit_code: i32,
        output: Vec<u8>,
        built_file: Option<PathBuf>,
    }

    impl WorkerProcess for FakeWorker {
        fn is_alive(&mut self) -> bool {
            false
        }
        fn read_output(&mut self, n: usize) -> Vec<u8> {
            self.read_all_output_capped(n)
        }
        fn read_error(&mut self, _n: usize) -> Vec<u8> {
            Vec::new()
        }
        fn read_all_output(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.output)
        }
        fn read_all_error(&mut self) -> Vec<u8> {
            Vec::new()
        }
        fn has_incomplete_output(&self) -> bool {
            false
        }
        fn has_incomplete_error(&self) -> bool {
            false
        }
        fn has_buffered_output(&self) -> bool {
            !self.output.is_empty()
        }
        fn has_buffered_error(&self) -> bool {
            false
        }
        fn exit_status(&self) -> Option<i32> {
            Some(self.exit_code)
        }
        fn get_built_file(&self) -> crate::error::Result<PathBuf> {
            self.built_file
                .clone()
                .ok_or_else(|| ExecError::CompletionAccessorFailure {
                    package: String::new(),
                    reason: "no built file".to_string(),
                })
        }
        fn signal(&mut self, _sig: Signal) {}
        fn kill_tree(&mut self) {}
        fn wait(&mut self, _ms: u64) -> bool {
            true
        }
    }

    impl FakeWorker {
        fn read_all_output_capped(&mut self, n: usize) -> Vec<u8> {
            let take = n.min(self.output.len());
            self.output.drain(..take).collect()
        }
    }

    struct FakeBuildRunner {
        exit_code: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl BuildRunner for FakeBuildRunner {
        fn spawn_build(
            &self,
            package: &str,
            _source_path: &Path,
            tmp_dir: &Path,
            _lib: &Path,
            _vignettes: bool,
            _needs_compilation: NeedsCompilation,
        ) -> Result<Box<dyn WorkerProcess>> {
            self.log.lock().unwrap().push(format!("build:{package}"));
            let built = tmp_dir.join(format!("{package}.built"));
            std::fs::write(&built, b"binary").unwrap();
            Ok(Box::new(FakeWorker {
                exit_code: self.exit_code,
                output: Vec::new(),
                built_file: Some(built),
            }))
        }
    }

    struct FakeInstallRunner {
        exit_code: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl InstallRunner for FakeInstallRunner {
        fn spawn_install(
            &self,
            package: &str,
            _archive: &Path,
            _lib: &Path,
            _metadata: &Metadata,
        ) -> Result<Box<dyn WorkerProcess>> {
            self.log.lock().unwrap().push(format!("install:{package}"));
            Ok(Box::new(FakeWorker {
                exit_code: self.exit_code,
                output: Vec::new(),
                built_file: None,
            }))
        }
    }

    fn row(name: &str, kind: PackageType, binary: bool, deps: &[&str]) -> PlanRow {
        PlanRow::new(
            name.to_string(),
            "1.0.0".to_string(),
            kind,
            binary,
            PathBuf::from(format!("{name}.tar.gz")),
            vec![],
            deps.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            false,
            NeedsCompilation::No,
            Metadata::new(),
            LibStatus::New,
        )
    }

    fn scheduler(log: Arc<Mutex<Vec<String>>>, exit_code: i32, tmp: &Path) -> Scheduler {
        Scheduler::new(
            Box::new(FakeBuildRunner {
                exit_code,
                log: Arc::clone(&log),
            }),
            Box::new(FakeInstallRunner { exit_code, log }),
            Box::new(TracingAlertSink),
            Box::new(LineProgressReporter::default()),
            tmp.to_path_buf(),
        )
    }

    #[test]
    fn empty_plan_returns_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sched = scheduler(Arc::new(Mutex::new(Vec::new())), 0, tmp.path());
        let report = sched
            .execute(
                vec![],
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap();
        assert!(report.rows.is_empty());
        assert_eq!(report.summary.installed, 0);
    }

    #[test]
    fn single_preinstalled_row_spawns_no_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(Arc::clone(&log), 0, tmp.path());
        let rows = vec![row("A", PackageType::Installed, true, &[])];
        let report = sched
            .execute(
                rows,
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(report.rows.len(), 1);
        assert!(report.rows[0].build_done);
        assert!(report.rows[0].install_done);
    }

    #[test]
    fn linear_chain_builds_and_installs_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(Arc::clone(&log), 0, tmp.path());
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &["A"]),
            row("C", PackageType::Cran, false, &["B"]),
        ];
        let report = sched
            .execute(
                rows,
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap();
        for r in &report.rows {
            assert!(r.build_done && r.install_done, "{r:?} not finished");
        }
        let events = log.lock().unwrap().clone();
        let pos = |needle: &str| events.iter().position(|e| e == needle).unwrap();
        assert!(pos("install:A") < pos("build:B"));
        assert!(pos("install:B") < pos("build:C"));
    }

    #[test]
    fn build_failure_is_fatal_and_stops_downstream() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(Arc::clone(&log), 1, tmp.path());
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &["A"]),
        ];
        let err = sched
            .execute(
                rows,
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::BuildFailure { .. } | ExecError::InstallFailure{..}));
        assert!(!log.lock().unwrap().iter().any(|e| e.contains("B")));
    }

    #[test]
    fn mixed_binary_and_source_respects_install_before_build() {
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(Arc::clone(&log), 0, tmp.path());
        let rows = vec![
            row("A", PackageType::Standard, true, &[]),
            row("B", PackageType::Standard, false, &["A"]),
        ];
        let report = sched
            .execute(
                rows,
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap();
        assert!(report.rows.iter().all(|r| r.build_done && r.install_done));
        let events = log.lock().unwrap().clone();
        // A never builds (binary=true pre-seeds build_done); it only installs.
        assert!(!events.iter().any(|e| e == "build:A"));
        let install_a = events.iter().position(|e| e == "install:A").unwrap();
        let build_b = events.iter().position(|e| e == "build:B").unwrap();
        assert!(install_a < build_b);
    }

    #[test]
    fn parallel_leaves_build_together_then_gate_joint_dependent() {
        // A and B are independent leaves; C depends on both. With
        // num_workers = 2 the warm start spawns A's and B's builds in the
        // same pass, before either completes, and C may not build until
        // both have installed.
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = scheduler(Arc::clone(&log), 0, tmp.path());
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &[]),
            row("C", PackageType::Cran, false, &["A", "B"]),
        ];
        let report = sched
            .execute(
                rows,
                PlanConfig {
                    lib: PathBuf::from("/lib"),
                    num_workers: 2,
                },
            )
            .unwrap();
        assert!(report.rows.iter().all(|r| r.build_done && r.install_done));

        let events = log.lock().unwrap().clone();
        let pos = |needle: &str| events.iter().position(|e| e == needle).unwrap();

        // Both leaf builds happen before either leaf install: proof they
        // were spawned together rather than one gating the other.
        let last_leaf_build = pos("build:A").max(pos("build:B"));
        let first_leaf_install = pos("install:A").min(pos("install:B"));
        assert!(
            last_leaf_build < first_leaf_install,
            "leaf builds should both be in flight before either installs: {events:?}"
        );

        // C cannot build until both A and B have installed.
        let build_c = pos("build:C");
        assert!(pos("install:A") < build_c);
        assert!(pos("install:B") < build_c);
    }
}
