//! Task Selection Policy (spec.md §4.5): a pure function of Plan State +
//! pool capacity, returning the next task in strict priority order.
//!
//! Grounded in shape (not code) on cargo's historical `job_queue.rs`
//! dependency-stage dequeue (`other_examples/48d18ec8_...job_queue.rs.rs`):
//! both scan a dependency-ordered structure for the next unit whose
//! prerequisites are satisfied and whose slot is free, rather than
//! maintaining a priority queue that must be kept in sync with mutations.

use crate::error::{ExecError, Result};
use crate::plan::{PlanState, Task};

/// Select the next task. Pure: takes `&PlanState`, performs no I/O and no
/// mutation (spec.md §8 "Selector is a pure function of PlanState +
/// capacity").
pub fn select(state: &PlanState) -> Result<Task> {
    let k = state.workers.len();

    // 1. idle if the pool is full.
    if k >= state.config.num_workers {
        return Ok(Task::Idle);
    }

    // 2. lowest-indexed buildable row: not built, no residual deps, unowned.
    if let Some(idx) = state.rows.iter().position(|r| {
        !r.build_done && r.deps_left.is_empty() && r.worker_id.is_none()
    }) {
        return Ok(Task::Build(idx));
    }

    // 3. lowest-indexed installable row: built, not installed, unowned.
    if let Some(idx) = state
        .rows
        .iter()
        .position(|r| r.build_done && !r.install_done && r.worker_id.is_none())
    {
        return Ok(Task::Install(idx));
    }

    // 4. deadlock: work remains, nothing selectable, nothing in flight.
    let pending = state.rows.iter().filter(|r| !r.install_done).count();
    if pending > 0 && state.workers.is_empty() {
        return Err(ExecError::SchedulerDeadlock { pending });
    }

    // 5. idle otherwise (workers are in flight; wait for one to finish).
    Ok(Task::Idle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{LibStatus, Metadata, NeedsCompilation, PackageType, PlanConfig, PlanRow};
    use std::collections::HashSet;
    use std::path::PathBuf;

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

    fn config(num_workers: usize) -> PlanConfig {
        PlanConfig {
            lib: PathBuf::from("/lib"),
            num_workers,
        }
    }

    #[test]
    fn empty_plan_is_idle() {
        let state = PlanState::new(vec![], config(2));
        assert_eq!(select(&state).unwrap(), Task::Idle);
    }

    #[test]
    fn full_pool_is_idle_even_with_work() {
        let mut state = PlanState::new(vec![row("A", PackageType::Cran, false, &[])], config(1));
        // Simulate one in-flight worker by filling the pool artificially via
        // num_workers = 0 capacity check instead (simpler than constructing a
        // real WorkerSlot in a unit test).
        state.config.num_workers = 0;
        assert_eq!(select(&state).unwrap(), Task::Idle);
    }

    #[test]
    fn build_before_install_when_both_available() {
        let rows = vec![
            {
                let mut r = row("A", PackageType::Cran, false, &[]);
                r.build_done = true;
                r
            },
            row("B", PackageType::Cran, false, &[]),
        ];
        let state = PlanState::new(rows, config(2));
        assert_eq!(select(&state).unwrap(), Task::Build(1));
    }

    #[test]
    fn install_selected_when_no_build_available() {
        let mut r = row("A", PackageType::Cran, false, &[]);
        r.build_done = true;
        let state = PlanState::new(vec![r], config(2));
        assert_eq!(select(&state).unwrap(), Task::Install(0));
    }

    #[test]
    fn blocked_by_unreleased_dependency_is_not_selectable() {
        // B depends on A; A is neither built nor installed, so B cannot build
        // yet (deps_left non-empty) and cannot install (not built). With zero
        // workers live and work remaining, this is a deadlock.
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &["A"]),
        ];
        // A is selectable (no deps), so this is NOT a deadlock on its own.
        let state = PlanState::new(rows, config(2));
        assert_eq!(select(&state).unwrap(), Task::Build(0));
    }

    #[test]
    fn stable_tie_break_by_ascending_index() {
        let rows = vec![
            row("A", PackageType::Cran, false, &[]),
            row("B", PackageType::Cran, false, &[]),
        ];
        let state = PlanState::new(rows, config(2));
        assert_eq!(select(&state).unwrap(), Task::Build(0));
    }
}
