//! Aborter (spec.md §4.7): on any fatal error, signal then hard-kill every
//! live worker. Idempotent and must not itself raise.
//!
//! Grounded on the teacher's `kill.rs` signal dispatch (Unix `libc::kill`,
//! Windows Job Object termination), generalized from "one job" to "every
//! still-live worker in the pool".

use tracing::{info, warn};

use crate::plan::PlanState;
use crate::worker::Signal;

/// Per-worker grace period before a tree-kill is issued (spec.md §4.7).
const GRACE_MS: u64 = 200;

/// Signal every live worker in `state`, then tree-kill any stragglers.
/// Safe to call multiple times; a pool with no live workers is a no-op.
pub fn abort(state: &mut PlanState) {
    if state.workers.is_empty() {
        return;
    }

    info!(count = state.workers.len(), "aborting: signalling live workers");
    for slot in state.workers.values_mut() {
        slot.process.signal(Signal::Interrupt);
    }

    for (id, slot) in state.workers.iter_mut() {
        if !slot.process.wait(GRACE_MS) {
            warn!(worker_id = %id, "worker did not exit within grace period; killing tree");
            slot.process.kill_tree();
        }
    }

    state.workers.clear();
}

/// RAII scope guard that runs the aborter exactly once if the scheduler loop
/// unwinds without having already aborted (spec.md §9: "process-level
/// exception bubbling" note — a scoped guard in place of a calling-handler
/// wrapper).
pub struct AbortGuard<'a> {
    state: &'a mut PlanState,
    disarmed: bool,
}

impl<'a> AbortGuard<'a> {
    pub fn new(state: &'a mut PlanState) -> Self {
        AbortGuard {
            state,
            disarmed: false,
        }
    }

    /// Call on a clean, successful exit so `Drop` does not abort a healthy
    /// scheduler that simply finished its last worker and returned.
    pub fn disarm(&mut self) {
        self.disarmed = true;
    }

    pub fn state_mut(&mut self) -> &mut PlanState {
        self.state
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            abort(self.state);
        }
    }
}
