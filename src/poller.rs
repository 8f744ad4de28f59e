//! Event Poller (spec.md §4.2): given a set of worker handles, blocks up to
//! a bounded timeout and returns the subset that are ready — readable on
//! stdout/stderr, or terminated.
//!
//! Worker handles here expose readiness through a buffered-bytes check and a
//! liveness flag rather than raw file descriptors, so `poll` is a bounded
//! sleep-loop — the same idiom the teacher's `run.rs`/`wait.rs` use for their
//! own polling loops (sleep a short tick, re-check, stop at a deadline).

use std::time::{Duration, Instant};

use crate::worker::WorkerProcess;

/// Fixed poll timeout (spec.md §4.2): bounds progress-bar refresh latency
/// while keeping the loop from busy-spinning.
pub const POLL_TIMEOUT_MS: u64 = 100;

/// Internal re-check granularity. Small enough that readiness is noticed
/// promptly, large enough not to busy-spin.
const TICK_MS: u64 = 5;

/// A worker is "ready" once it has bytes buffered right now on either
/// stream or has exited (spec.md Glossary: "Ready"). Deliberately checks
/// `has_buffered_*`, not `has_incomplete_*` — the latter is true for nearly
/// the entire lifetime of a live child (it only flips at EOF) and would
/// make every live worker "ready" on the first check, defeating the
/// timeout and busy-spinning this loop.
fn is_ready(w: &mut dyn WorkerProcess) -> bool {
    !w.is_alive() || w.has_buffered_output() || w.has_buffered_error()
}

/// Poll `handles` for up to `timeout_ms`. Returns a boolean per handle in
/// input order. If `handles` is empty, the poller is not invoked and an
/// empty vector is returned immediately (spec.md §4.2).
pub fn poll(handles: &mut [&mut dyn WorkerProcess], timeout_ms: u64) -> Vec<bool> {
    if handles.is_empty() {
        return Vec::new();
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let readiness: Vec<bool> = handles.iter_mut().map(|h| is_ready(*h)).collect();
        if readiness.iter().any(|&r| r) || Instant::now() >= deadline {
            return readiness;
        }
        std::thread::sleep(Duration::from_millis(TICK_MS));
    }
}
