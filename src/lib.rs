//! pkgplan-exec v0.1 — core library.
//!
//! Drives a bounded-parallelism build/install plan to completion: a pure
//! task-selection policy, a uniform worker-process façade over spawned
//! build/install subprocesses, a bounded-timeout event poller, and a
//! scheduler loop tying them together.
pub mod aborter;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod plan;
pub mod poller;
pub mod schema;
pub mod scheduler;
pub mod selector;
pub mod summary;
pub mod worker;
