//! Integration test suite for flowcore.
//!
//! These tests exercise the public API end to end: pipelines, the priority
//! scheduler, the resource allocator under contention and the coordinator
//! across every execution mode.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Multi-stage pipeline execution
//! - `scheduler_fairness`: Priority order, starvation bounds and admission
//! - `allocator_concurrency`: Capacity invariants under contention
//! - `coordinator`: Workflows, sessions, health and metrics
//!
//! All work units are in-process closures; nothing touches the network or
//! the filesystem.


mod allocator_concurrency;
mod coordinator;
mod pipeline_e2e;
mod scheduler_fairness;
