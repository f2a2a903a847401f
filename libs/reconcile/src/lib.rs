//! Reconciliation loop primitives.
//!
//! This library provides the building blocks of an event-driven controller
//! that converges declared jobs to their desired runtime state:
//!
//! - **Work queue**: deduplicating, rate-limited delivery of job keys, with
//!   at most one in-flight delivery per key.
//! - **Backoff**: per-key exponential retry delays.
//! - **Roles**: which replica of a job is its master.
//! - **Expectations**: outstanding creates/deletes that gate re-syncs.
//!
//! # Invariants
//!
//! - A key is never handed to two workers at the same time
//! - Retry delays never decrease until the key is forgotten
//! - Role decisions are deterministic given the same replica specs

mod backoff;
mod expectations;
mod queue;
mod roles;

pub use backoff::{BackoffPolicy, ItemBackoff};
pub use expectations::{
    pods_key, services_key, ControllerExpectations, ExpectationError, ExpectationTracker,
    DEFAULT_EXPECTATIONS_TTL,
};
pub use queue::WorkQueue;
pub use roles::{contains_chief_or_master, is_master_role, replica_types, ReplicaRole};
