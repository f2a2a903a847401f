//! Master role resolution.
//!
//! A job has at most one kind of master: if it declares a chief or master
//! replica type, those replicas are the master; otherwise worker 0 is.

use tfop_api::{ReplicaSpecSet, ReplicaType};

/// Structural role of one replica, recomputed every reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaRole {
    pub replica_type: ReplicaType,
    pub index: usize,
    pub is_master: bool,
}

impl ReplicaRole {
    /// Resolve the role of `(replica_type, index)` within `replicas`.
    pub fn resolve(replicas: &ReplicaSpecSet, replica_type: ReplicaType, index: usize) -> Self {
        Self {
            replica_type,
            index,
            is_master: is_master_role(replicas, replica_type, index),
        }
    }
}

/// Returns true if the set declares a chief or master replica type.
pub fn contains_chief_or_master(replicas: &ReplicaSpecSet) -> bool {
    replicas.keys().any(ReplicaType::is_chief_or_master)
}

/// Decide whether `(replica_type, index)` is the job's master replica.
///
/// A set with neither a chief/master nor a worker type has no master.
pub fn is_master_role(replicas: &ReplicaSpecSet, replica_type: ReplicaType, index: usize) -> bool {
    if contains_chief_or_master(replicas) {
        return replica_type.is_chief_or_master();
    }
    replica_type == ReplicaType::Worker
        && index == 0
        && replicas.contains_key(&ReplicaType::Worker)
}

/// Replica types declared in the set, in canonical order.
pub fn replica_types(replicas: &ReplicaSpecSet) -> Vec<ReplicaType> {
    replicas.keys().copied().collect()
}
