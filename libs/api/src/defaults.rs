//! Schema defaulting for training jobs.

use crate::{
    CleanPodPolicy, ContainerPort, ReplicaSpec, RestartPolicy, SuccessPolicy, TrainingJob,
    DEFAULT_CONTAINER_NAME, DEFAULT_PORT, DEFAULT_PORT_NAME,
};

/// Fills unset fields of a job with their defaults.
///
/// Applied to the controller's private copy before reconciliation; never
/// to a cached object. Idempotent.
pub fn set_defaults(job: &mut TrainingJob) {
    let run_policy = &mut job.spec.run_policy;
    if run_policy.clean_pod_policy.is_none() {
        run_policy.clean_pod_policy = Some(CleanPodPolicy::Running);
    }

    if job.spec.success_policy.is_none() {
        job.spec.success_policy = Some(SuccessPolicy::Default);
    }

    for spec in job.spec.replica_specs.values_mut() {
        set_replica_defaults(spec);
    }
}

fn set_replica_defaults(spec: &mut ReplicaSpec) {
    if spec.replicas.is_none() {
        spec.replicas = Some(1);
    }

    if spec.restart_policy.is_none() {
        spec.restart_policy = Some(RestartPolicy::Never);
    }

    set_default_port(spec);
}

/// Adds the communication port to the training container if it lacks one.
fn set_default_port(spec: &mut ReplicaSpec) {
    let Some(container) = spec
        .template
        .spec
        .containers
        .iter_mut()
        .find(|c| c.name == DEFAULT_CONTAINER_NAME)
    else {
        return;
    };

    let has_port = container
        .ports
        .iter()
        .any(|p| p.name.as_deref() == Some(DEFAULT_PORT_NAME));

    if !has_port {
        container.ports.push(ContainerPort {
            name: Some(DEFAULT_PORT_NAME.to_string()),
            container_port: DEFAULT_PORT,
            protocol: None,
        });
    }
}
