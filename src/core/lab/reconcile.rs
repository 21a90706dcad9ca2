// src/core/lab/reconcile.rs

//! Reconciliation of in-memory lab state against Kubernetes ground truth,
//! and the pod watch that drives the final step of the creation protocol.

use super::{LabManager, LabStatus, ManagedResource, ResourceKind, UserLabState};
use crate::core::errors::ControllerError;
use crate::core::events::{ProgressEvent, ProgressEventBus};
use crate::core::k8s::KubernetesAdapter;
use std::time::Duration;
use tracing::{info, warn};

/// The label selector used to discover namespaces this controller owns,
/// matching the label [`super::manifests::build_namespace`] applies.
const LAB_NAMESPACE_SELECTOR: &str = "nublado.lsst.io/category=lab";
const USER_LABEL: &str = "nublado.lsst.io/user";

/// A summary of one reconciliation pass, surfaced for logging/metrics; no
/// caller currently branches on its fields individually.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Namespaces discovered with no corresponding in-memory slot, adopted
    /// as `running`.
    pub adopted: usize,
    /// In-memory labs whose namespace had vanished, moved to `absent`.
    pub reaped: usize,
    /// In-memory labs whose namespace vanished while in a non-terminal
    /// state other than `running`, moved to `failed`.
    pub failed: usize,
}

/// Runs one reconciliation pass: list every namespace this controller owns,
/// diff it against in-memory state, and converge both directions.
///
/// A lab in `pending` or `terminating` is left alone: its own `run_creation`
/// or `run_deletion` task is the sole writer of that slot's state while it
/// is in flight, and a namespace that hasn't appeared yet (or hasn't been
/// torn down yet) is expected, not a divergence to correct.
pub async fn reconcile(manager: &LabManager) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let namespaces = match manager.k8s().list_namespaces(LAB_NAMESPACE_SELECTOR).await {
        Ok(ns) => ns,
        Err(e) => {
            warn!("reconcile: failed to list lab namespaces, skipping this pass: {}", e);
            return outcome;
        }
    };

    let mut discovered: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for ns in &namespaces {
        let Some(name) = ns.metadata.name.clone() else { continue };
        let Some(user) = ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(USER_LABEL))
            .cloned()
        else {
            continue;
        };
        discovered.insert(user, name);
    }

    // Direction 1: known labs whose namespace is gone.
    for (user, slot) in manager.slots_snapshot() {
        let status = slot.status().await;
        if matches!(status, LabStatus::Pending | LabStatus::Terminating | LabStatus::Absent) {
            continue;
        }
        if discovered.contains_key(&user) {
            continue;
        }

        let state = if status == LabStatus::Running {
            info!("reconcile: namespace for running lab '{}' has vanished, marking absent", user);
            outcome.reaped += 1;
            blank(&user)
        } else {
            warn!("reconcile: namespace for failed lab '{}' has vanished, clearing state", user);
            outcome.failed += 1;
            let mut state = slot.get().await;
            state.status = LabStatus::Failed;
            state.last_error = Some("namespace no longer exists".to_string());
            state
        };
        slot.set(state).await;
        manager.bus().publish(&user, |seq| {
            ProgressEvent::warning(seq, "Lab namespace disappeared outside the controller; state reset.")
        }).await;
    }

    // Direction 2: namespaces with no in-memory owner (or only an `absent`
    // one) are adopted as `running`, so a controller restart doesn't orphan
    // labs that were already serving users.
    for (user, namespace) in discovered {
        let slot = manager.slot_entry(&user);
        if slot.status().await != LabStatus::Absent {
            continue;
        }

        let pod = manager.k8s().get_pod(&namespace, "lab").await.ok().flatten();
        let Some(pod) = pod else {
            // Namespace exists but the lab pod hasn't appeared; likely a
            // creation still in progress from before a restart, which its
            // own (now-gone) task would have owned. Leave it for the next
            // pass rather than guessing at a status.
            continue;
        };
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
        if phase != "Running" {
            continue;
        }

        info!("reconcile: adopting previously-unknown running lab '{}' in namespace '{}'", user, namespace);
        let mut state = blank(&user);
        state.status = LabStatus::Running;
        state.namespace = Some(namespace.clone());
        state.pod_uid = pod.metadata.uid.clone();
        state.resources.push(ManagedResource {
            kind: ResourceKind::Pod,
            namespace,
            name: "lab".to_string(),
        });
        slot.set(state).await;
        outcome.adopted += 1;
    }

    outcome
}

fn blank(user: &str) -> UserLabState {
    UserLabState {
        username: user.to_string(),
        status: LabStatus::Absent,
        image: None,
        size: None,
        options: None,
        namespace: None,
        pod_uid: None,
        started_at: None,
        resources: Vec::new(),
        last_error: None,
    }
}

/// Watches `pod_name` in `namespace` until it reaches `Running` (success) or
/// `Failed`/budget exhaustion (error), publishing a progress event on each
/// phase transition. When `wait_for_reset_init` is set, also waits for the
/// `reset-user-env` init container to report `Terminated(exit_code=0)`
/// before considering the pod ready, since the main container won't start
/// until then anyway but we want a clearer progress message.
pub async fn watch_pod_to_ready(
    k8s: &KubernetesAdapter,
    namespace: &str,
    pod_name: &str,
    wait_for_reset_init: bool,
    bus: &ProgressEventBus,
    user: &str,
    budget: Duration,
) -> Result<Option<String>, ControllerError> {
    bus.publish(user, |seq| ProgressEvent::info(seq, "Waiting for lab pod to become ready.")).await;

    let deadline = tokio::time::Instant::now() + budget;
    let mut reported_init_done = !wait_for_reset_init;

    loop {
        let pod = k8s.get_pod(namespace, pod_name).await?.ok_or_else(|| {
            ControllerError::UpstreamTransient(format!("pod '{pod_name}' disappeared while waiting for readiness"))
        })?;

        if wait_for_reset_init && !reported_init_done {
            let terminated_ok = pod
                .status
                .as_ref()
                .and_then(|s| s.init_container_statuses.as_ref())
                .and_then(|statuses| statuses.iter().find(|c| c.name == "reset-user-env"))
                .and_then(|c| c.state.as_ref())
                .and_then(|s| s.terminated.as_ref());

            if let Some(terminated) = terminated_ok {
                if terminated.exit_code != 0 {
                    return Err(ControllerError::UpstreamPermanent(format!(
                        "reset-user-env init container exited with code {}",
                        terminated.exit_code
                    )));
                }
                reported_init_done = true;
                bus.publish(user, |seq| ProgressEvent::info(seq, "User environment reset complete.")).await;
            }
        }

        if let Some(status) = &pod.status {
            match status.phase.as_deref() {
                Some("Running") if reported_init_done => {
                    return Ok(pod.metadata.uid.clone());
                }
                Some("Failed") => {
                    let reason = status
                        .container_statuses
                        .as_ref()
                        .and_then(|cs| cs.iter().find_map(|c| c.state.as_ref()?.terminated.as_ref()))
                        .map(|t| t.reason.clone().unwrap_or_default())
                        .unwrap_or_default();
                    return Err(ControllerError::UpstreamPermanent(format!(
                        "lab pod entered Failed phase: {reason}"
                    )));
                }
                _ => {}
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ControllerError::spawn_timeout("waiting for lab pod readiness"));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
