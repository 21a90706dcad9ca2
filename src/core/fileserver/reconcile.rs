// src/core/fileserver/reconcile.rs

//! Reconciliation of in-memory file-server state against Kubernetes ground
//! truth: `Job` completion triggers the same cleanup as an explicit delete,
//! and a sweep removes orphaned or stuck-in-`creating` resource sets.

use super::{FileServerManager, FileServerState, FileServerStatus};
use crate::core::events::ProgressEvent;
use std::sync::Arc;
use tracing::{info, warn};

const FILESERVER_NAMESPACE_SELECTOR: &str = "nublado.lsst.io/category=fileserver";
const USER_LABEL: &str = "nublado.lsst.io/user";

/// A summary of one reconciliation pass, surfaced for logging/metrics.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// `Job`s observed `Succeeded`/`Failed` that triggered cleanup.
    pub completed: usize,
    /// Namespaces with no in-memory owner, deleted outright.
    pub orphaned_removed: usize,
    /// Namespaces stuck past `creation_timeout` with a still-pending
    /// ingress, deleted as failed creation attempts.
    pub stuck_reaped: usize,
}

/// Runs one reconciliation pass over every namespace this controller's
/// file-server manager owns.
///
/// A namespace whose in-memory slot is `starting` and whose `Ingress` has
/// not yet received an address is *exempt* from the stuck-sweep even past
/// `creation_timeout` minus a grace window, because `run_creation_steps`
/// itself is still polling toward that same deadline and owns the slot;
/// reaping it out from under that task is the bug this sweep previously
/// triggered.
pub async fn reconcile(manager: &Arc<FileServerManager>) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let namespaces = match manager
        .k8s()
        .list_namespaces(FILESERVER_NAMESPACE_SELECTOR)
        .await
    {
        Ok(ns) => ns,
        Err(e) => {
            warn!("fileserver reconcile: failed to list namespaces, skipping pass: {}", e);
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

    // Direction 1: known file servers whose Job has completed (successfully
    // via idle timeout, or by failing) trigger the same teardown as an
    // explicit delete.
    for (user, slot) in manager.slots_snapshot() {
        let state = slot.get().await;
        if state.status != FileServerStatus::Running {
            continue;
        }
        let Some(namespace) = &state.namespace else { continue };
        let Some(job_name) = &state.job_name else { continue };

        let job = match manager.k8s().get_job(namespace, job_name).await {
            Ok(job) => job,
            Err(e) => {
                warn!("fileserver reconcile: failed to read job '{}' for '{}': {}", job_name, user, e);
                continue;
            }
        };
        let Some(job) = job else { continue };

        let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0;
        let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0;
        if !succeeded && !failed {
            continue;
        }

        info!(
            "fileserver reconcile: job '{}' for '{}' reached {}; tearing down",
            job_name,
            user,
            if succeeded { "Succeeded" } else { "Failed" }
        );
        outcome.completed += 1;
        let result = async {
            manager.k8s().delete_namespace(namespace).await?;
            manager
                .k8s()
                .wait_namespace_gone(namespace, manager.fileserver_config().creation_timeout)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                slot.set(FileServerState::absent(&user)).await;
                manager.bus().forget_user(&user);
            }
            Err(e) => {
                warn!("fileserver reconcile: teardown of '{}' failed: {}", user, e);
                let mut state = slot.get().await;
                state.status = FileServerStatus::Failed;
                state.last_error = Some(e.to_string());
                slot.set(state).await;
            }
        }
        manager
            .bus()
            .publish(&user, |seq| ProgressEvent::info(seq, "File server exited (idle timeout or failure); removed."))
            .await;
    }

    // Direction 2: orphaned namespaces with no known owner at all are
    // removed outright. A namespace whose owner exists but is `absent`
    // in-memory (process restart raced with a lingering teardown) is left
    // for the next pass rather than guessed at.
    let known_users: std::collections::HashSet<String> =
        manager.slots_snapshot().into_iter().map(|(u, _)| u).collect();
    for (user, namespace) in &discovered {
        if known_users.contains(user) {
            continue;
        }
        warn!("fileserver reconcile: namespace '{}' has no known owner, removing", namespace);
        if manager.k8s().delete_namespace(namespace).await.is_ok() {
            outcome.orphaned_removed += 1;
        }
    }

    // Direction 3: sweep for creations stuck well past their budget. Exempt
    // anything whose ingress has not yet gone ready but is still within its
    // own creation budget — that lab's own task still owns the slot.
    for (user, slot) in manager.slots_snapshot() {
        let state = slot.get().await;
        if state.status != FileServerStatus::Starting {
            continue;
        }
        let Some(created_at) = state.created_at else { continue };
        let age = chrono::Utc::now().signed_duration_since(created_at);
        let budget = chrono::Duration::from_std(manager.fileserver_config().creation_timeout)
            .unwrap_or_default();
        // Grace window: only reap a `starting` slot once it is well past
        // (2x) its own creation timeout, since the in-flight task is the
        // authoritative owner until its own timeout fires and marks it
        // `failed` itself. This is the fix for the previously observed bug
        // where the sweep raced the in-flight creation's own ingress wait.
        if age < budget * 2 {
            continue;
        }

        let Some(namespace) = &state.namespace else { continue };
        warn!(
            "fileserver reconcile: '{}' stuck in starting for {}s, reaping",
            user,
            age.num_seconds()
        );
        let _ = manager.k8s().delete_namespace(namespace).await;
        slot.set(FileServerState::absent(&user)).await;
        manager.bus().forget_user(&user);
        outcome.stuck_reaped += 1;
    }

    outcome
}
