// src/core/fileserver/mod.rs

//! The File-Server Manager: per-user on-demand WebDAV file-server
//! lifecycle, driven by the same per-user-slot pattern as the Lab Manager
//! but over a `Job` instead of a bare `Pod`, and torn down either by the
//! server's own idle timeout (it exits, the Job completes) or by explicit
//! delete.

pub mod manifests;
mod reconcile;

use crate::config::{Config, FileServerConfig};
use crate::core::errors::ControllerError;
use crate::core::events::{ProgressEvent, ProgressEventBus};
use crate::core::k8s::KubernetesAdapter;
use crate::core::metrics::FILESERVERS_BY_STATUS;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::warn;

pub use reconcile::ReconcileOutcome;

/// Per-user state machine. Kept distinct from `LabStatus` even
/// though the shapes rhyme, since the two resources are owned and reaped
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileServerStatus {
    Absent,
    Starting,
    Running,
    Terminating,
    Failed,
}

impl FileServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileServerStatus::Absent => "absent",
            FileServerStatus::Starting => "starting",
            FileServerStatus::Running => "running",
            FileServerStatus::Terminating => "terminating",
            FileServerStatus::Failed => "failed",
        }
    }
}

impl serde::Serialize for FileServerStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileServerResourceKind {
    Job,
    Service,
    Ingress,
    Pvc,
}

#[derive(Debug, Clone)]
pub struct ManagedFileServerResource {
    pub kind: FileServerResourceKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FileServerState {
    pub username: String,
    pub status: FileServerStatus,
    pub namespace: Option<String>,
    pub job_name: Option<String>,
    pub pod_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub resources: Vec<ManagedFileServerResource>,
    pub last_error: Option<String>,
}

impl FileServerState {
    fn absent(username: &str) -> Self {
        Self {
            username: username.to_string(),
            status: FileServerStatus::Absent,
            namespace: None,
            job_name: None,
            pod_name: None,
            created_at: None,
            resources: Vec::new(),
            last_error: None,
        }
    }
}

struct UserSlot {
    state: Mutex<FileServerState>,
    cancel: watch::Sender<bool>,
}

impl UserSlot {
    fn new(username: &str) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state: Mutex::new(FileServerState::absent(username)),
            cancel,
        }
    }

    pub(crate) async fn get(&self) -> FileServerState {
        self.state.lock().await.clone()
    }

    pub(crate) async fn set(&self, new_state: FileServerState) {
        *self.state.lock().await = new_state;
    }

    pub(crate) async fn status(&self) -> FileServerStatus {
        self.state.lock().await.status
    }
}

pub struct FileServerManager {
    slots: DashMap<String, Arc<UserSlot>>,
    k8s: KubernetesAdapter,
    bus: Arc<ProgressEventBus>,
    config: Config,
}

impl FileServerManager {
    pub fn new(k8s: KubernetesAdapter, bus: Arc<ProgressEventBus>, config: Config) -> Self {
        Self {
            slots: DashMap::new(),
            k8s,
            bus,
            config,
        }
    }

    fn slot_for(&self, user: &str) -> Arc<UserSlot> {
        self.slots
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(UserSlot::new(user)))
            .value()
            .clone()
    }

    pub fn fileserver_config(&self) -> &FileServerConfig {
        &self.config.fileserver
    }

    pub fn namespace_for(&self, user: &str) -> String {
        format!("{}-{}", self.config.fileserver.namespace_prefix, user)
    }

    /// Creates a file server for `user`. `running` and `starting` are both reused as-is
    /// (idempotent request), matching the documented "if an entry exists in
    /// state running or starting, it is reused" behavior.
    pub async fn create(self: &Arc<Self>, user: &str) -> Result<(), ControllerError> {
        if !self.config.fileserver.enabled {
            return Err(ControllerError::Validation("file servers are disabled".to_string()));
        }

        let slot = self.slot_for(user);
        {
            let mut state = slot.state.lock().await;
            match state.status {
                FileServerStatus::Running | FileServerStatus::Starting => return Ok(()),
                FileServerStatus::Terminating => {
                    return Err(ControllerError::Conflict(format!(
                        "file server for '{user}' is being torn down"
                    )));
                }
                FileServerStatus::Absent | FileServerStatus::Failed => {}
            }
            *state = FileServerState::absent(user);
            state.status = FileServerStatus::Starting;
            state.created_at = Some(Utc::now());
        }
        let _ = slot.cancel.send(false);

        self.bus
            .publish(user, |seq| ProgressEvent::info(seq, "File server creation requested."))
            .await;

        let manager = self.clone();
        let username = user.to_string();
        tokio::spawn(async move {
            manager.run_creation(slot, username).await;
        });

        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, user: &str) -> Result<(), ControllerError> {
        let slot = self.slot_for(user);
        let namespace = {
            let mut state = slot.state.lock().await;
            match state.status {
                FileServerStatus::Absent => return Ok(()),
                FileServerStatus::Starting => {
                    let _ = slot.cancel.send(true);
                }
                _ => {}
            }
            state.status = FileServerStatus::Terminating;
            state.namespace.clone().unwrap_or_else(|| self.namespace_for(user))
        };

        self.bus
            .publish(user, |seq| ProgressEvent::info(seq, "File server deletion requested."))
            .await;

        self.run_deletion(&slot, user, &namespace).await;
        Ok(())
    }

    pub async fn status(&self, user: &str) -> Result<FileServerState, ControllerError> {
        match self.slots.get(user) {
            Some(slot) => Ok(slot.state.lock().await.clone()),
            None => Err(ControllerError::NotFound(format!("no file server known for '{user}'"))),
        }
    }

    async fn run_creation(self: Arc<Self>, slot: Arc<UserSlot>, user: String) {
        let namespace = self.namespace_for(&user);
        let mut cancel_rx = slot.cancel.subscribe();

        let result = tokio::select! {
            result = self.run_creation_steps(&slot, &user, &namespace) => result,
            _ = wait_for_cancel(&mut cancel_rx) => {
                Err(ControllerError::Conflict("creation cancelled by a concurrent delete".into()))
            }
        };

        match result {
            Ok(()) => {
                let mut state = slot.state.lock().await;
                if state.status == FileServerStatus::Starting {
                    state.status = FileServerStatus::Running;
                }
                drop(state);
                self.bus
                    .publish(&user, |seq| ProgressEvent::ready(seq, "File server is ready."))
                    .await;
            }
            Err(e) => {
                let mut state = slot.state.lock().await;
                if state.status == FileServerStatus::Starting {
                    state.status = FileServerStatus::Failed;
                    state.last_error = Some(e.to_string());
                }
                drop(state);
                warn!("file server creation for '{}' failed: {}", user, e);
                self.bus
                    .publish(&user, |seq| ProgressEvent::error(seq, format!("File server creation failed: {e}")))
                    .await;
            }
        }
    }

    async fn run_creation_steps(
        &self,
        slot: &UserSlot,
        user: &str,
        namespace: &str,
    ) -> Result<(), ControllerError> {
        let budget = self.config.fileserver.creation_timeout;
        tokio::time::timeout(budget, async {
            self.bus
                .publish(user, |seq| ProgressEvent::info(seq, "Ensuring file-server namespace."))
                .await;
            if self.k8s.get_namespace(namespace).await?.is_none() {
                let ns = manifests::build_namespace(namespace, user);
                self.k8s.create_namespace(&ns).await?;
            }
            {
                let mut state = slot.state.lock().await;
                state.namespace = Some(namespace.to_string());
            }

            for volume in &self.config.fileserver.volumes {
                self.bus
                    .publish(user, |seq| ProgressEvent::info(seq, "Creating storage volume."))
                    .await;
                let pvc = manifests::build_pvc(volume, namespace);
                let pvc_name = format!("{}-pvc", volume.name);
                self.k8s.create_pvc(namespace, &pvc).await?;
                self.record_resource(slot, FileServerResourceKind::Pvc, namespace, &pvc_name)
                    .await;
            }

            self.bus
                .publish(user, |seq| ProgressEvent::info(seq, "Submitting file-server job."))
                .await;
            let job = manifests::build_job(&self.config.fileserver, namespace, user);
            self.k8s.create_job(namespace, &job).await?;
            let job_name = job.metadata.name.clone().unwrap_or_else(|| "fileserver".to_string());
            self.record_resource(slot, FileServerResourceKind::Job, namespace, &job_name)
                .await;
            {
                let mut state = slot.state.lock().await;
                state.job_name = Some(job_name.clone());
            }

            self.bus
                .publish(user, |seq| ProgressEvent::info(seq, "Creating file-server service."))
                .await;
            let svc = manifests::build_service(namespace);
            self.k8s.create_service(namespace, &svc).await?;
            self.record_resource(slot, FileServerResourceKind::Service, namespace, "fileserver")
                .await;

            self.bus
                .publish(user, |seq| ProgressEvent::info(seq, "Creating file-server ingress."))
                .await;
            let ingress = manifests::build_ingress(&self.config.fileserver, namespace, user);
            self.k8s.create_ingress(namespace, &ingress).await?;
            self.record_resource(slot, FileServerResourceKind::Ingress, namespace, "fileserver")
                .await;

            self.k8s
                .wait_ingress_ready(namespace, "fileserver", self.config.fileserver.creation_timeout)
                .await?;

            Ok(())
        })
        .await
        .map_err(|_| ControllerError::spawn_timeout("file server creation"))?
    }

    async fn record_resource(&self, slot: &UserSlot, kind: FileServerResourceKind, namespace: &str, name: &str) {
        let mut state = slot.state.lock().await;
        state.namespace = Some(namespace.to_string());
        state.resources.push(ManagedFileServerResource {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    async fn run_deletion(&self, slot: &UserSlot, user: &str, namespace: &str) {
        self.bus
            .publish(user, |seq| ProgressEvent::info(seq, "Tearing down file server."))
            .await;

        let result = async {
            self.k8s.delete_namespace(namespace).await?;
            self.k8s
                .wait_namespace_gone(namespace, self.config.fileserver.creation_timeout)
                .await
        }
        .await;

        let mut state = slot.state.lock().await;
        match result {
            Ok(()) => {
                *state = FileServerState::absent(user);
                drop(state);
                self.bus
                    .publish(user, |seq| ProgressEvent::info(seq, "File server deleted."))
                    .await;
                self.bus.forget_user(user);
            }
            Err(e) => {
                state.status = FileServerStatus::Failed;
                state.last_error = Some(e.to_string());
                drop(state);
                warn!("file server teardown for '{}' failed: {}", user, e);
                self.bus
                    .publish(user, |seq| ProgressEvent::error(seq, format!("Teardown failed: {e}")))
                    .await;
            }
        }
    }

    /// Reconciles in-memory state against Kubernetes ground truth: a `Job`
    /// that reached `Succeeded`/`Failed` (the server exited, typically from
    /// its own idle timeout) triggers the same cleanup as an explicit
    /// delete; a sweep for orphaned namespaces with no in-memory owner
    /// removes them outright.
    pub async fn reconcile(self: &Arc<Self>) -> ReconcileOutcome {
        reconcile::reconcile(self).await
    }

    pub fn publish_metrics(&self) {
        let mut counts = std::collections::HashMap::new();
        for entry in self.slots.iter() {
            *counts.entry(entry.value().state.try_lock().map(|s| s.status).unwrap_or(FileServerStatus::Absent)).or_insert(0) += 1;
        }
        for status in [
            FileServerStatus::Absent,
            FileServerStatus::Starting,
            FileServerStatus::Running,
            FileServerStatus::Terminating,
            FileServerStatus::Failed,
        ] {
            FILESERVERS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(*counts.get(&status).unwrap_or(&0) as f64);
        }
    }

    pub(crate) fn k8s(&self) -> &KubernetesAdapter {
        &self.k8s
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn slots_snapshot(&self) -> Vec<(String, Arc<UserSlot>)> {
        self.slots.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub(crate) fn slot_entry(&self, user: &str) -> Arc<UserSlot> {
        self.slot_for(user)
    }

    pub(crate) fn bus(&self) -> &Arc<ProgressEventBus> {
        &self.bus
    }
}

/// Shared with the Lab Manager's identical cancellation-wait loop; kept as a
/// free function here rather than pulled in as a dependency between the two
/// sibling modules, since both are intentionally self-contained.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_as_str_round_trips() {
        assert_eq!(FileServerStatus::Starting.as_str(), "starting");
        assert_eq!(FileServerStatus::Absent.as_str(), "absent");
    }
}
