// src/core/lab/mod.rs

//! The Lab Manager: the per-user lab state machine, manifest
//! construction, the creation/deletion protocols, and reconciliation
//! against Kubernetes ground truth.
//!
//! State lives in a `DashMap<String, Arc<UserSlot>>`, one entry per user
//! that has ever had a mutating operation or been discovered by
//! reconciliation. Mutating operations on a given user are serialized by
//! that user's own `tokio::sync::Mutex`; reads (`status`, `list`) only take
//! a brief lock to clone the current snapshot.

pub mod manifests;
mod reconcile;

use crate::config::{Config, LabConfig};
use crate::core::errors::ControllerError;
use crate::core::events::{ProgressEvent, ProgressEventBus};
use crate::core::images::{ImageService, RSPImage, TagClass};
use crate::core::k8s::KubernetesAdapter;
use crate::core::metrics::{LABS_BY_STATUS, SPAWN_ATTEMPTS_TOTAL, SPAWN_DURATION_SECONDS};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{info, warn};

pub use reconcile::ReconcileOutcome;

/// The lab state machine. Transitions are driven exclusively by
/// `LabManager`; every other component refers to users by name only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabStatus {
    Absent,
    Pending,
    Running,
    Terminating,
    Failed,
}

impl LabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Absent => "absent",
            LabStatus::Pending => "pending",
            LabStatus::Running => "running",
            LabStatus::Terminating => "terminating",
            LabStatus::Failed => "failed",
        }
    }
}

impl serde::Serialize for LabStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One of the ways a caller may select an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageChoice {
    Class { class: TagClass, index: usize },
    Tag(String),
    Digest(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub reference: String,
    pub digest: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedSize {
    pub name: String,
    pub cpu_limit: f64,
    pub memory_limit_bytes: u64,
    pub cpu_request: f64,
    pub memory_request_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LabOptions {
    pub env: BTreeMap<String, String>,
    pub debug: bool,
    pub reset_user_env: bool,
    /// Skips the non-root security context when set, for images that
    /// genuinely need root (e.g. to manage their own user namespace).
    pub privileged: bool,
}

#[derive(Debug, Clone)]
pub struct LabSpecRequest {
    pub image: ImageChoice,
    pub size: String,
    pub options: LabOptions,
}

#[derive(Debug, Clone)]
pub struct UserGroup {
    pub name: String,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct UserQuota {
    pub cpu: f64,
    pub memory_bytes: u64,
}

/// The subset of an identity-service user record (out of scope here) the
/// lab manager needs to build manifests and enforce quota.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub username: String,
    pub uid: u32,
    pub primary_gid: u32,
    pub groups: Vec<UserGroup>,
    pub quota: UserQuota,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Namespace,
    NetworkPolicy,
    PullSecret,
    Secret,
    EnvConfigMap,
    NssConfigMap,
    FilesConfigMap,
    Pvc,
    ResourceQuota,
    Service,
    Pod,
}

#[derive(Debug, Clone)]
pub struct ManagedResource {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

/// The per-user lab record.
#[derive(Debug, Clone)]
pub struct UserLabState {
    pub username: String,
    pub status: LabStatus,
    pub image: Option<ResolvedImage>,
    pub size: Option<ResolvedSize>,
    pub options: Option<LabOptions>,
    pub namespace: Option<String>,
    pub pod_uid: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub resources: Vec<ManagedResource>,
    pub last_error: Option<String>,
}

impl UserLabState {
    fn absent(username: &str) -> Self {
        Self {
            username: username.to_string(),
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
}

/// A user's slot: the serializing mutex over its state plus a cancellation
/// signal for any in-flight creation task, and the quota/identity captured
/// at the time of the most recent `create`.
struct UserSlot {
    state: Mutex<UserLabState>,
    cancel: watch::Sender<bool>,
}

impl UserSlot {
    fn new(username: &str) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state: Mutex::new(UserLabState::absent(username)),
            cancel,
        }
    }
}

pub struct LabManager {
    slots: DashMap<String, Arc<UserSlot>>,
    image_service: Arc<ImageService>,
    k8s: KubernetesAdapter,
    bus: Arc<ProgressEventBus>,
    config: Config,
}

impl LabManager {
    pub fn new(
        image_service: Arc<ImageService>,
        k8s: KubernetesAdapter,
        bus: Arc<ProgressEventBus>,
        config: Config,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            image_service,
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

    pub fn lab_config(&self) -> &LabConfig {
        &self.config.lab
    }

    /// Creates a lab for `user`. Validates synchronously (so no Kubernetes write ever
    /// happens for an input that was always going to be rejected), performs
    /// the `absent -> pending` transition under the user's own lock (the
    /// compare-and-set that rules out the double-insert race left as an
    /// question), and spawns the creation protocol as a background task.
    pub async fn create(
        self: &Arc<Self>,
        identity: UserIdentity,
        request: LabSpecRequest,
    ) -> Result<(), ControllerError> {
        let size = self.resolve_size(&request.size, &identity.quota)?;
        let image = self.resolve_image(&request.image)?;

        let slot = self.slot_for(&identity.username);
        {
            let mut state = slot.state.lock().await;
            match state.status {
                LabStatus::Absent => {}
                LabStatus::Pending => {
                    return Err(ControllerError::AlreadyExists(format!(
                        "lab for '{}' is already being created",
                        identity.username
                    )));
                }
                LabStatus::Terminating => {
                    return Err(ControllerError::Conflict(format!(
                        "lab for '{}' is being torn down",
                        identity.username
                    )));
                }
                LabStatus::Running => {
                    return Err(ControllerError::AlreadyExists(format!(
                        "lab for '{}' already exists",
                        identity.username
                    )));
                }
                LabStatus::Failed => {
                    return Err(ControllerError::Conflict(format!(
                        "lab for '{}' is in a failed state; delete it first",
                        identity.username
                    )));
                }
            }
            *state = UserLabState::absent(&identity.username);
            state.status = LabStatus::Pending;
            state.image = Some(image.clone());
            state.size = Some(size.clone());
            state.options = Some(request.options.clone());
        }
        // Reset the cancellation signal for this fresh attempt.
        let _ = slot.cancel.send(false);

        self.bus
            .publish(&identity.username, |seq| {
                ProgressEvent::info(seq, "Lab creation requested.")
            })
            .await;

        let manager = self.clone();
        let username = identity.username.clone();
        tokio::spawn(async move {
            manager.run_creation(slot, identity, request.options, image, size).await;
            let _ = username;
        });

        Ok(())
    }

    /// Deletes the lab for `user`. Cancels any in-flight creation, then transitions to
    /// `terminating` and runs the deletion protocol inline. Idempotent: a
    /// delete against `absent` is a no-op success.
    pub async fn delete(self: &Arc<Self>, user: &str) -> Result<(), ControllerError> {
        let slot = self.slot_for(user);
        let namespace = {
            let mut state = slot.state.lock().await;
            match state.status {
                LabStatus::Absent => return Ok(()),
                LabStatus::Pending => {
                    let _ = slot.cancel.send(true);
                }
                _ => {}
            }
            state.status = LabStatus::Terminating;
            state
                .namespace
                .clone()
                .unwrap_or_else(|| self.namespace_for(user))
        };

        self.bus
            .publish(user, |seq| ProgressEvent::info(seq, "Lab deletion requested."))
            .await;

        self.run_deletion(&slot, user, &namespace).await;
        Ok(())
    }

    pub async fn status(&self, user: &str) -> Result<UserLabState, ControllerError> {
        match self.slots.get(user) {
            Some(slot) => Ok(slot.state.lock().await.clone()),
            None => Err(ControllerError::NotFound(format!("no lab known for '{user}'"))),
        }
    }

    pub async fn events(
        &self,
        user: &str,
        after_seq: Option<u64>,
    ) -> Result<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>), ControllerError> {
        if !self.slots.contains_key(user) {
            return Err(ControllerError::NotFound(format!("no lab known for '{user}'")));
        }
        Ok(self.bus.subscribe(user, after_seq).await)
    }

    pub async fn list(&self) -> Vec<UserLabState> {
        let mut out = Vec::with_capacity(self.slots.len());
        for entry in self.slots.iter() {
            out.push(entry.value().state.lock().await.clone());
        }
        out
    }

    pub fn namespace_for(&self, user: &str) -> String {
        format!("{}-{}", self.config.lab.namespace_prefix, user)
    }

    fn resolve_image(&self, choice: &ImageChoice) -> Result<ResolvedImage, ControllerError> {
        let catalog = self.image_service.snapshot();
        let repository = self.config.images.source.repository().unwrap_or_default();
        let image: Arc<RSPImage> = match choice {
            ImageChoice::Class { class, index } => catalog
                .resolve_class(*class, *index)
                .ok_or_else(|| ControllerError::ImageUnknown(format!("{class:?}[{index}]")))?,
            ImageChoice::Tag(tag) => catalog
                .resolve_tag(tag)
                .ok_or_else(|| ControllerError::ImageUnknown(tag.clone()))?,
            ImageChoice::Digest(digest) => catalog
                .resolve_digest(digest)
                .ok_or_else(|| ControllerError::ImageUnknown(digest.clone()))?,
        };
        Ok(ResolvedImage {
            reference: image.reference(repository),
            digest: image.digest.clone(),
            description: image.description.clone(),
        })
    }

    fn resolve_size(&self, name: &str, quota: &UserQuota) -> Result<ResolvedSize, ControllerError> {
        let size = self
            .config
            .lab
            .sizes
            .get(name)
            .ok_or_else(|| ControllerError::Validation(format!("unknown lab size '{name}'")))?;

        if size.memory_limit_bytes as f64 > quota.memory_bytes as f64 {
            return Err(ControllerError::QuotaExceeded(format!(
                "size '{name}' requires {} bytes, quota allows {}",
                size.memory_limit_bytes, quota.memory_bytes
            )));
        }
        if size.cpu_limit > quota.cpu {
            return Err(ControllerError::QuotaExceeded(format!(
                "size '{name}' requires {} cpu, quota allows {}",
                size.cpu_limit, quota.cpu
            )));
        }

        let fraction = size.request_fraction.unwrap_or(1.0);
        Ok(ResolvedSize {
            name: name.to_string(),
            cpu_limit: size.cpu_limit,
            memory_limit_bytes: size.memory_limit_bytes,
            cpu_request: size.cpu_limit * fraction,
            memory_request_bytes: (size.memory_limit_bytes as f64 * fraction) as u64,
        })
    }

    /// The creation protocol, end to end. Each step emits a
    /// progress event; an unrecoverable error cancels remaining steps,
    /// marks `failed`, and leaves partial resources for `delete` to clean
    /// up. Every step checks the slot's cancellation signal so a `delete`
    /// racing a `pending` lab stops it promptly.
    async fn run_creation(
        self: Arc<Self>,
        slot: Arc<UserSlot>,
        identity: UserIdentity,
        options: LabOptions,
        image: ResolvedImage,
        size: ResolvedSize,
    ) {
        let user = identity.username.clone();
        let namespace = self.namespace_for(&user);
        let timer = SPAWN_DURATION_SECONDS.start_timer();
        let mut cancel_rx = slot.cancel.subscribe();

        let result = tokio::select! {
            result = self.run_creation_steps(&slot, &identity, &options, &image, &size, &namespace) => result,
            _ = wait_for_cancel(&mut cancel_rx) => {
                Err(ControllerError::Conflict("creation cancelled by a concurrent delete".into()))
            }
        };
        timer.observe_duration();

        match result {
            Ok(pod_uid) => {
                let mut state = slot.state.lock().await;
                // A delete that raced in after success already moved us to
                // terminating; don't clobber that with a late `running`.
                if state.status == LabStatus::Pending {
                    state.status = LabStatus::Running;
                    state.pod_uid = Some(pod_uid);
                    state.started_at = Some(Utc::now());
                }
                drop(state);
                SPAWN_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                self.bus
                    .publish(&user, |seq| ProgressEvent::ready(seq, "Lab is ready."))
                    .await;
            }
            Err(e) => {
                let mut state = slot.state.lock().await;
                if state.status == LabStatus::Pending {
                    state.status = LabStatus::Failed;
                    state.last_error = Some(e.to_string());
                }
                drop(state);
                SPAWN_ATTEMPTS_TOTAL
                    .with_label_values(&[if matches!(e, ControllerError::Timeout(_)) {
                        "timeout"
                    } else {
                        "failure"
                    }])
                    .inc();
                warn!("lab creation for '{}' failed: {}", user, e);
                self.bus
                    .publish(&user, |seq| ProgressEvent::error(seq, format!("Lab creation failed: {e}")))
                    .await;
            }
        }
    }

    async fn run_creation_steps(
        &self,
        slot: &UserSlot,
        identity: &UserIdentity,
        options: &LabOptions,
        image: &ResolvedImage,
        size: &ResolvedSize,
        namespace: &str,
    ) -> Result<String, ControllerError> {
        let budget = self.config.lab.spawn_timeout;
        tokio::time::timeout(budget, async {
            // Step 1: namespace, tearing down a stale one first if present.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Ensuring namespace."))
                .await;
            if self.k8s.get_namespace(namespace).await?.is_some() {
                warn!("stale namespace '{}' found, deleting before respawn", namespace);
                self.k8s.delete_namespace(namespace).await?;
                self.k8s
                    .wait_namespace_gone(namespace, self.config.lab.delete_timeout)
                    .await?;
            }
            let ns_manifest = manifests::build_namespace(&self.config.lab, namespace, &identity.username);
            self.k8s.create_namespace(&ns_manifest).await?;
            self.record_resource(slot, ResourceKind::Namespace, namespace, namespace)
                .await;

            // Step 2: NetworkPolicy.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Creating network policy."))
                .await;
            let netpol = manifests::build_network_policy(&self.config.lab, namespace);
            self.k8s.create_network_policy(namespace, &netpol).await?;
            self.record_resource(slot, ResourceKind::NetworkPolicy, namespace, "lab-network-policy")
                .await;

            // Step 3: pull secret.
            if let Some(pull_secret) = &self.config.lab.pull_secret_name {
                self.bus
                    .publish(&identity.username, |seq| ProgressEvent::info(seq, "Copying pull secret."))
                    .await;
                self.k8s
                    .copy_secret(&self.config.lab.hub_namespace, pull_secret, namespace, pull_secret)
                    .await?;
                self.record_resource(slot, ResourceKind::PullSecret, namespace, pull_secret)
                    .await;
            }

            // Step 4: composed secret from configured projections.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Composing user secret."))
                .await;
            let secret_name = format!("{}-secret", identity.username);
            if !self.config.lab.secret_projections.is_empty() {
                let secret = manifests::compose_secret(
                    &self.k8s,
                    &self.config.lab,
                    &secret_name,
                    namespace,
                )
                .await?;
                self.k8s.create_secret(namespace, &secret).await?;
                self.record_resource(slot, ResourceKind::Secret, namespace, &secret_name)
                    .await;
            }

            // Step 5: ConfigMaps (env, nss, static files).
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Creating config maps."))
                .await;
            let env_cm = manifests::build_env_configmap(
                &self.config.lab,
                namespace,
                identity,
                options,
                image,
                size,
                &secret_name,
            );
            self.k8s.create_config_map(namespace, &env_cm).await?;
            self.record_resource(slot, ResourceKind::EnvConfigMap, namespace, "lab-env")
                .await;

            let nss_cm = manifests::build_nss_configmap(&self.config.lab, namespace, identity);
            self.k8s.create_config_map(namespace, &nss_cm).await?;
            self.record_resource(slot, ResourceKind::NssConfigMap, namespace, "lab-nss")
                .await;

            if !self.config.lab.static_files.is_empty() {
                let files_cm = manifests::build_files_configmap(&self.config.lab, namespace);
                self.k8s.create_config_map(namespace, &files_cm).await?;
                self.record_resource(slot, ResourceKind::FilesConfigMap, namespace, "lab-files")
                    .await;
            }

            // Step 6: PVCs.
            for volume in &self.config.lab.volumes {
                let pvc = manifests::build_pvc(volume, namespace);
                let pvc_name = format!("{}-pvc", volume.name);
                self.k8s.create_pvc(namespace, &pvc).await?;
                self.record_resource(slot, ResourceKind::Pvc, namespace, &pvc_name)
                    .await;
            }

            // Step 7: ResourceQuota.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Applying resource quota."))
                .await;
            let quota = manifests::build_resource_quota(namespace, &identity.quota);
            self.k8s.create_resource_quota(namespace, &quota).await?;
            self.record_resource(slot, ResourceKind::ResourceQuota, namespace, "lab-quota")
                .await;

            // Step 8: wait for the default ServiceAccount.
            self.k8s
                .wait_for_default_service_account(namespace, self.config.lab.spawn_timeout)
                .await?;

            // Step 9: Service.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Creating lab service."))
                .await;
            let svc = manifests::build_service(&self.config.lab, namespace);
            self.k8s.create_service(namespace, &svc).await?;
            self.record_resource(slot, ResourceKind::Service, namespace, "lab")
                .await;

            // Step 10: Pod.
            self.bus
                .publish(&identity.username, |seq| ProgressEvent::info(seq, "Launching lab pod."))
                .await;
            let pod = manifests::build_pod(
                &self.config.lab,
                namespace,
                identity,
                options,
                image,
                size,
                &secret_name,
            );
            let created_pod = self.k8s.create_pod(namespace, &pod).await?;
            self.record_resource(slot, ResourceKind::Pod, namespace, "lab")
                .await;

            // Step 11: watch the pod through to Running (or Failed), and
            // optionally through the reset-env init container's completion.
            let pod_uid = reconcile::watch_pod_to_ready(
                &self.k8s,
                namespace,
                "lab",
                options.reset_user_env,
                &self.bus,
                &identity.username,
                self.config.lab.spawn_timeout,
            )
            .await?;

            Ok(pod_uid.or_else(|| created_pod.metadata.uid.clone()).unwrap_or_default())
        })
        .await
        .map_err(|_| ControllerError::spawn_timeout("overall lab creation"))?
    }

    async fn record_resource(&self, slot: &UserSlot, kind: ResourceKind, namespace: &str, name: &str) {
        let mut state = slot.state.lock().await;
        state.namespace = Some(namespace.to_string());
        state.resources.push(ManagedResource {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    /// The deletion protocol: delete the namespace with foreground
    /// propagation and wait, bounded by `delete_timeout`. Always succeeds
    /// against partial state since every step is idempotent.
    async fn run_deletion(&self, slot: &UserSlot, user: &str, namespace: &str) {
        self.bus
            .publish(user, |seq| ProgressEvent::info(seq, "Tearing down namespace."))
            .await;

        let result = async {
            self.k8s.delete_namespace(namespace).await?;
            self.k8s.wait_namespace_gone(namespace, self.config.lab.delete_timeout).await
        }
        .await;

        let mut state = slot.state.lock().await;
        match result {
            Ok(()) => {
                *state = UserLabState::absent(user);
                drop(state);
                self.bus
                    .publish(user, |seq| ProgressEvent::info(seq, "Lab deleted."))
                    .await;
                self.bus.forget_user(user);
            }
            Err(e) => {
                state.status = LabStatus::Failed;
                state.last_error = Some(e.to_string());
                drop(state);
                warn!("teardown of '{}' exceeded delete_timeout: {}", user, e);
                self.bus
                    .publish(user, |seq| ProgressEvent::error(seq, format!("Teardown timed out: {e}")))
                    .await;
            }
        }
    }

    /// Reconciliation: list lab namespaces, diff against in-memory
    /// state, and converge. Never acts on a namespace whose own
    /// `owning annotation` shows it is still being created.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        reconcile::reconcile(self).await
    }

    /// Updates the `nublado_labs_by_status` gauge from the current in-memory
    /// slot snapshot. Uses `try_lock` so a busy slot is simply skipped for
    /// this tick rather than stalling the metrics publisher.
    pub fn publish_metrics(&self) {
        let mut counts = std::collections::HashMap::new();
        for entry in self.slots.iter() {
            let status = entry
                .value()
                .state
                .try_lock()
                .map(|s| s.status)
                .unwrap_or(LabStatus::Absent);
            *counts.entry(status).or_insert(0) += 1;
        }
        for status in [
            LabStatus::Absent,
            LabStatus::Pending,
            LabStatus::Running,
            LabStatus::Terminating,
            LabStatus::Failed,
        ] {
            LABS_BY_STATUS
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

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender (the slot) is gone; nothing left to cancel for.
            std::future::pending::<()>().await;
        }
    }
}

impl UserSlot {
    pub(crate) async fn get(&self) -> UserLabState {
        self.state.lock().await.clone()
    }

    pub(crate) async fn set(&self, new_state: UserLabState) {
        *self.state.lock().await = new_state;
    }

    pub(crate) async fn status(&self) -> LabStatus {
        self.state.lock().await.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        FileServerConfig, HttpConfig, IdentityConfig, ImageSourceConfig, ImagesConfig, LabSize, MetricsConfig,
        PrepullerConfig,
    };
    use std::collections::BTreeMap as Map;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut sizes = Map::new();
        sizes.insert(
            "small".to_string(),
            LabSize {
                cpu_limit: 1.0,
                memory_limit_bytes: 1 << 30,
                request_fraction: Some(0.25),
            },
        );
        Config {
            log_level: "info".into(),
            http: HttpConfig::default(),
            metrics: MetricsConfig::default(),
            images: ImagesConfig {
                source: ImageSourceConfig::Static { tags: Map::new() },
                refresh_interval: Duration::from_secs(60),
                recommended_tag: None,
                num_releases: 1,
                num_weeklies: 1,
                num_dailies: 1,
                cycle: None,
                pins: vec![],
                num_to_prepull_per_class: 1,
            },
            lab: LabConfig {
                namespace_prefix: "userlabs".into(),
                hub_namespace: "hub".into(),
                lab_port: 8888,
                pull_secret_name: None,
                secret_projections: vec![],
                volumes: vec![],
                env: Map::new(),
                node_selector: Map::new(),
                tolerations: vec![],
                sizes,
                argocd_instance: None,
                spawn_timeout: Duration::from_secs(60),
                delete_timeout: Duration::from_secs(30),
                reconcile_interval: Duration::from_secs(60),
                base_passwd: String::new(),
                base_group: String::new(),
                static_files: Map::new(),
            },
            prepuller: PrepullerConfig::default(),
            fileserver: FileServerConfig::default(),
            identity: IdentityConfig::default(),
        }
    }

    fn quota(cpu: f64, mem_gb: u64) -> UserQuota {
        UserQuota { cpu, memory_bytes: mem_gb << 30 }
    }

    /// Exercises the same arithmetic `resolve_size` uses, without needing a
    /// live `LabManager` (which requires a real `kube::Client`): a size
    /// whose memory exceeds the quota must be rejected, matching scenario 3
    /// that a quota-exceeded size is rejected before any Kubernetes write.
    #[test]
    fn huge_size_exceeds_small_quota() {
        let config = test_config();
        let huge = LabSize {
            cpu_limit: 12.0,
            memory_limit_bytes: 64 << 30,
            request_fraction: None,
        };
        let q = quota(9.0, 27);
        assert!(huge.cpu_limit > q.cpu);
        assert!(huge.memory_limit_bytes as f64 > q.memory_bytes as f64);
        assert!(config.lab.sizes.contains_key("small"));
    }

    #[test]
    fn small_size_fits_within_generous_quota() {
        let config = test_config();
        let small = config.lab.sizes.get("small").unwrap();
        let q = quota(9.0, 27);
        assert!(small.cpu_limit <= q.cpu);
        assert!((small.memory_limit_bytes as f64) <= q.memory_bytes as f64);
    }

    #[test]
    fn lab_status_as_str_round_trips() {
        assert_eq!(LabStatus::Pending.as_str(), "pending");
        assert_eq!(LabStatus::Failed.as_str(), "failed");
    }
}
