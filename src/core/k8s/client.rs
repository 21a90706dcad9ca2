// src/core/k8s/client.rs

//! The Kubernetes Adapter: typed create/get/delete primitives over the
//! resource kinds the lab and file-server managers need, wrapping every
//! call with a default timeout and classifying failures into
//! [`ControllerError`].

use super::ingress::GafaelfawrIngress;
use crate::core::errors::ControllerError;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, PersistentVolumeClaim, Pod, ResourceQuota, Secret, Service,
    ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// The wall-clock budget given to any single Kubernetes API call issued
/// through this adapter, independent of the caller's own step timeout. This
/// bounds a stuck API server connection from hanging a spawn/delete step
/// forever even if the step's own timeout is generous.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The default wait period for eventually-consistent API-server side effects
/// (e.g. `ServiceAccount` token population) that have no native watch in the
/// hot path.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type Result<T> = std::result::Result<T, ControllerError>;

/// A façade over `kube::Client` exposing only the operations the controller
/// needs, each pre-wired with a timeout and error classification. Holds no
/// durable state of its own.
#[derive(Clone)]
pub struct KubernetesAdapter {
    client: Client,
}

async fn with_timeout<T, F>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, kube::Error>>,
{
    match timeout(DEFAULT_CALL_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ControllerError::from(e)),
        Err(_) => Err(ControllerError::Timeout(
            "Kubernetes API call exceeded its internal budget".into(),
        )),
    }
}

/// Treats a `NotFound` result as success for idempotent deletes.
fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(ControllerError::NotFound(_)) => Ok(()),
        other => other,
    }
}

impl KubernetesAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds an adapter from the in-cluster (or local kubeconfig, when
    /// running outside a pod) configuration.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Internal(format!("failed to build Kubernetes client: {e}")))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    // --- Namespace ---

    pub async fn create_namespace(&self, ns: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        with_timeout(api.create(&PostParams::default(), ns)).await
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match with_timeout(api.get(name)).await {
            Ok(ns) => Ok(Some(ns)),
            Err(ControllerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes the namespace with foreground propagation and returns
    /// immediately; callers that need to block until the namespace is fully
    /// gone should poll [`Self::namespace_gone`].
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        let result = with_timeout(api.delete(name, &dp)).await.map(|_| ());
        ignore_not_found(result)
    }

    /// Polls until `name` no longer exists or `budget` elapses.
    pub async fn wait_namespace_gone(&self, name: &str, budget: Duration) -> Result<()> {
        self.poll_until(budget, || async {
            Ok(self.get_namespace(name).await?.is_none())
        })
        .await
        .map_err(|_| ControllerError::teardown_timeout(&format!("namespace '{name}'")))
    }

    /// Lists every namespace matching `label_selector`, used by
    /// reconciliation to discover lab/file-server namespaces without
    /// depending on naming convention alone.
    pub async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(label_selector);
        Ok(with_timeout(api.list(&lp)).await?.items)
    }

    // --- Generic namespaced create/delete helpers ---

    pub async fn create_network_policy(&self, ns: &str, policy: &NetworkPolicy) -> Result<NetworkPolicy> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), policy)).await
    }

    pub async fn create_secret(&self, ns: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), secret)).await
    }

    pub async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        match with_timeout(api.get(name)).await {
            Ok(secret) => Ok(Some(secret)),
            Err(ControllerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), cm)).await
    }

    pub async fn create_pvc(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), pvc)).await
    }

    pub async fn create_resource_quota(&self, ns: &str, quota: &ResourceQuota) -> Result<ResourceQuota> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), quota)).await
    }

    pub async fn create_service(&self, ns: &str, svc: &Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), svc)).await
    }

    pub async fn create_pod(&self, ns: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), pod)).await
    }

    pub async fn get_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        match with_timeout(api.get(name)).await {
            Ok(pod) => Ok(Some(pod)),
            Err(ControllerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_pod(&self, ns: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let result = with_timeout(api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    pub async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let lp = ListParams::default().labels(label_selector);
        Ok(with_timeout(api.list(&lp)).await?.items)
    }

    pub async fn create_job(&self, ns: &str, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), job)).await
    }

    pub async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        match with_timeout(api.get(name)).await {
            Ok(job) => Ok(Some(job)),
            Err(ControllerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_ingress(&self, ns: &str, ingress: &GafaelfawrIngress) -> Result<GafaelfawrIngress> {
        let api: Api<GafaelfawrIngress> = Api::namespaced(self.client.clone(), ns);
        with_timeout(api.create(&PostParams::default(), ingress)).await
    }

    pub async fn get_ingress(&self, ns: &str, name: &str) -> Result<Option<GafaelfawrIngress>> {
        let api: Api<GafaelfawrIngress> = Api::namespaced(self.client.clone(), ns);
        match with_timeout(api.get(name)).await {
            Ok(ing) => Ok(Some(ing)),
            Err(ControllerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waits for the `Ingress` to have at least one load-balancer address,
    /// used as the last creation step for file servers.
    pub async fn wait_ingress_ready(&self, ns: &str, name: &str, budget: Duration) -> Result<()> {
        self.poll_until(budget, || async {
            Ok(self
                .get_ingress(ns, name)
                .await?
                .map(|ing| ing.has_address())
                .unwrap_or(false))
        })
        .await
        .map_err(|_| ControllerError::spawn_timeout("waiting for ingress address"))
    }

    /// Copies `source_secret` from `source_ns` into `dest_ns`, stripped of
    /// server-assigned metadata, as the pull-secret step of lab creation.
    pub async fn copy_secret(
        &self,
        source_ns: &str,
        source_secret: &str,
        dest_ns: &str,
        dest_name: &str,
    ) -> Result<Secret> {
        let source_api: Api<Secret> = Api::namespaced(self.client.clone(), source_ns);
        let mut secret = with_timeout(source_api.get(source_secret)).await?;
        secret.metadata.name = Some(dest_name.to_string());
        secret.metadata.namespace = Some(dest_ns.to_string());
        secret.metadata.resource_version = None;
        secret.metadata.uid = None;
        secret.metadata.owner_references = None;
        secret.metadata.creation_timestamp = None;
        self.create_secret(dest_ns, &secret).await
    }

    /// Blocks (bounded by `budget`) until the namespace's default
    /// `ServiceAccount` exists, since the API server populates it
    /// asynchronously after namespace creation.
    pub async fn wait_for_default_service_account(&self, ns: &str, budget: Duration) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), ns);
        self.poll_until(budget, || async {
            match with_timeout(api.get("default")).await {
                Ok(_) => Ok(true),
                Err(ControllerError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|_| ControllerError::spawn_timeout("waiting for default ServiceAccount"))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(with_timeout(api.list(&ListParams::default())).await?.items)
    }

    /// Applies a JSON merge patch; used by reconciliation to update
    /// synthesized annotations without clobbering server-managed fields.
    pub async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        with_timeout(api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .map(|_: Namespace| ())
    }

    /// Polls `predicate` at a fixed interval until it returns `true` or
    /// `budget` elapses, returning `Err(())` on timeout. Used internally for
    /// the handful of "wait for eventual consistency" steps that have no
    /// dedicated watch.
    async fn poll_until<F, Fut>(&self, budget: Duration, mut predicate: F) -> std::result::Result<(), ()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match predicate().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    debug!("poll_until predicate errored, treating as not-yet-ready: {}", e);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(());
            }
            tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for KubernetesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesAdapter").finish_non_exhaustive()
    }
}

/// Logs a brief summary of the outcome of a create-resource step, for the
/// creation protocol's step-by-step tracing.
pub fn log_created(kind: &str, namespace: &str, name: &str) {
    info!("Created {} '{}' in namespace '{}'.", kind, name, namespace);
}
