// src/core/prepuller/mod.rs

//! The Prepuller: computes the gap between what `to-prepull` requires and
//! what each eligible node already caches, and drives per-node prepull
//! pods, bounded by a concurrency cap, until the gap closes.

use crate::config::{ImagesConfig, LabConfig, PrepullerConfig};
use crate::core::images::ImageService;
use crate::core::k8s::KubernetesAdapter;
use crate::core::metrics::PREPULL_PODS_CREATED_TOTAL;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, Pod, PodSpec, ResourceRequirements, Toleration as K8sToleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

/// A single `(node, digest)` pair still missing from an eligible node,
/// exactly as defined by the gap computation below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GapEntry {
    pub node: String,
    pub digest: String,
}

/// Tracks in-flight and backed-off prepull attempts so retries don't pile
/// up pods for the same `(node, digest)` pair.
struct PrepullAttempt {
    failures: u32,
    next_attempt_at: tokio::time::Instant,
}

pub struct PrepullerTask {
    image_service: Arc<ImageService>,
    k8s: KubernetesAdapter,
    lab_config: LabConfig,
    images_config: ImagesConfig,
    prepuller_config: PrepullerConfig,
    in_flight: DashMap<GapEntry, ()>,
    backoffs: DashMap<GapEntry, PrepullAttempt>,
}

impl PrepullerTask {
    pub fn new(
        image_service: Arc<ImageService>,
        k8s: KubernetesAdapter,
        lab_config: LabConfig,
        images_config: ImagesConfig,
        prepuller_config: PrepullerConfig,
    ) -> Self {
        Self {
            image_service,
            k8s,
            lab_config,
            images_config,
            prepuller_config,
            in_flight: DashMap::new(),
            backoffs: DashMap::new(),
        }
    }

    /// Runs a single gap-closing tick: recomputes eligible nodes directly
    /// (so a node that vanished between catalog refresh and now is
    /// tolerated rather than raised), diffs against `to_prepull`, and
    /// submits pods for anything missing and not already in flight or
    /// backed off.
    pub async fn tick(&self) {
        let catalog = self.image_service.snapshot();
        if catalog.to_prepull.is_empty() {
            return;
        }

        let nodes = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("prepuller tick: failed to list nodes, skipping: {}", e);
                return;
            }
        };
        let node_view = crate::core::images::NodeView::build(
            &nodes,
            &self.lab_config.node_selector,
            &self.lab_config.tolerations,
        );

        let mut gap = Vec::new();
        for node in node_view.eligible_nodes() {
            for digest in &catalog.to_prepull {
                if !node.digests.contains(digest) {
                    gap.push(GapEntry {
                        node: node.name.clone(),
                        digest: digest.clone(),
                    });
                }
            }
        }
        crate::core::metrics::PREPULL_GAP_SIZE.set(gap.len() as f64);

        let now = tokio::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.prepuller_config.max_concurrent_pods));
        let mut handles = Vec::new();

        for entry in gap {
            if self.in_flight.contains_key(&entry) {
                continue;
            }
            if let Some(attempt) = self.backoffs.get(&entry) {
                if attempt.next_attempt_at > now {
                    continue;
                }
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            self.in_flight.insert(entry.clone(), ());
            let k8s = self.k8s.clone();
            let namespace = self.prepuller_config.namespace.clone();
            let pod_timeout = self.prepuller_config.pod_timeout;
            let pull_secret = self.lab_config.pull_secret_name.clone();
            let tolerations = self.lab_config.tolerations.clone();
            let image_reference = self.images_config.image_reference(&entry.digest);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result =
                    run_single_prepull(&k8s, &namespace, &entry, &image_reference, pod_timeout, pull_secret, &tolerations)
                        .await;
                (entry, result)
            }));
        }

        for handle in handles {
            if let Ok((entry, result)) = handle.await {
                self.in_flight.remove(&entry);
                match result {
                    Ok(()) => {
                        self.backoffs.remove(&entry);
                        PREPULL_PODS_CREATED_TOTAL.inc();
                    }
                    Err(e) => {
                        let failures = self
                            .backoffs
                            .get(&entry)
                            .map(|a| a.failures + 1)
                            .unwrap_or(1);
                        let backoff_secs = (2u64.saturating_pow(failures)).min(self.prepuller_config.max_backoff_seconds);
                        warn!(
                            "prepull of {} on node {} failed (attempt {}), backing off {}s: {}",
                            entry.digest, entry.node, failures, backoff_secs, e
                        );
                        self.backoffs.insert(
                            entry,
                            PrepullAttempt {
                                failures,
                                next_attempt_at: now + Duration::from_secs(backoff_secs),
                            },
                        );
                    }
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Prepuller task started.");
        let mut interval = tokio::time::interval(self.prepuller_config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Prepuller task shutting down.");
                    return;
                }
            }
        }
    }
}

fn pod_name(entry: &GapEntry) -> String {
    let short_digest = entry.digest.trim_start_matches("sha256:").chars().take(12).collect::<String>();
    format!("prepull-{}-{}", entry.node.replace('.', "-"), short_digest)
}

/// Submits a single prepull pod pinned to `entry.node`, whose sole purpose
/// is to pull the image (`sleep 5`), and waits up to `timeout` for it to
/// complete before cleaning it up.
async fn run_single_prepull(
    k8s: &KubernetesAdapter,
    namespace: &str,
    entry: &GapEntry,
    image_reference: &str,
    timeout: Duration,
    pull_secret: Option<String>,
    tolerations: &[crate::config::Toleration],
) -> Result<(), crate::core::errors::ControllerError> {
    let name = pod_name(entry);
    debug!("submitting prepull pod '{}' for digest {} on node {}", name, entry.digest, entry.node);

    let mut labels = BTreeMap::new();
    labels.insert("category".to_string(), "prepull".to_string());

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(entry.node.clone()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "prepull".to_string(),
                image: Some(image_reference.to_string()),
                command: Some(vec!["sleep".to_string(), "5".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity("10m".to_string())),
                        ("memory".to_string(), Quantity("16Mi".to_string())),
                    ])),
                    ..Default::default()
                }),
                env: Some(vec![EnvVar {
                    name: "PREPULL_DIGEST".to_string(),
                    value: Some(entry.digest.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            image_pull_secrets: pull_secret.map(|name| vec![LocalObjectReference { name }]),
            tolerations: Some(
                tolerations
                    .iter()
                    .map(|t| K8sToleration {
                        key: Some(t.key.clone()),
                        operator: Some(t.operator.clone()),
                        value: t.value.clone(),
                        effect: Some(t.effect.clone()),
                        toleration_seconds: None,
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    k8s.create_pod(namespace, &pod).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(existing) = k8s.get_pod(namespace, &name).await? {
            if let Some(phase) = existing.status.as_ref().and_then(|s| s.phase.as_deref()) {
                if phase == "Succeeded" {
                    k8s.delete_pod(namespace, &name).await?;
                    return Ok(());
                }
                if phase == "Failed" {
                    k8s.delete_pod(namespace, &name).await?;
                    return Err(crate::core::errors::ControllerError::UpstreamTransient(format!(
                        "prepull pod '{name}' failed"
                    )));
                }
            }
        } else {
            // The node disappeared or the pod was evicted mid-prepull;
            // this is tolerated, not raised, per the gap-element contract.
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            let _ = k8s.delete_pod(namespace, &name).await;
            return Err(crate::core::errors::ControllerError::spawn_timeout("prepull pod completion"));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_is_stable_and_namespaced_by_node_and_digest() {
        let entry = GapEntry {
            node: "node-1.cluster.local".to_string(),
            digest: "sha256:abcdef0123456789".to_string(),
        };
        let name = pod_name(&entry);
        assert!(name.starts_with("prepull-node-1-cluster-local-"));
    }
}
