// src/core/images/service.rs

//! The Image Service: owns the catalog snapshot and drives the periodic
//! refresh protocol against an `ImageSource` and the Kubernetes
//! Adapter's node list.

use super::catalog::{ImageCatalog, NodeView, build_catalog};
use super::source::ImageSource;
use crate::config::{ImagesConfig, LabConfig};
use crate::core::k8s::KubernetesAdapter;
use crate::core::metrics::{CATALOG_IMAGES_BY_CLASS, CATALOG_REFRESH_FAILURES_TOTAL, PREPULL_GAP_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The Image Service. Holds the current catalog behind a `parking_lot`
/// `RwLock` so that publishing a new snapshot is a plain pointer swap: no
/// reader ever observes a torn/partial catalog, and readers never block a
/// writer beyond the time it takes to clone an `Arc`.
pub struct ImageService {
    snapshot: RwLock<Arc<ImageCatalog>>,
    source: Arc<dyn ImageSource>,
    k8s: KubernetesAdapter,
    images_config: ImagesConfig,
    lab_config: LabConfig,
}

impl ImageService {
    pub fn new(
        source: Arc<dyn ImageSource>,
        k8s: KubernetesAdapter,
        images_config: ImagesConfig,
        lab_config: LabConfig,
    ) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ImageCatalog::default())),
            source,
            k8s,
            images_config,
            lab_config,
        }
    }

    /// Returns a cheap clone of the current snapshot. Holding this value
    /// across an `await` is always safe: it is never mutated after
    /// publish, only replaced wholesale.
    pub fn snapshot(&self) -> Arc<ImageCatalog> {
        self.snapshot.read().clone()
    }

    /// Runs one refresh cycle: list images, recompute the node view, build
    /// the next catalog, and publish it by atomic swap. Errors from the
    /// source or the node list are logged and leave the prior snapshot
    /// live; no partial update is ever visible to readers.
    pub async fn refresh(&self) {
        let raw = match self.source.list_images().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("image source refresh failed, keeping prior catalog: {}", e);
                CATALOG_REFRESH_FAILURES_TOTAL.inc();
                return;
            }
        };

        let nodes = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("listing nodes failed, keeping prior catalog: {}", e);
                CATALOG_REFRESH_FAILURES_TOTAL.inc();
                return;
            }
        };

        let node_view = NodeView::build(&nodes, &self.lab_config.node_selector, &self.lab_config.tolerations);
        let previous_generation = self.snapshot().generation;
        let next = build_catalog(previous_generation, &raw, &node_view, &self.images_config);

        self.publish_metrics(&next);
        info!(
            "Published image catalog generation {} ({} images, {} to prepull).",
            next.generation,
            next.by_digest.len(),
            next.to_prepull.len()
        );
        *self.snapshot.write() = Arc::new(next);
    }

    fn publish_metrics(&self, catalog: &ImageCatalog) {
        for (class, images) in &catalog.by_class {
            CATALOG_IMAGES_BY_CLASS
                .with_label_values(&[class.as_str()])
                .set(images.len() as f64);
        }

        // Gap size here is an upper bound on what the prepuller will need
        // to do; the prepuller computes the precise per-node gap itself.
        PREPULL_GAP_SIZE.set(catalog.to_prepull.len() as f64);
    }

    /// The background refresh loop, started by the scheduler.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Image catalog refresh task started.");
        let mut interval = tokio::time::interval(self.images_config.refresh_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Image catalog refresh task shutting down.");
                    return;
                }
            }
        }
    }
}
