// src/core/images/mod.rs

//! Image Source, Node Cache View, and Image Service: the three components
//! that together produce the typed image catalog the lab manager and
//! prepuller consume.

pub mod catalog;
pub mod service;
pub mod source;
pub mod tag;

pub use catalog::{ImageCatalog, NodeView, RSPImage};
pub use service::ImageService;
pub use source::{GoogleArtifactRegistrySource, ImageSource, RegistrySource, StaticSource};
pub use tag::{RSPTag, TagClass};

use crate::config::ImageSourceConfig;
use std::sync::Arc;

/// Builds the configured `ImageSource` backend.
pub fn build_source(config: &ImageSourceConfig) -> Arc<dyn ImageSource> {
    match config {
        ImageSourceConfig::DockerRegistry {
            registry_url,
            repository,
            auth_token_endpoint,
        } => Arc::new(RegistrySource::new(
            registry_url.clone(),
            repository.clone(),
            auth_token_endpoint.clone(),
        )),
        ImageSourceConfig::GoogleArtifactRegistry {
            project,
            location,
            repository,
            image,
        } => Arc::new(GoogleArtifactRegistrySource::new(
            project.clone(),
            location.clone(),
            repository.clone(),
            image.clone(),
        )),
        ImageSourceConfig::Static { tags } => Arc::new(StaticSource::new(tags.clone())),
    }
}
