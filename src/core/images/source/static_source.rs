// src/core/images/source/static_source.rs

//! A fixed, configuration-supplied tag -> digest map. Used in tests and in
//! air-gapped deployments where no registry is reachable at refresh time.

use super::{ImageSource, RawImageList};
use crate::core::errors::ControllerError;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub struct StaticSource {
    tags: BTreeMap<String, String>,
}

impl StaticSource {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        Self { tags }
    }
}

#[async_trait]
impl ImageSource for StaticSource {
    async fn list_images(&self) -> Result<RawImageList, ControllerError> {
        Ok(RawImageList {
            tag_digests: self.tags.clone(),
            aliases: BTreeMap::new(),
        })
    }

    async fn resolve_tag(&self, tag: &str) -> Result<String, ControllerError> {
        self.tags
            .get(tag)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("tag '{tag}' not found in static source")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_configured_tags() {
        let mut tags = BTreeMap::new();
        tags.insert("recommended".to_string(), "sha256:abc".to_string());
        let source = StaticSource::new(tags);
        let list = source.list_images().await.unwrap();
        assert_eq!(list.tag_digests.get("recommended").unwrap(), "sha256:abc");
    }

    #[tokio::test]
    async fn resolve_unknown_tag_is_not_found() {
        let source = StaticSource::new(BTreeMap::new());
        let err = source.resolve_tag("missing").await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)));
    }
}
