// src/core/images/source/mod.rs

//! The pluggable `ImageSource` capability: list tags/digests from a
//! registry, and resolve a single tag to a digest when it was not returned
//! by the bulk listing.

use crate::core::errors::ControllerError;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub mod gar;
pub mod registry;
pub mod static_source;

pub use gar::GoogleArtifactRegistrySource;
pub use registry::RegistrySource;
pub use static_source::StaticSource;

/// The raw result of a listing call: every tag this source currently knows
/// about, mapped to its digest, plus edges recording which tags are aliases
/// of which other tag (e.g. `recommended -> w_2024_15`).
#[derive(Debug, Clone, Default)]
pub struct RawImageList {
    pub tag_digests: BTreeMap<String, String>,
    /// alias tag -> target tag, when the source itself knows the mapping
    /// (Artifact Registry bulk listing reports this; a plain registry does
    /// not, and alias resolution falls back to matching digests).
    pub aliases: BTreeMap<String, String>,
}

/// A source of image tag/digest information. Implementations must be safe
/// to call concurrently and must not mutate any shared state; `list_images`
/// is a pure, idempotent snapshot read.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Lists every known tag for the configured repository/image.
    async fn list_images(&self) -> Result<RawImageList, ControllerError>;

    /// Resolves a single tag to its digest, for tags the catalog is told to
    /// pin but that a prior `list_images` call did not return (e.g. a
    /// registry that paginates tags and truncated the list).
    async fn resolve_tag(&self, tag: &str) -> Result<String, ControllerError>;
}
