// src/server/dto.rs

//! JSON request/response shapes for the HTTP surface. Kept separate
//! from the core domain types so the wire format can evolve (field renames,
//! additive fields) without touching `core::lab`/`core::fileserver`.

use crate::config::PrepullerConfig;
use crate::core::events::ProgressEvent;
use crate::core::fileserver::FileServerState;
use crate::core::images::{ImageCatalog, RSPImage, TagClass};
use crate::core::lab::{ImageChoice, LabOptions, LabSpecRequest, ResolvedImage, ResolvedSize, UserLabState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Wire shape for `{image: {class|tag|digest, index?}}`: exactly one of
/// `class`, `tag`, or `digest` is expected to be set; `index` only applies
/// alongside `class`, selecting which image within that class (0 = newest).
#[derive(Debug, Deserialize)]
pub struct ImageChoiceDto {
    #[serde(default)]
    pub class: Option<TagClass>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub index: usize,
}

impl TryFrom<ImageChoiceDto> for ImageChoice {
    type Error = crate::core::errors::ControllerError;

    fn try_from(dto: ImageChoiceDto) -> Result<Self, Self::Error> {
        match (dto.class, dto.tag, dto.digest) {
            (Some(class), None, None) => Ok(ImageChoice::Class { class, index: dto.index }),
            (None, Some(tag), None) => Ok(ImageChoice::Tag(tag)),
            (None, None, Some(digest)) => Ok(ImageChoice::Digest(digest)),
            _ => Err(crate::core::errors::ControllerError::Validation(
                "image selector must set exactly one of class, tag, or digest".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateLabRequest {
    pub image: ImageChoiceDto,
    pub size: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub reset_user_env: bool,
    #[serde(default)]
    pub privileged: bool,
}

impl TryFrom<CreateLabRequest> for LabSpecRequest {
    type Error = crate::core::errors::ControllerError;

    fn try_from(req: CreateLabRequest) -> Result<Self, Self::Error> {
        Ok(LabSpecRequest {
            image: req.image.try_into()?,
            size: req.size,
            options: LabOptions {
                env: req.env,
                debug: req.debug,
                reset_user_env: req.reset_user_env,
                privileged: req.privileged,
            },
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ImageSummary {
    pub reference: String,
    pub digest: String,
    pub description: String,
    pub tag_class: TagClass,
    pub aliases: Vec<String>,
}

impl ImageSummary {
    fn from_rsp(image: &Arc<RSPImage>, repository: &str) -> Self {
        Self {
            reference: image.reference(repository),
            digest: image.digest.clone(),
            description: image.description.clone(),
            tag_class: image.class,
            aliases: image.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageMenuResponse {
    pub recommended: Option<ImageSummary>,
    pub options: Vec<ImageSummary>,
    pub dropdown: Vec<ImageSummary>,
}

impl ImageMenuResponse {
    pub fn from_catalog(catalog: &ImageCatalog, repository: &str) -> Self {
        Self {
            recommended: catalog.recommended.as_ref().map(|i| ImageSummary::from_rsp(i, repository)),
            options: catalog.prepulled_menu.iter().map(|i| ImageSummary::from_rsp(i, repository)).collect(),
            dropdown: catalog.dropdown_menu.iter().map(|i| ImageSummary::from_rsp(i, repository)).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PrepullImageStatus {
    pub digest: String,
    pub missing_on_nodes: Vec<String>,
    pub present_on_nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PrepullsResponse {
    pub config: PrepullerConfig,
    pub images: Vec<PrepullImageStatus>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedImageDto {
    pub reference: String,
    pub digest: String,
    pub description: String,
}

impl From<&ResolvedImage> for ResolvedImageDto {
    fn from(image: &ResolvedImage) -> Self {
        Self {
            reference: image.reference.clone(),
            digest: image.digest.clone(),
            description: image.description.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolvedSizeDto {
    pub name: String,
    pub cpu_limit: f64,
    pub memory_limit_bytes: u64,
    pub cpu_request: f64,
    pub memory_request_bytes: u64,
}

impl From<&ResolvedSize> for ResolvedSizeDto {
    fn from(size: &ResolvedSize) -> Self {
        Self {
            name: size.name.clone(),
            cpu_limit: size.cpu_limit,
            memory_limit_bytes: size.memory_limit_bytes,
            cpu_request: size.cpu_request,
            memory_request_bytes: size.memory_request_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LabStatusResponse {
    pub user: String,
    pub status: String,
    pub namespace: Option<String>,
    pub pod_uid: Option<String>,
    pub image: Option<ResolvedImageDto>,
    pub size: Option<ResolvedSizeDto>,
    pub env: BTreeMap<String, String>,
    pub debug: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

impl From<UserLabState> for LabStatusResponse {
    fn from(state: UserLabState) -> Self {
        Self {
            user: state.username,
            status: state.status.as_str().to_string(),
            namespace: state.namespace,
            pod_uid: state.pod_uid,
            image: state.image.as_ref().map(ResolvedImageDto::from),
            size: state.size.as_ref().map(ResolvedSizeDto::from),
            env: state.options.as_ref().map(|o| o.env.clone()).unwrap_or_default(),
            debug: state.options.as_ref().map(|o| o.debug).unwrap_or(false),
            started_at: state.started_at,
            last_error: state.last_error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LabListEntry {
    pub user: String,
    pub status: String,
}

impl From<&UserLabState> for LabListEntry {
    fn from(state: &UserLabState) -> Self {
        Self {
            user: state.username.clone(),
            status: state.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileServerStatusResponse {
    pub user: String,
    pub status: String,
    pub namespace: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

impl From<FileServerState> for FileServerStatusResponse {
    fn from(state: FileServerState) -> Self {
        Self {
            user: state.username,
            status: state.status.as_str().to_string(),
            namespace: state.namespace,
            created_at: state.created_at,
            last_error: state.last_error,
        }
    }
}

/// The wire shape of one SSE `data:` payload; mirrors [`ProgressEvent`]
/// field-for-field but is kept as its own type so the bus's internal shape
/// can evolve independently of the wire contract.
#[derive(Debug, Serialize)]
pub struct ProgressEventDto {
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub severity: String,
    pub message: String,
    pub percent: Option<u8>,
    pub ready: bool,
}

impl From<&ProgressEvent> for ProgressEventDto {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            seq: event.seq,
            timestamp: event.timestamp,
            severity: match event.severity {
                crate::core::events::Severity::Info => "info",
                crate::core::events::Severity::Warning => "warning",
                crate::core::events::Severity::Error => "error",
            }
            .to_string(),
            message: event.message.clone(),
            percent: event.percent,
            ready: event.ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_choice_accepts_exactly_one_selector() {
        let dto = ImageChoiceDto { class: Some(TagClass::Recommended), tag: None, digest: None, index: 2 };
        let choice: ImageChoice = dto.try_into().unwrap();
        assert_eq!(choice, ImageChoice::Class { class: TagClass::Recommended, index: 2 });
    }

    #[test]
    fn image_choice_rejects_no_selector() {
        let dto = ImageChoiceDto { class: None, tag: None, digest: None, index: 0 };
        assert!(ImageChoice::try_from(dto).is_err());
    }

    #[test]
    fn image_choice_rejects_two_selectors() {
        let dto = ImageChoiceDto { class: None, tag: Some("w_2024_15".to_string()), digest: Some("sha256:abc".to_string()), index: 0 };
        assert!(ImageChoice::try_from(dto).is_err());
    }
}
