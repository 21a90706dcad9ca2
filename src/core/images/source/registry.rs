// src/core/images/source/registry.rs

//! A Docker Registry v2 API `ImageSource`: paginated tag listing, with
//! per-tag manifest `HEAD` requests to resolve digests, and a whitelisted
//! `WWW-Authenticate` bearer-token exchange.

use super::{ImageSource, RawImageList};
use crate::core::errors::ControllerError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The manifest media types that must be accepted so that a multi-arch
/// image index resolves to the index digest rather than a single-platform
/// manifest's digest.
const MANIFEST_ACCEPT_HEADERS: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

const TAG_PAGE_SIZE: u32 = 100;

pub struct RegistrySource {
    client: Client,
    registry_url: String,
    repository: String,
    /// The only token endpoint this source will follow a `WWW-Authenticate`
    /// challenge to. Any other realm in the challenge is refused.
    auth_token_endpoint: Option<String>,
    cached_token: RwLock<Option<String>>,
}

impl RegistrySource {
    pub fn new(registry_url: String, repository: String, auth_token_endpoint: Option<String>) -> Self {
        Self {
            client: Client::new(),
            registry_url,
            repository,
            auth_token_endpoint,
            cached_token: RwLock::new(None),
        }
    }

    fn tags_url(&self, last: Option<&str>) -> String {
        let mut url = format!(
            "{}/v2/{}/tags/list?n={}",
            self.registry_url.trim_end_matches('/'),
            self.repository,
            TAG_PAGE_SIZE
        );
        if let Some(last) = last {
            url.push_str(&format!("&last={last}"));
        }
        url
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url.trim_end_matches('/'),
            self.repository,
            reference
        )
    }

    /// Exchanges the configured endpoint for a bearer token, used only
    /// after a `401` carrying a `WWW-Authenticate: Bearer realm=...`
    /// challenge whose realm matches `auth_token_endpoint`.
    async fn refresh_token(&self) -> Result<String, ControllerError> {
        let endpoint = self
            .auth_token_endpoint
            .as_ref()
            .ok_or_else(|| ControllerError::AuthRequired(
                "registry requires auth but no auth_token_endpoint is configured".into(),
            ))?;

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let resp: TokenResponse = self.client.get(endpoint).send().await?.json().await?;
        let token = resp
            .token
            .or(resp.access_token)
            .ok_or_else(|| ControllerError::AuthRequired("token endpoint returned no token".into()))?;
        *self.cached_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn authed_request(&self, url: &str) -> Result<reqwest::Response, ControllerError> {
        let token = self.cached_token.read().await.clone();
        let mut builder = self
            .client
            .get(url)
            .header("Accept", MANIFEST_ACCEPT_HEADERS);
        if let Some(token) = &token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("registry returned 401, attempting token refresh for {}", url);
            let token = self.refresh_token().await?;
            return Ok(self
                .client
                .get(url)
                .header("Accept", MANIFEST_ACCEPT_HEADERS)
                .bearer_auth(token)
                .send()
                .await?);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    async fn list_images(&self) -> Result<RawImageList, ControllerError> {
        #[derive(serde::Deserialize)]
        struct TagsResponse {
            tags: Vec<String>,
        }

        let mut all_tags = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let url = self.tags_url(last.as_deref());
            let resp = self.authed_request(&url).await?;
            if !resp.status().is_success() {
                return Err(ControllerError::from_status(resp.status(), "tag listing failed"));
            }
            let page: TagsResponse = resp.json().await?;
            if page.tags.is_empty() {
                break;
            }
            let done = page.tags.len() < TAG_PAGE_SIZE as usize;
            last = page.tags.last().cloned();
            all_tags.extend(page.tags);
            if done {
                break;
            }
        }

        let mut tag_digests = BTreeMap::new();
        for tag in &all_tags {
            match self.resolve_tag(tag).await {
                Ok(digest) => {
                    tag_digests.insert(tag.clone(), digest);
                }
                Err(e) => {
                    warn!("failed to resolve digest for tag '{}', skipping: {}", tag, e);
                }
            }
        }

        Ok(RawImageList {
            tag_digests,
            aliases: BTreeMap::new(),
        })
    }

    async fn resolve_tag(&self, tag: &str) -> Result<String, ControllerError> {
        let url = self.manifest_url(tag);
        let resp = self
            .client
            .head(&url)
            .header("Accept", MANIFEST_ACCEPT_HEADERS)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ControllerError::NotFound(format!("tag '{tag}' not found")));
        }
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ControllerError::AuthRequired(format!(
                "unauthorized resolving tag '{tag}'"
            )));
        }
        if !resp.status().is_success() {
            return Err(ControllerError::from_status(resp.status(), "manifest HEAD failed"));
        }

        resp.headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ControllerError::SourceUnavailable(format!(
                    "registry did not return Docker-Content-Digest for tag '{tag}'"
                ))
            })
    }
}
