// src/config.rs

//! Manages controller configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    8878
}

/// Configuration for the controller's own HTTP/JSON + SSE API surface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

/// A single named image source backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImageSourceConfig {
    /// A Docker Registry v2-compatible API.
    DockerRegistry {
        registry_url: String,
        repository: String,
        #[serde(default)]
        auth_token_endpoint: Option<String>,
    },
    /// The Google Artifact Registry bulk-listing API.
    GoogleArtifactRegistry {
        project: String,
        location: String,
        repository: String,
        image: String,
    },
    /// A fixed, configuration-supplied tag -> digest map. Used for tests and
    /// air-gapped deployments with no reachable registry.
    Static { tags: BTreeMap<String, String> },
}

impl ImageSourceConfig {
    /// The pull repository (e.g. `registry.example.com/rsp/lab`) images from
    /// this source share, with no tag or digest suffix. `Static` sources
    /// carry no repository of their own: their configured values are taken
    /// to already be complete, pullable references.
    pub fn repository(&self) -> Option<&str> {
        match self {
            ImageSourceConfig::DockerRegistry { repository, .. } => Some(repository.as_str()),
            ImageSourceConfig::GoogleArtifactRegistry { repository, .. } => Some(repository.as_str()),
            ImageSourceConfig::Static { .. } => None,
        }
    }
}

/// Configuration governing how the image catalog is built from the raw tag list.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImagesConfig {
    pub source: ImageSourceConfig,
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
    /// Tag that should be resolved as the `recommended` alias, if any.
    #[serde(default)]
    pub recommended_tag: Option<String>,
    #[serde(default = "default_num_releases")]
    pub num_releases: usize,
    #[serde(default = "default_num_weeklies")]
    pub num_weeklies: usize,
    #[serde(default = "default_num_dailies")]
    pub num_dailies: usize,
    /// If set, only tags whose parsed cycle matches are considered.
    #[serde(default)]
    pub cycle: Option<u16>,
    /// Tags that must always remain in the catalog and be prepulled,
    /// regardless of the per-class counts above.
    #[serde(default)]
    pub pins: Vec<String>,
    #[serde(default = "default_num_to_prepull_per_class")]
    pub num_to_prepull_per_class: usize,
}

impl ImagesConfig {
    /// The pullable reference for a given digest: `repository@digest` when
    /// the source has a repository, or the digest string verbatim for
    /// sources (like `Static`) whose configured values are already complete
    /// references.
    pub fn image_reference(&self, digest: &str) -> String {
        match self.source.repository() {
            Some(repository) => format!("{repository}@{digest}"),
            None => digest.to_string(),
        }
    }
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_num_releases() -> usize {
    1
}
fn default_num_weeklies() -> usize {
    3
}
fn default_num_dailies() -> usize {
    3
}
fn default_num_to_prepull_per_class() -> usize {
    3
}

/// A named CPU/memory size option selectable by users, filtered by quota.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabSize {
    pub cpu_limit: f64,
    pub memory_limit_bytes: u64,
    /// Fraction of the limit used as the request; `None` means request == limit.
    #[serde(default)]
    pub request_fraction: Option<f64>,
}

/// A secret key projected into the lab, either as an environment variable or
/// as a file under the fixed `secrets/` mount directory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecretProjection {
    pub source_secret: String,
    pub source_key: String,
    #[serde(flatten)]
    pub target: SecretTarget,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum SecretTarget {
    EnvVar { env_var: String },
    File { mount_path: String },
}

/// A PVC that should be created and mounted into every lab pod.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabVolume {
    pub name: String,
    pub mount_path: String,
    pub storage_class: String,
    pub size: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Configuration for the lab lifecycle manager.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabConfig {
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
    pub hub_namespace: String,
    #[serde(default = "default_lab_port")]
    pub lab_port: u16,
    pub pull_secret_name: Option<String>,
    #[serde(default)]
    pub secret_projections: Vec<SecretProjection>,
    #[serde(default)]
    pub volumes: Vec<LabVolume>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    pub sizes: BTreeMap<String, LabSize>,
    #[serde(default)]
    pub argocd_instance: Option<String>,
    #[serde(with = "humantime_serde", default = "default_spawn_timeout")]
    pub spawn_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_delete_timeout")]
    pub delete_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    /// Base `/etc/passwd` and `/etc/group` content the per-user entries are
    /// appended to.
    #[serde(default)]
    pub base_passwd: String,
    #[serde(default)]
    pub base_group: String,
    /// Static file contents mounted verbatim into every lab pod, keyed by
    /// file name, independent of the per-user nss/env ConfigMaps.
    #[serde(default)]
    pub static_files: BTreeMap<String, String>,
}

fn default_namespace_prefix() -> String {
    "userlabs".to_string()
}
fn default_lab_port() -> u16 {
    8888
}
fn default_spawn_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_delete_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

/// A Kubernetes `Toleration` fragment, mirrored from `k8s_openapi` so the
/// configuration file can specify it without pulling in the full type's
/// `serde` surface (which does not impl `Default`/round-trip cleanly for
/// TOML).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Toleration {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: String,
}

/// Configuration for the prepuller.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrepullerConfig {
    #[serde(default = "default_prepuller_namespace")]
    pub namespace: String,
    #[serde(default = "default_prepull_concurrency")]
    pub max_concurrent_pods: usize,
    #[serde(with = "humantime_serde", default = "default_prepull_pod_timeout")]
    pub pod_timeout: Duration,
    #[serde(default = "default_prepull_max_backoff")]
    pub max_backoff_seconds: u64,
    #[serde(with = "humantime_serde", default = "default_prepull_tick_interval")]
    pub tick_interval: Duration,
}

fn default_prepuller_namespace() -> String {
    "prepull".to_string()
}
fn default_prepull_concurrency() -> usize {
    10
}
fn default_prepull_pod_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_prepull_max_backoff() -> u64 {
    120
}
fn default_prepull_tick_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for PrepullerConfig {
    fn default() -> Self {
        Self {
            namespace: default_prepuller_namespace(),
            max_concurrent_pods: default_prepull_concurrency(),
            pod_timeout: default_prepull_pod_timeout(),
            max_backoff_seconds: default_prepull_max_backoff(),
            tick_interval: default_prepull_tick_interval(),
        }
    }
}

/// Configuration for the on-demand WebDAV file-server manager.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fileserver_namespace_prefix")]
    pub namespace_prefix: String,
    pub image: String,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_creation_timeout")]
    pub creation_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    #[serde(default)]
    pub volumes: Vec<LabVolume>,
    #[serde(default)]
    pub ingress_class: Option<String>,
}

fn default_fileserver_namespace_prefix() -> String {
    "fileservers".to_string()
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(3600)
}
fn default_creation_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace_prefix: default_fileserver_namespace_prefix(),
            image: String::new(),
            idle_timeout: default_idle_timeout(),
            creation_timeout: default_creation_timeout(),
            reconcile_interval: default_reconcile_interval(),
            volumes: vec![],
            ingress_class: None,
        }
    }
}

/// The CPU/memory ceiling applied to a user with no more specific quota.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub cpu: f64,
    pub memory_bytes: u64,
}

/// Configuration for identity/authorization as seen by the controller's own
/// HTTP surface. The identity service itself (name, uid, groups, token) is
/// out of scope; this section only covers what the controller needs to
/// trust the auth-proxy headers in front of it and assign a quota.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdentityConfig {
    /// Groups whose members may operate on any user's file server or lab,
    /// not only their own.
    #[serde(default)]
    pub admin_groups: Vec<String>,
    #[serde(default = "default_quota")]
    pub default_quota: QuotaConfig,
    /// Per-group quota overrides, applied in `admin_groups`-like fashion:
    /// the most generous matching override wins.
    #[serde(default)]
    pub group_quotas: BTreeMap<String, QuotaConfig>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            admin_groups: Vec::new(),
            default_quota: default_quota(),
            group_quotas: BTreeMap::new(),
        }
    }
}

fn default_quota() -> QuotaConfig {
    QuotaConfig {
        cpu: 1.0,
        memory_bytes: 1 << 30,
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    images: ImagesConfig,
    lab: LabConfig,
    #[serde(default)]
    prepuller: PrepullerConfig,
    #[serde(default)]
    fileserver: FileServerConfig,
    #[serde(default)]
    identity: IdentityConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The final, validated controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub http: HttpConfig,
    pub metrics: MetricsConfig,
    pub images: ImagesConfig,
    pub lab: LabConfig,
    pub prepuller: PrepullerConfig,
    pub fileserver: FileServerConfig,
    pub identity: IdentityConfig,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            log_level: raw.log_level,
            http: raw.http,
            metrics: raw.metrics,
            images: raw.images,
            lab: raw.lab,
            prepuller: raw.prepuller,
            fileserver: raw.fileserver,
            identity: raw.identity,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            return Err(anyhow!("http.port cannot be 0"));
        }
        if self.lab.hub_namespace.trim().is_empty() {
            return Err(anyhow!("lab.hub_namespace cannot be empty"));
        }
        if self.lab.sizes.is_empty() {
            return Err(anyhow!("lab.sizes must define at least one size"));
        }
        for (name, size) in &self.lab.sizes {
            if size.cpu_limit <= 0.0 {
                return Err(anyhow!("lab size '{name}' has a non-positive cpu_limit"));
            }
            if size.memory_limit_bytes == 0 {
                return Err(anyhow!("lab size '{name}' has a zero memory_limit_bytes"));
            }
        }
        if self.lab.spawn_timeout.is_zero() {
            return Err(anyhow!("lab.spawn_timeout cannot be 0"));
        }
        if self.lab.delete_timeout.is_zero() {
            return Err(anyhow!("lab.delete_timeout cannot be 0"));
        }

        if self.images.num_to_prepull_per_class == 0 {
            warn!("images.num_to_prepull_per_class is 0; the prepuller will only cache pins and recommended.");
        }

        if self.metrics.enabled && self.metrics.port == self.http.port {
            return Err(anyhow!(
                "metrics.port cannot be the same as the controller's own http.port"
            ));
        }

        if self.fileserver.enabled && self.fileserver.image.trim().is_empty() {
            return Err(anyhow!(
                "fileserver.image must be set when fileserver.enabled is true"
            ));
        }

        if self.prepuller.max_concurrent_pods == 0 {
            return Err(anyhow!("prepuller.max_concurrent_pods cannot be 0"));
        }

        if self.identity.default_quota.cpu <= 0.0 || self.identity.default_quota.memory_bytes == 0 {
            return Err(anyhow!("identity.default_quota must have a positive cpu and memory_bytes"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [images]
        refresh_interval = "5m"
        recommended_tag = "recommended"

        [images.source]
        kind = "static"
        tags = { recommended = "sha256:abc" }

        [lab]
        hub_namespace = "hub"

        [lab.sizes.small]
        cpu_limit = 1.0
        memory_limit_bytes = 1073741824
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let raw: RawConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(raw.lab.hub_namespace, "hub");
        assert_eq!(raw.images.num_weeklies, 3);
    }

    #[test]
    fn rejects_empty_sizes() {
        let config = Config {
            log_level: "info".into(),
            http: HttpConfig::default(),
            metrics: MetricsConfig::default(),
            images: ImagesConfig {
                source: ImageSourceConfig::Static {
                    tags: BTreeMap::new(),
                },
                refresh_interval: default_refresh_interval(),
                recommended_tag: None,
                num_releases: 1,
                num_weeklies: 1,
                num_dailies: 1,
                cycle: None,
                pins: vec![],
                num_to_prepull_per_class: 1,
            },
            lab: LabConfig {
                namespace_prefix: default_namespace_prefix(),
                hub_namespace: "hub".into(),
                lab_port: default_lab_port(),
                pull_secret_name: None,
                secret_projections: vec![],
                volumes: vec![],
                env: BTreeMap::new(),
                node_selector: BTreeMap::new(),
                tolerations: vec![],
                sizes: BTreeMap::new(),
                argocd_instance: None,
                spawn_timeout: default_spawn_timeout(),
                delete_timeout: default_delete_timeout(),
                reconcile_interval: default_reconcile_interval(),
                base_passwd: String::new(),
                base_group: String::new(),
                static_files: BTreeMap::new(),
            },
            prepuller: PrepullerConfig::default(),
            fileserver: FileServerConfig::default(),
            identity: IdentityConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
