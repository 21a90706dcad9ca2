// src/core/k8s/ingress.rs

//! The gafaelfawr-annotated ingress custom resource used to expose
//! file-server pods through the cluster's authenticating proxy.

use k8s_openapi::api::core::v1::LoadBalancerIngress;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `GafaelfawrIngress.gafaelfawr.lsst.io/v1alpha1`: a thin wrapper around a
/// standard `networking.k8s.io/v1` `Ingress` spec that additionally carries
/// the auth delegation config gafaelfawr's ingress controller reads to
/// inject authentication for the backing service.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gafaelfawr.lsst.io",
    version = "v1alpha1",
    kind = "GafaelfawrIngress",
    namespaced,
    status = "GafaelfawrIngressStatus",
    derive = "PartialEq"
)]
pub struct GafaelfawrIngressSpec {
    pub template: IngressTemplate,
    pub config: GafaelfawrIngressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct IngressTemplate {
    pub metadata: IngressTemplateMetadata,
    pub spec: k8s_openapi::api::networking::v1::IngressSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct IngressTemplateMetadata {
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GafaelfawrIngressConfig {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "scopes")]
    pub scopes: GafaelfawrScopes,
    #[serde(rename = "loginRedirect", default)]
    pub login_redirect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GafaelfawrScopes {
    pub all: Vec<String>,
}

/// Status mirrors the upstream `networking.k8s.io/v1` ingress status so
/// readiness can be checked the same way as a plain `Ingress`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct GafaelfawrIngressStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub load_balancer: Vec<LoadBalancerIngress>,
}

impl GafaelfawrIngress {
    /// Whether the ingress controller has assigned at least one address.
    pub fn has_address(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| !s.load_balancer.is_empty())
            .unwrap_or(false)
    }
}
