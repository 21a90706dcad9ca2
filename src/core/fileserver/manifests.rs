// src/core/fileserver/manifests.rs

//! Builds the Kubernetes manifests for a single user's WebDAV file server:
//! namespace, PVC(s), a `Job` running a single `Pod`, a `Service`, and a
//! gafaelfawr-annotated `Ingress`.

use crate::config::{FileServerConfig, LabVolume};
use crate::core::k8s::{GafaelfawrIngress, GafaelfawrIngressSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec, ServiceBackendPort};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

const CATEGORY_LABEL: &str = "nublado.lsst.io/category";
const USER_LABEL: &str = "nublado.lsst.io/user";
const FILESERVER_PORT: i32 = 8000;

fn labels(username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CATEGORY_LABEL.to_string(), "fileserver".to_string()),
        (USER_LABEL.to_string(), username.to_string()),
    ])
}

pub fn build_namespace(namespace: &str, username: &str) -> k8s_openapi::api::core::v1::Namespace {
    k8s_openapi::api::core::v1::Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(labels(username)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn build_pvc(volume: &LabVolume, namespace: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("{}-pvc", volume.name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(volume.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(volume.size.clone()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A `Job` with a single `Pod` (`restartPolicy: Never`) running the
/// configured WebDAV server image, told its idle timeout via environment
/// variable; the server is responsible for exiting once idle, which is what
/// lets the `Job` reach `Succeeded` and trigger cleanup.
pub fn build_job(fileserver: &FileServerConfig, namespace: &str, username: &str) -> Job {
    let mut mounts = Vec::new();
    let mut volumes = Vec::new();
    for volume in &fileserver.volumes {
        volumes.push(Volume {
            name: volume.name.clone(),
            persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: format!("{}-pvc", volume.name),
                read_only: Some(volume.read_only),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            read_only: Some(volume.read_only),
            ..Default::default()
        });
    }

    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        containers: vec![Container {
            name: "fileserver".to_string(),
            image: Some(fileserver.image.clone()),
            env: Some(vec![
                k8s_openapi::api::core::v1::EnvVar {
                    name: "WEBDAV_USER".to_string(),
                    value: Some(username.to_string()),
                    ..Default::default()
                },
                k8s_openapi::api::core::v1::EnvVar {
                    name: "IDLE_TIMEOUT_SECONDS".to_string(),
                    value: Some(fileserver.idle_timeout.as_secs().to_string()),
                    ..Default::default()
                },
            ]),
            ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                container_port: FILESERVER_PORT,
                ..Default::default()
            }]),
            volume_mounts: Some(mounts),
            ..Default::default()
        }],
        volumes: Some(volumes),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some("fileserver".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(username)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(username)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("fileserver".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(CATEGORY_LABEL.to_string(), "fileserver".to_string())])),
            ports: Some(vec![ServicePort {
                name: Some("webdav".to_string()),
                port: FILESERVER_PORT,
                target_port: Some(IntOrString::Int(FILESERVER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A gafaelfawr-annotated ingress exposing the per-user file server at a
/// fixed, user-scoped path; the exact public hostname is templated in by
/// configuration outside this controller's scope, so the
/// path-only rule here is deliberately host-agnostic.
pub fn build_ingress(fileserver: &FileServerConfig, namespace: &str, username: &str) -> GafaelfawrIngress {
    let ingress_spec = IngressSpec {
        ingress_class_name: fileserver.ingress_class.clone(),
        rules: Some(vec![IngressRule {
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(format!("/files/{username}")),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: "fileserver".to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(FILESERVER_PORT),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    GafaelfawrIngress::new(
        "fileserver",
        GafaelfawrIngressSpec {
            template: crate::core::k8s::ingress::IngressTemplate {
                metadata: crate::core::k8s::ingress::IngressTemplateMetadata::default(),
                spec: ingress_spec,
            },
            config: crate::core::k8s::ingress::GafaelfawrIngressConfig {
                base_url: format!("/files/{username}"),
                scopes: crate::core::k8s::ingress::GafaelfawrScopes {
                    all: vec!["exec:notebook".to_string()],
                },
                login_redirect: false,
            },
        },
    )
    .in_namespace(namespace)
}

trait InNamespace {
    fn in_namespace(self, namespace: &str) -> Self;
}

impl InNamespace for GafaelfawrIngress {
    fn in_namespace(mut self, namespace: &str) -> Self {
        self.metadata.namespace = Some(namespace.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fileserver_config() -> FileServerConfig {
        FileServerConfig {
            enabled: true,
            namespace_prefix: "fileservers".into(),
            image: "webdav:latest".into(),
            idle_timeout: Duration::from_secs(3600),
            creation_timeout: Duration::from_secs(120),
            reconcile_interval: Duration::from_secs(60),
            volumes: vec![],
            ingress_class: None,
        }
    }

    #[test]
    fn job_pod_never_restarts() {
        let job = build_job(&fileserver_config(), "fileservers-rachel", "rachel");
        let spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn ingress_path_is_scoped_to_user() {
        let ingress = build_ingress(&fileserver_config(), "fileservers-rachel", "rachel");
        assert_eq!(ingress.spec.config.base_url, "/files/rachel");
    }
}
