// src/core/lab/manifests.rs

//! Builds every Kubernetes manifest the lab creation protocol applies, pure
//! functions from config + resolved state to an object ready to `create`.
//! None of these touch the API server directly except [`compose_secret`],
//! which has to read the source secrets it's composing from.

use super::{ResolvedImage, ResolvedSize, UserIdentity, UserQuota, LabOptions};
use crate::config::{LabConfig, LabVolume, SecretTarget};
use crate::core::errors::ControllerError;
use crate::core::k8s::KubernetesAdapter;
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, Container, EnvVar, EnvVarSource, LocalObjectReference, Namespace,
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSecurityContext, PodSpec,
    ResourceQuota, ResourceQuotaSpec, ResourceRequirements, Secret, SecretKeySelector,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Toleration as K8sToleration, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
    NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, BTreeSet};

/// The label every object the controller creates in a lab namespace carries,
/// so reconciliation's `list_pods`/namespace listing can select cleanly on
/// it without depending on naming conventions alone.
const MANAGED_BY_LABEL: &str = "nublado.lsst.io/category";

fn lab_labels(username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "lab".to_string()),
        ("nublado.lsst.io/user".to_string(), username.to_string()),
    ])
}

pub fn build_namespace(_lab: &LabConfig, namespace: &str, username: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(lab_labels(username)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Restricts egress/ingress to the namespace itself plus DNS and the hub,
/// per the "every lab is network-isolated from every other lab" invariant.
pub fn build_network_policy(lab: &LabConfig, namespace: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some("lab-network-policy".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![
                    NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "kubernetes.io/metadata.name".to_string(),
                                namespace.to_string(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "kubernetes.io/metadata.name".to_string(),
                                lab.hub_namespace.clone(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(lab.lab_port as i32)),
                    ..Default::default()
                }]),
            }]),
            egress: Some(vec![
                NetworkPolicyEgressRule {
                    to: None,
                    ports: None,
                },
                NetworkPolicyEgressRule {
                    to: Some(vec![NetworkPolicyPeer {
                        ip_block: Some(IPBlock {
                            cidr: "0.0.0.0/0".to_string(),
                            except: None,
                        }),
                        ..Default::default()
                    }]),
                    ports: None,
                },
            ]),
        }),
    }
}

/// Composes the per-user secret from configured `SecretProjection`s, reading
/// each referenced source key out of its source secret in the hub namespace.
/// Only `EnvVar`-target projections land here; `File`-target projections are
/// mounted by [`build_pod`] straight off the same composed secret, keyed by
/// `source_key` under the fixed `secrets/` directory.
pub async fn compose_secret(
    k8s: &KubernetesAdapter,
    lab: &LabConfig,
    secret_name: &str,
    namespace: &str,
) -> Result<Secret, ControllerError> {
    let mut data: BTreeMap<String, k8s_openapi::ByteString> = BTreeMap::new();
    let mut source_cache: BTreeMap<String, Secret> = BTreeMap::new();

    for projection in &lab.secret_projections {
        if !source_cache.contains_key(&projection.source_secret) {
            let source = k8s
                .get_secret(&lab.hub_namespace, &projection.source_secret)
                .await?
                .ok_or_else(|| {
                    ControllerError::NotFound(format!(
                        "source secret '{}' not found in namespace '{}'",
                        projection.source_secret, lab.hub_namespace
                    ))
                })?;
            source_cache.insert(projection.source_secret.clone(), source);
        }
        let source = source_cache.get(&projection.source_secret).unwrap();
        let value = source
            .data
            .as_ref()
            .and_then(|d| d.get(&projection.source_key))
            .ok_or_else(|| {
                ControllerError::NotFound(format!(
                    "key '{}' not found in source secret '{}'",
                    projection.source_key, projection.source_secret
                ))
            })?;

        let dest_key = match &projection.target {
            SecretTarget::EnvVar { env_var } => env_var.clone(),
            SecretTarget::File { .. } => projection.source_key.clone(),
        };
        data.insert(dest_key, value.clone());
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// One entry of the lab's environment, tracked through the "later category
/// wins on key collision" ordering described by the creation protocol: fixed
/// vars, then configured `lab.env`, then computed resource vars, then image
/// vars, then secret-projected vars, then per-request vars.
enum EnvValue {
    Literal(String),
    SecretRef { secret: String, key: String },
}

fn apply_env(target: &mut BTreeMap<String, EnvValue>, entries: impl IntoIterator<Item = (String, String)>) {
    for (k, v) in entries {
        target.insert(k, EnvValue::Literal(v));
    }
}

pub fn build_env_configmap(
    lab: &LabConfig,
    namespace: &str,
    identity: &UserIdentity,
    options: &LabOptions,
    image: &ResolvedImage,
    size: &ResolvedSize,
    secret_name: &str,
) -> ConfigMap {
    let mut env: BTreeMap<String, EnvValue> = BTreeMap::new();

    apply_env(
        &mut env,
        [
            ("JUPYTERHUB_USER".to_string(), identity.username.clone()),
            ("HOME".to_string(), format!("/home/{}", identity.username)),
            ("EXTERNAL_URL".to_string(), String::new()),
        ],
    );
    apply_env(&mut env, lab.env.clone());
    apply_env(
        &mut env,
        [
            ("CPU_LIMIT".to_string(), size.cpu_limit.to_string()),
            ("MEM_LIMIT".to_string(), size.memory_limit_bytes.to_string()),
            ("CPU_GUARANTEE".to_string(), size.cpu_request.to_string()),
            ("MEM_GUARANTEE".to_string(), size.memory_request_bytes.to_string()),
        ],
    );
    apply_env(
        &mut env,
        [
            ("JUPYTER_IMAGE_SPEC".to_string(), image.reference.clone()),
            ("IMAGE_DIGEST".to_string(), image.digest.clone()),
            ("IMAGE_DESCRIPTION".to_string(), image.description.clone()),
        ],
    );
    for projection in &lab.secret_projections {
        if let SecretTarget::EnvVar { env_var } = &projection.target {
            env.insert(
                env_var.clone(),
                EnvValue::SecretRef {
                    secret: secret_name.to_string(),
                    key: env_var.clone(),
                },
            );
        }
    }
    apply_env(&mut env, options.env.clone());
    if options.debug {
        env.insert("DEBUG".to_string(), EnvValue::Literal("true".to_string()));
    }

    // ConfigMaps can't carry secretKeyRef values; only the literal entries
    // go into `lab-env`, the secret-backed ones are wired directly onto the
    // pod's container `env` in `build_pod`.
    let mut data = BTreeMap::new();
    for (key, value) in &env {
        if let EnvValue::Literal(v) = value {
            data.insert(key.clone(), v.clone());
        }
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some("lab-env".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Synthesizes `/etc/passwd` and `/etc/group` fragments appending the user's
/// own entry (and every group they belong to) onto the configured base
/// content, mounted over the image's own files by `build_pod`.
pub fn build_nss_configmap(lab: &LabConfig, namespace: &str, identity: &UserIdentity) -> ConfigMap {
    let passwd_line = format!(
        "{user}:x:{uid}:{gid}:{user}:/home/{user}:/bin/bash\n",
        user = identity.username,
        uid = identity.uid,
        gid = identity.primary_gid,
    );
    let mut passwd = lab.base_passwd.clone();
    if !passwd.ends_with('\n') && !passwd.is_empty() {
        passwd.push('\n');
    }
    passwd.push_str(&passwd_line);

    let mut group = lab.base_group.clone();
    if !group.ends_with('\n') && !group.is_empty() {
        group.push('\n');
    }
    for g in &identity.groups {
        group.push_str(&format!("{name}:x:{gid}:{user}\n", name = g.name, gid = g.gid, user = identity.username));
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some("lab-nss".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("passwd".to_string(), passwd),
            ("group".to_string(), group),
        ])),
        ..Default::default()
    }
}

pub fn build_files_configmap(lab: &LabConfig, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("lab-files".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(lab.static_files.clone()),
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

pub fn build_resource_quota(namespace: &str, quota: &UserQuota) -> ResourceQuota {
    let mut hard = BTreeMap::new();
    hard.insert("limits.cpu".to_string(), Quantity(quota.cpu.to_string()));
    hard.insert(
        "limits.memory".to_string(),
        Quantity(quota.memory_bytes.to_string()),
    );

    ResourceQuota {
        metadata: ObjectMeta {
            name: Some("lab-quota".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(lab: &LabConfig, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("lab".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), "lab".to_string())])),
            ports: Some(vec![ServicePort {
                name: Some("lab".to_string()),
                port: lab.lab_port as i32,
                target_port: Some(IntOrString::Int(lab.lab_port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_pod(
    lab: &LabConfig,
    namespace: &str,
    identity: &UserIdentity,
    options: &LabOptions,
    image: &ResolvedImage,
    size: &ResolvedSize,
    secret_name: &str,
) -> Pod {
    let mut env = Vec::new();
    for projection in &lab.secret_projections {
        if let SecretTarget::EnvVar { env_var } = &projection.target {
            env.push(EnvVar {
                name: env_var.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name.to_string(),
                        key: env_var.clone(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    let mut volumes = vec![
        Volume {
            name: "lab-env".to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: "lab-env".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "lab-nss".to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: "lab-nss".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "lab-nss".to_string(),
            mount_path: "/etc/passwd".to_string(),
            sub_path: Some("passwd".to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: "lab-nss".to_string(),
            mount_path: "/etc/group".to_string(),
            sub_path: Some("group".to_string()),
            ..Default::default()
        },
    ];

    if !lab.static_files.is_empty() {
        volumes.push(Volume {
            name: "lab-files".to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: "lab-files".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "lab-files".to_string(),
            mount_path: "/etc/nublado/files".to_string(),
            ..Default::default()
        });
    }

    let has_file_projections = lab
        .secret_projections
        .iter()
        .any(|p| matches!(p.target, SecretTarget::File { .. }));
    if has_file_projections {
        volumes.push(Volume {
            name: "lab-secrets".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        // Each File-target projection gets its own mount path so two
        // projections cannot shadow each other even if they share a
        // directory prefix.
        let mut seen_dirs = BTreeSet::new();
        for projection in &lab.secret_projections {
            if let SecretTarget::File { mount_path } = &projection.target {
                if seen_dirs.insert(mount_path.clone()) {
                    mounts.push(VolumeMount {
                        name: "lab-secrets".to_string(),
                        mount_path: mount_path.clone(),
                        sub_path: Some(projection.source_key.clone()),
                        read_only: Some(true),
                        ..Default::default()
                    });
                }
            }
        }
    }

    for volume in &lab.volumes {
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

    let mut init_containers = Vec::new();
    if options.reset_user_env {
        init_containers.push(Container {
            name: "reset-user-env".to_string(),
            image: Some(image.reference.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("rm -rf /home/{}/.cache /home/{}/.local/share/jupyter", identity.username, identity.username),
            ]),
            volume_mounts: Some(
                lab.volumes
                    .iter()
                    .map(|v| VolumeMount {
                        name: v.name.clone(),
                        mount_path: v.mount_path.clone(),
                        read_only: Some(v.read_only),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
    }

    let mut labels = lab_labels(&identity.username);
    labels.insert("nublado.lsst.io/image-digest".to_string(), image.digest.clone());

    Pod {
        metadata: ObjectMeta {
            name: Some("lab".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            containers: vec![Container {
                name: "notebook".to_string(),
                image: Some(image.reference.clone()),
                env: Some(env),
                env_from: Some(vec![k8s_openapi::api::core::v1::EnvFromSource {
                    config_map_ref: Some(k8s_openapi::api::core::v1::ConfigMapEnvSource {
                        name: "lab-env".to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }]),
                ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                    container_port: lab.lab_port as i32,
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity(size.cpu_limit.to_string())),
                        ("memory".to_string(), Quantity(size.memory_limit_bytes.to_string())),
                    ])),
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity(size.cpu_request.to_string())),
                        ("memory".to_string(), Quantity(size.memory_request_bytes.to_string())),
                    ])),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            image_pull_secrets: lab
                .pull_secret_name
                .as_ref()
                .map(|name| vec![LocalObjectReference { name: name.clone() }]),
            tolerations: Some(
                lab.tolerations
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
            node_selector: Some(lab.node_selector.clone()),
            restart_policy: Some("Never".to_string()),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(!options.privileged),
                ..Default::default()
            }),
            affinity: Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(
                                lab.node_selector
                                    .iter()
                                    .map(|(key, value)| NodeSelectorRequirement {
                                        key: key.clone(),
                                        operator: "In".to_string(),
                                        values: Some(vec![value.clone()]),
                                    })
                                    .collect(),
                            ),
                            match_fields: None,
                        }],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabSize;
    use std::time::Duration;

    fn lab_config() -> LabConfig {
        LabConfig {
            namespace_prefix: "userlabs".into(),
            hub_namespace: "hub".into(),
            lab_port: 8888,
            pull_secret_name: None,
            secret_projections: vec![],
            volumes: vec![],
            env: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            tolerations: vec![],
            sizes: BTreeMap::new(),
            argocd_instance: None,
            spawn_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            base_passwd: "root:x:0:0:root:/root:/bin/bash\n".into(),
            base_group: "root:x:0:\n".into(),
            static_files: BTreeMap::new(),
        }
    }

    fn identity() -> UserIdentity {
        UserIdentity {
            username: "rachel".into(),
            uid: 1201,
            primary_gid: 1201,
            groups: vec![super::UserGroup { name: "lsst".into(), gid: 5001 }],
            quota: UserQuota { cpu: 4.0, memory_bytes: 8 << 30 },
        }
    }

    fn size() -> ResolvedSize {
        ResolvedSize {
            name: "small".into(),
            cpu_limit: 1.0,
            memory_limit_bytes: 1 << 30,
            cpu_request: 0.25,
            memory_request_bytes: 256 << 20,
        }
    }

    fn image() -> ResolvedImage {
        ResolvedImage {
            reference: "registry.example.com/rsp/lab@sha256:abc".into(),
            digest: "sha256:abc".into(),
            description: "Weekly 2024_15".into(),
        }
    }

    #[test]
    fn nss_configmap_appends_user_and_group_lines() {
        let cm = build_nss_configmap(&lab_config(), "userlabs-rachel", &identity());
        let data = cm.data.unwrap();
        assert!(data["passwd"].contains("rachel:x:1201:1201"));
        assert!(data["group"].contains("lsst:x:5001:rachel"));
    }

    #[test]
    fn env_configmap_carries_resource_and_image_vars() {
        let cm = build_env_configmap(
            &lab_config(),
            "userlabs-rachel",
            &identity(),
            &LabOptions::default(),
            &image(),
            &size(),
            "rachel-secret",
        );
        let data = cm.data.unwrap();
        assert_eq!(data["IMAGE_DIGEST"], "sha256:abc");
        assert_eq!(data["CPU_LIMIT"], "1");
    }

    #[test]
    fn pod_pins_container_image_to_resolved_reference() {
        let pod = build_pod(
            &lab_config(),
            "userlabs-rachel",
            &identity(),
            &LabOptions::default(),
            &image(),
            &size(),
            "rachel-secret",
        );
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.example.com/rsp/lab@sha256:abc"));
    }
}
