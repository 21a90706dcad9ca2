use nublado_lab_controller::config::{FileServerConfig, LabConfig, LabSize};
use nublado_lab_controller::core::fileserver::manifests as fileserver_manifests;
use nublado_lab_controller::core::lab::manifests as lab_manifests;
use nublado_lab_controller::core::lab::{LabOptions, ResolvedImage, ResolvedSize, UserIdentity, UserQuota};
use std::collections::BTreeMap;
use std::time::Duration;

fn lab_config() -> LabConfig {
    LabConfig {
        namespace_prefix: "userlabs".into(),
        hub_namespace: "hub".into(),
        lab_port: 8888,
        pull_secret_name: Some("pull-secret".into()),
        secret_projections: vec![],
        volumes: vec![],
        env: BTreeMap::new(),
        node_selector: BTreeMap::new(),
        tolerations: vec![],
        sizes: BTreeMap::from([(
            "small".to_string(),
            LabSize { cpu_limit: 1.0, memory_limit_bytes: 1 << 30, request_fraction: Some(0.25) },
        )]),
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
        groups: vec![],
        quota: UserQuota { cpu: 4.0, memory_bytes: 8 << 30 },
    }
}

#[test]
fn lab_namespace_and_pod_share_the_same_user_label() {
    let config = lab_config();
    let namespace = lab_manifests::build_namespace(&config, "userlabs-rachel", "rachel");
    let pod = lab_manifests::build_pod(
        &config,
        "userlabs-rachel",
        &identity(),
        &LabOptions::default(),
        &ResolvedImage {
            reference: "registry.example.com/rsp/lab@sha256:abc".into(),
            digest: "sha256:abc".into(),
            description: "Weekly 2024_15".into(),
        },
        &ResolvedSize { name: "small".into(), cpu_limit: 1.0, memory_limit_bytes: 1 << 30, cpu_request: 0.25, memory_request_bytes: 256 << 20 },
        "rachel-secret",
    );

    let ns_user = namespace.metadata.labels.unwrap()["nublado.lsst.io/user"].clone();
    let pod_user = pod.metadata.labels.unwrap()["nublado.lsst.io/user"].clone();
    assert_eq!(ns_user, pod_user);
    assert_eq!(pod.spec.unwrap().image_pull_secrets.unwrap()[0].name.as_deref(), Some("pull-secret"));
}

#[test]
fn fileserver_manifests_share_the_fixed_port() {
    let config = FileServerConfig {
        enabled: true,
        namespace_prefix: "fileservers".into(),
        image: "webdav:latest".into(),
        idle_timeout: Duration::from_secs(3600),
        creation_timeout: Duration::from_secs(120),
        reconcile_interval: Duration::from_secs(60),
        volumes: vec![],
        ingress_class: None,
    };

    let service = fileserver_manifests::build_service("fileservers-rachel");
    let job = fileserver_manifests::build_job(&config, "fileservers-rachel", "rachel");

    let service_port = service.spec.unwrap().ports.unwrap()[0].port;
    let container_port = job.spec.unwrap().template.spec.unwrap().containers[0]
        .ports
        .as_ref()
        .unwrap()[0]
        .container_port;
    assert_eq!(service_port, container_port);
}

#[test]
fn network_policy_admits_own_namespace_and_hub_namespace_on_the_lab_port_only() {
    let config = lab_config();
    let policy = lab_manifests::build_network_policy(&config, "userlabs-rachel");
    let ingress = &policy.spec.unwrap().ingress.unwrap()[0];

    let admitted_namespaces: Vec<String> = ingress
        .from
        .as_ref()
        .unwrap()
        .iter()
        .map(|peer| {
            peer.namespace_selector.as_ref().unwrap().match_labels.as_ref().unwrap()
                ["kubernetes.io/metadata.name"]
                .clone()
        })
        .collect();
    assert!(admitted_namespaces.contains(&"userlabs-rachel".to_string()));
    assert!(admitted_namespaces.contains(&"hub".to_string()));

    let ports = ingress.ports.as_ref().unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(
        ports[0].port,
        Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(8888))
    );
}

#[test]
fn pod_runs_as_non_root_unless_privileged() {
    let config = lab_config();
    let image = ResolvedImage {
        reference: "registry.example.com/rsp/lab@sha256:abc".into(),
        digest: "sha256:abc".into(),
        description: "Weekly 2024_15".into(),
    };
    let size = ResolvedSize {
        name: "small".into(),
        cpu_limit: 1.0,
        memory_limit_bytes: 1 << 30,
        cpu_request: 0.25,
        memory_request_bytes: 256 << 20,
    };

    let pod = lab_manifests::build_pod(
        &config,
        "userlabs-rachel",
        &identity(),
        &LabOptions::default(),
        &image,
        &size,
        "rachel-secret",
    );
    let spec = pod.spec.unwrap();
    assert_eq!(spec.security_context.unwrap().run_as_non_root, Some(true));
    assert!(spec.affinity.unwrap().node_affinity.is_some());

    let privileged_pod = lab_manifests::build_pod(
        &config,
        "userlabs-rachel",
        &identity(),
        &LabOptions { privileged: true, ..Default::default() },
        &image,
        &size,
        "rachel-secret",
    );
    assert_eq!(
        privileged_pod.spec.unwrap().security_context.unwrap().run_as_non_root,
        Some(false)
    );
}
