use nublado_lab_controller::config::Config;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_a_complete_config_from_disk() {
    let file = write_config(
        r#"
        log_level = "debug"

        [http]
        port = 9090

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
        "#,
    );

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.http.port, 9090);
    assert!(config.lab.sizes.contains_key("small"));
}

#[test]
fn rejects_a_config_with_no_lab_sizes() {
    let file = write_config(
        r#"
        [images]
        refresh_interval = "5m"

        [images.source]
        kind = "static"
        tags = {}

        [lab]
        hub_namespace = "hub"
        "#,
    );

    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("lab.sizes"));
}

#[test]
fn rejects_metrics_port_colliding_with_http_port() {
    let file = write_config(
        r#"
        [http]
        port = 8080

        [metrics]
        enabled = true
        port = 8080

        [images]
        refresh_interval = "5m"

        [images.source]
        kind = "static"
        tags = { recommended = "sha256:abc" }

        [lab]
        hub_namespace = "hub"

        [lab.sizes.small]
        cpu_limit = 1.0
        memory_limit_bytes = 1073741824
        "#,
    );

    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("metrics.port"));
}

#[test]
fn missing_file_is_a_clear_error() {
    let err = Config::from_file("/nonexistent/path/config.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
