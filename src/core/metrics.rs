// src/core/metrics.rs

//! Defines and registers Prometheus metrics for controller monitoring.
//!
//! This module uses `once_cell` to ensure that metrics are registered only
//! once globally for the entire process lifetime.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
};

// --- Lab gauges, labeled by `LabStatus` ---
pub static LABS_BY_STATUS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "nublado_labs_by_status",
        "Number of user labs currently in each status.",
        &["status"]
    )
    .unwrap()
});

pub static FILESERVERS_BY_STATUS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "nublado_fileservers_by_status",
        "Number of file-server instances currently in each status.",
        &["status"]
    )
    .unwrap()
});

pub static CATALOG_IMAGES_BY_CLASS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "nublado_catalog_images_by_class",
        "Number of images in the current catalog snapshot, labeled by tag class.",
        &["class"]
    )
    .unwrap()
});

pub static PREPULL_GAP_SIZE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "nublado_prepull_gap_size",
        "Number of (node, digest) pairs still missing from eligible nodes."
    )
    .unwrap()
});

pub static CATALOG_REFRESH_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "nublado_catalog_refresh_failures_total",
        "Total number of image catalog refresh attempts that failed."
    )
    .unwrap()
});

pub static SPAWN_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "nublado_lab_spawn_attempts_total",
        "Total number of lab spawn attempts, labeled by outcome.",
        &["outcome"]
    )
    .unwrap()
});

pub static SPAWN_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "nublado_lab_spawn_duration_seconds",
        "Wall-clock duration of the lab creation protocol, from pending to running or failed."
    )
    .unwrap()
});

pub static PREPULL_PODS_CREATED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "nublado_prepull_pods_created_total",
        "Total number of prepull pods submitted to the cluster."
    )
    .unwrap()
});

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
