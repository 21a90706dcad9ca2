// src/core/k8s/mod.rs

//! The Kubernetes Adapter: typed primitives over generic and custom
//! resources, with timeouts, error classification, and watch helpers that
//! transparently recover from `resourceVersion` expiry.

pub mod client;
pub mod ingress;
pub mod watch;

pub use client::KubernetesAdapter;
pub use ingress::{GafaelfawrIngress, GafaelfawrIngressSpec};
