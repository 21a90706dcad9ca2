// src/main.rs

//! The main entry point for the Nublado lab controller.

use anyhow::Result;
use nublado_lab_controller::config::Config;
use nublado_lab_controller::core::events::ProgressEventBus;
use nublado_lab_controller::core::fileserver::FileServerManager;
use nublado_lab_controller::core::images::{ImageService, build_source};
use nublado_lab_controller::core::k8s::KubernetesAdapter;
use nublado_lab_controller::core::lab::LabManager;
use nublado_lab_controller::core::prepuller::PrepullerTask;
use nublado_lab_controller::core::Scheduler;
use nublado_lab_controller::server;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("nublado-lab-controller version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    info!("Starting nublado-lab-controller {}.", VERSION);

    let k8s = match KubernetesAdapter::try_default().await {
        Ok(k8s) => k8s,
        Err(e) => {
            error!("failed to build Kubernetes client: {}", e);
            std::process::exit(1);
        }
    };

    let source = build_source(&config.images.source);
    let images = Arc::new(ImageService::new(
        source,
        k8s.clone(),
        config.images.clone(),
        config.lab.clone(),
    ));
    images.refresh().await;

    let bus = Arc::new(ProgressEventBus::new());

    let lab = Arc::new(LabManager::new(images.clone(), k8s.clone(), bus.clone(), config.clone()));

    let fileserver = if config.fileserver.enabled {
        Some(Arc::new(FileServerManager::new(k8s.clone(), bus.clone(), config.clone())))
    } else {
        None
    };

    let prepuller = Arc::new(PrepullerTask::new(
        images.clone(),
        k8s.clone(),
        config.lab.clone(),
        config.images.clone(),
        config.prepuller.clone(),
    ));

    let scheduler = Scheduler::start(
        k8s.clone(),
        images.clone(),
        prepuller.clone(),
        lab.clone(),
        fileserver.clone(),
        bus.clone(),
    );

    let state = server::AppState {
        lab,
        fileserver,
        images,
        k8s,
        bus: bus.clone(),
        config: Arc::new(config.clone()),
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let http_handle = tokio::spawn(server::run(state, shutdown_tx.subscribe()));

    let metrics_handle = if config.metrics.enabled {
        Some(tokio::spawn(run_metrics_server(config.metrics.port, shutdown_tx.subscribe())))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    scheduler.shutdown(&bus).await;

    Ok(())
}

/// Runs a bare Prometheus `/metrics` endpoint on its own port, independent of
/// the main JSON/SSE API server, per `config.metrics`.
async fn run_metrics_server(port: u16, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
    use axum::{Router, routing::get};

    async fn metrics_handler() -> impl axum::response::IntoResponse {
        (
            axum::http::StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            nublado_lab_controller::core::metrics::gather_metrics(),
        )
    }

    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .unwrap();
}
