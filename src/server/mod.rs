// src/server/mod.rs

//! The controller's own HTTP/JSON + SSE surface. A thin pass-through
//! over the lab manager, file-server manager, and image service: handlers
//! extract the caller's identity from the trusted proxy headers, delegate
//! to the relevant manager, and translate the result to the wire shapes in
//! [`dto`].

mod dto;
mod handlers;
mod identity;

use crate::config::Config;
use crate::core::errors::ControllerError;
use crate::core::events::ProgressEventBus;
use crate::core::fileserver::FileServerManager;
use crate::core::images::ImageService;
use crate::core::k8s::KubernetesAdapter;
use crate::core::lab::LabManager;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub lab: Arc<LabManager>,
    pub fileserver: Option<Arc<FileServerManager>>,
    pub images: Arc<ImageService>,
    pub k8s: KubernetesAdapter,
    pub bus: Arc<ProgressEventBus>,
    pub config: Arc<Config>,
}

/// Maps the controller's error taxonomy onto HTTP status codes. Every
/// variant returns a small JSON body of the shape `{"error": "..."}` so
/// clients get a consistent error envelope regardless of which manager the
/// error originated from.
impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControllerError::Validation(_) => StatusCode::BAD_REQUEST,
            ControllerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ControllerError::Conflict(_) => StatusCode::CONFLICT,
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::AlreadyExists(_) => StatusCode::CONFLICT,
            ControllerError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            ControllerError::ImageUnknown(_) => StatusCode::BAD_REQUEST,
            ControllerError::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControllerError::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
            ControllerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControllerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControllerError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControllerError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
        };
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/images", get(handlers::get_images))
        .route("/prepulls", get(handlers::get_prepulls))
        .route(
            "/labs/{user}",
            post(handlers::create_lab).get(handlers::get_lab).delete(handlers::delete_lab),
        )
        .route("/labs/{user}/events", get(handlers::lab_events))
        .route("/labs", get(handlers::list_labs));

    if state.fileserver.is_some() {
        router = router.route(
            "/files/{user}",
            post(handlers::create_fileserver)
                .get(handlers::get_fileserver)
                .delete(handlers::delete_fileserver),
        );
    }

    router.with_state(state)
}

/// Runs the HTTP/JSON + SSE API server until `shutdown_rx` fires, per
/// `config.http`.
pub async fn run(state: AppState, mut shutdown_rx: broadcast::Receiver<()>) {
    let addr: SocketAddr = format!("{}:{}", state.config.http.host, state.config.http.port)
        .parse()
        .expect("validated http.host/http.port must form a valid socket address");

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    info!("HTTP API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("HTTP API server shutting down.");
        })
        .await
        .unwrap();
}
