// src/server/handlers.rs

use super::dto::{
    CreateLabRequest, FileServerStatusResponse, ImageMenuResponse, LabListEntry, LabStatusResponse,
    PrepullImageStatus, PrepullsResponse, ProgressEventDto,
};
use super::identity::{authorize_for_user, caller_from_headers};
use super::AppState;
use crate::core::errors::ControllerError;
use crate::core::images::NodeView;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use std::convert::Infallible;

type HandlerResult<T> = Result<T, ControllerError>;

fn parse_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

pub async fn get_images(State(state): State<AppState>) -> Json<ImageMenuResponse> {
    let catalog = state.images.snapshot();
    let repository = state.config.images.source.repository().unwrap_or_default();
    Json(ImageMenuResponse::from_catalog(&catalog, repository))
}

/// `GET /prepulls`. Joins the image catalog's `to_prepull` set against a
/// freshly listed node view so the response reflects present vs. missing
/// nodes at request time rather than at the prepuller's last tick.
pub async fn get_prepulls(State(state): State<AppState>) -> HandlerResult<Json<PrepullsResponse>> {
    let catalog = state.images.snapshot();
    let raw_nodes = state.k8s.list_nodes().await?;
    let node_view = NodeView::build(&raw_nodes, &state.lab.lab_config().node_selector, &state.lab.lab_config().tolerations);
    let eligible: Vec<&str> = node_view.eligible_nodes().map(|n| n.name.as_str()).collect();

    let images = catalog
        .to_prepull
        .iter()
        .map(|digest| {
            let (present, missing): (Vec<String>, Vec<String>) = eligible
                .iter()
                .map(|n| n.to_string())
                .partition(|name| node_view.nodes.get(name).is_some_and(|info| info.digests.contains(digest)));
            PrepullImageStatus {
                digest: digest.clone(),
                missing_on_nodes: missing,
                present_on_nodes: present,
            }
        })
        .collect();

    Ok(Json(PrepullsResponse {
        config: state.config.prepuller.clone(),
        images,
    }))
}

pub async fn create_lab(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateLabRequest>,
) -> HandlerResult<StatusCode> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    let spec = request.try_into()?;
    state.lab.create(caller.identity, spec).await?;
    Ok(StatusCode::CREATED)
}

pub async fn get_lab(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<Json<LabStatusResponse>> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    let lab_state = state.lab.status(&user).await?;
    Ok(Json(lab_state.into()))
}

pub async fn delete_lab(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<StatusCode> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    state.lab.delete(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_labs(State(state): State<AppState>) -> Json<Vec<LabListEntry>> {
    let labs = state.lab.list().await;
    Json(labs.iter().map(LabListEntry::from).collect())
}

/// `GET /labs/{user}/events`. Replays the buffered backlog (honoring
/// `Last-Event-ID` for resumption), then forwards live events until the
/// receiver lags past the channel capacity or the lab is forgotten.
pub async fn lab_events(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;

    let after_seq = parse_last_event_id(&headers);
    let (replay, mut receiver) = state.lab.events(&user, after_seq).await?;

    let stream = async_stream::stream! {
        for event in replay {
            let dto = ProgressEventDto::from(&event);
            if let Ok(sse_event) = Event::default().id(dto.seq.to_string()).json_data(&dto) {
                yield Ok(sse_event);
            }
        }

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let dto = ProgressEventDto::from(&event);
                    if let Ok(sse_event) = Event::default().id(dto.seq.to_string()).json_data(&dto) {
                        yield Ok(sse_event);
                    }
                    if event.ready || dto.seq == u64::MAX {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn fileserver_or_disabled(state: &AppState) -> HandlerResult<&std::sync::Arc<crate::core::fileserver::FileServerManager>> {
    state
        .fileserver
        .as_ref()
        .ok_or_else(|| ControllerError::Validation("file servers are disabled".to_string()))
}

pub async fn create_fileserver(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<StatusCode> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    let fileserver = fileserver_or_disabled(&state)?;
    fileserver.create(&user).await?;
    Ok(StatusCode::CREATED)
}

pub async fn get_fileserver(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<Json<FileServerStatusResponse>> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    let fileserver = fileserver_or_disabled(&state)?;
    let fs_state = fileserver.status(&user).await?;
    Ok(Json(fs_state.into()))
}

pub async fn delete_fileserver(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<StatusCode> {
    let caller = caller_from_headers(&headers, &state.config)?;
    authorize_for_user(&caller, &user)?;
    let fileserver = fileserver_or_disabled(&state)?;
    fileserver.delete(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}
