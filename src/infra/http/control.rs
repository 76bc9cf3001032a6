use amanakshar_protocol::{NotificationClickPayload, WorkerMessage};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::application::error::HttpError;
use crate::offline::{ClickOutcome, Notification, SyncReport};

use super::EdgeState;

pub(super) async fn message(
    State(state): State<EdgeState>,
    Json(message): Json<WorkerMessage>,
) -> Result<Response, HttpError> {
    let reply = state.controller.on_message(message).await?;
    Ok(match reply {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// The raw body is the push data; an empty body means no data.
pub(super) async fn push(State(state): State<EdgeState>, body: Bytes) -> Json<Notification> {
    let data = (!body.is_empty()).then_some(body.as_ref());
    Json(state.controller.on_push(data))
}

pub(super) async fn notification_click(
    State(state): State<EdgeState>,
    Json(click): Json<NotificationClickPayload>,
) -> Json<ClickOutcome> {
    Json(state.controller.on_notification_click(click))
}

pub(super) async fn sync(
    State(state): State<EdgeState>,
    Path(tag): Path<String>,
) -> Json<SyncReport> {
    Json(state.controller.on_sync(&tag).await)
}

#[derive(Debug, Serialize)]
pub(super) struct PeriodicSyncReply {
    handled: bool,
}

pub(super) async fn periodic_sync(
    State(state): State<EdgeState>,
    Path(tag): Path<String>,
) -> Result<Json<PeriodicSyncReply>, HttpError> {
    let handled = state.controller.on_periodic_sync(&tag).await?;
    Ok(Json(PeriodicSyncReply { handled }))
}

#[derive(Debug, Serialize)]
pub(super) struct Health {
    version: String,
    origin: String,
    partitions: Vec<String>,
    cached_poems: usize,
    queued_likes: usize,
    /// RFC 3339 time the oldest waiting like was queued.
    oldest_queued_like: Option<String>,
}

pub(super) async fn health(State(state): State<EdgeState>) -> Json<Health> {
    let controller = &state.controller;
    let mut partitions = controller.storage().keys();
    partitions.sort();
    let queued = controller.queued_likes();
    Json(Health {
        version: controller.version().to_string(),
        origin: controller.origin().to_string(),
        partitions,
        cached_poems: controller.cached_poems().len(),
        queued_likes: queued.len(),
        oldest_queued_like: queued
            .first()
            .and_then(|like| like.queued_at.format(&Rfc3339).ok()),
    })
}
