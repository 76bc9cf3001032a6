use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::application::error::HttpError;
use crate::net::FetchRequest;
use crate::offline::{FetchOutcome, routes::is_like_path};

use super::{EdgeState, into_fetch_request, into_response};

const SOURCE: &str = "infra::http::edge";

/// Every request that is not part of the control API.
pub(super) async fn forward(State(state): State<EdgeState>, request: Request<Body>) -> Response {
    let request =
        match into_fetch_request(state.controller.origin(), request, state.max_body_bytes).await {
            Ok(request) => request,
            Err(err) => return err.into_response(),
        };

    match state.controller.on_fetch(request).await {
        FetchOutcome::Respond(response) => into_response(response),
        FetchOutcome::Bypass(request) => proxy(&state, request).await,
    }
}

#[instrument(skip_all, fields(method = %request.method, url = %request.url))]
async fn proxy(state: &EdgeState, request: FetchRequest) -> Response {
    let error = match state.network.fetch(&request).await {
        Ok(response) => return into_response(response),
        Err(error) => error,
    };

    if request.method == Method::POST && is_like_path(request.url.path()) {
        debug!(error = %error, "like could not reach the origin");
        return match state.controller.queue_like(request) {
            Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "queued": true }))).into_response(),
            Err(err) => {
                warn!(error = %err, "like could not be queued");
                HttpError::from_error(
                    SOURCE,
                    StatusCode::INSUFFICIENT_STORAGE,
                    "Like could not be queued",
                    &err,
                )
                .into_response()
            }
        };
    }

    HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Origin unavailable", &error)
        .into_response()
}
