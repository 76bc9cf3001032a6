//! HTTP edge: hosts the cache controller in front of the site origin.

mod control;
mod edge;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderMap, HeaderName, Request, header},
    middleware as axum_middleware,
    response::Response,
    routing::{get, post},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use url::Url;

use crate::application::error::HttpError;
use crate::net::{FetchRequest, FetchResponse, Network};
use crate::offline::CacheController;

use self::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
];

#[derive(Clone)]
pub struct EdgeState {
    pub controller: Arc<CacheController>,
    pub network: Arc<dyn Network>,
    pub max_body_bytes: usize,
}

impl EdgeState {
    pub fn new(
        controller: Arc<CacheController>,
        network: Arc<dyn Network>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            controller,
            network,
            max_body_bytes,
        }
    }
}

pub fn build_router(state: EdgeState) -> Router {
    let max_body_bytes = state.max_body_bytes;

    let control = Router::new()
        .route("/message", post(control::message))
        .route("/push", post(control::push))
        .route("/notification-click", post(control::notification_click))
        .route("/sync/{tag}", post(control::sync))
        .route("/periodic-sync/{tag}", post(control::periodic_sync))
        .route("/health", get(control::health))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    Router::new()
        .nest("/__edge", control)
        .fallback(edge::forward)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Rebase an inbound request onto the origin.
async fn into_fetch_request(
    origin: &Url,
    request: Request<Body>,
    limit: usize,
) -> Result<FetchRequest, HttpError> {
    let (parts, body) = request.into_parts();

    let mut url = origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|err| {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                HttpError::new(
                    SOURCE,
                    axum::http::StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body too large",
                    format!("request body exceeds {limit} bytes"),
                )
            } else {
                HttpError::new(
                    SOURCE,
                    axum::http::StatusCode::BAD_REQUEST,
                    "Request body could not be read",
                    err.to_string(),
                )
            }
        })?
        .to_bytes();

    let mut headers = forwardable(parts.headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let mut fetch = FetchRequest::new(parts.method, url).with_body(body);
    fetch.headers = headers;
    Ok(fetch)
}

fn into_response(response: FetchResponse) -> Response {
    let FetchResponse {
        status,
        headers,
        body,
    } = response;

    let mut headers = forwardable(headers);
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn forwardable(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}
