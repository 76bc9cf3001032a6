//! Synthesised offline documents.
//!
//! Returned with `503 Service Unavailable` when neither the cache nor the
//! network can answer a request.

use askama::Template;
use axum::http::StatusCode;
use serde_json::json;
use tracing::warn;

use crate::net::FetchResponse;

const SITE_NAME: &str = "अमन अक्षर";
const POEMS_HREF: &str = "/kavita";
const BARE_OFFLINE_BODY: &str = "<!DOCTYPE html><html lang=\"hi\"><body><h1>आप ऑफ़लाइन हैं</h1></body></html>";

#[derive(Template)]
#[template(path = "offline.html")]
struct OfflineTemplate<'a> {
    site_name: &'a str,
}

#[derive(Template)]
#[template(path = "offline_poem.html")]
struct OfflinePoemTemplate<'a> {
    site_name: &'a str,
    poems_href: &'a str,
}

/// Which offline document to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineKind {
    Page,
    Poem,
    PoemApi,
}

impl OfflineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OfflineKind::Page => "page",
            OfflineKind::Poem => "poem",
            OfflineKind::PoemApi => "poem_api",
        }
    }
}

pub fn offline_response(kind: OfflineKind) -> FetchResponse {
    match kind {
        OfflineKind::Page => render_html(OfflineTemplate {
            site_name: SITE_NAME,
        }),
        OfflineKind::Poem => render_html(OfflinePoemTemplate {
            site_name: SITE_NAME,
            poems_href: POEMS_HREF,
        }),
        OfflineKind::PoemApi => {
            FetchResponse::json(StatusCode::SERVICE_UNAVAILABLE, &json!({ "error": "Offline" }))
        }
    }
}

fn render_html<T: Template>(template: T) -> FetchResponse {
    let body = template.render().unwrap_or_else(|err| {
        warn!(error = %err, "offline template failed to render");
        BARE_OFFLINE_BODY.to_string()
    });
    FetchResponse::html(StatusCode::SERVICE_UNAVAILABLE, body)
}
