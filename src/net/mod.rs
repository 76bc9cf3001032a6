//! Network primitives shared by the offline controller, the fetch layer and
//! the preload queue.
//!
//! Requests and responses are plain values with `Bytes` bodies so they can be
//! cloned into caches and retried without re-reading a stream. The
//! [`Network`] trait is the only place real I/O happens; production code uses
//! [`HttpNetwork`], tests inject scripted fakes.

#[cfg(test)]
pub(crate) mod testing;

use std::borrow::Cow;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// True when the `Accept` header lists the given media type.
    pub fn accepts(&self, media_type: &str) -> bool {
        self.headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains(media_type))
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn html(status: StatusCode, body: String) -> Self {
        Self::new(status, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// True for 2xx statuses, mirroring `Response.ok`.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Transport-level failure: the request never produced an HTTP response.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("failed to read response body from {url}: {message}")]
    Body { url: String, message: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl NetworkError {
    pub fn connect(url: &Url, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError>;
}

/// [`Network`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(Self::user_agent())
            .build()?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("amanakshar-edge/", env!("CARGO_PKG_VERSION"))
    }

    fn classify(url: &Url, error: &reqwest::Error) -> NetworkError {
        if error.is_timeout() {
            NetworkError::Timeout {
                url: url.to_string(),
            }
        } else if error.is_connect() {
            NetworkError::connect(url, error.to_string())
        } else {
            NetworkError::Request {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| Self::classify(&request.url, &err))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| NetworkError::Body {
                url: request.url.to_string(),
                message: err.to_string(),
            })?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://amanakshar.in")
            .and_then(|base| base.join(path))
            .expect("valid url")
    }

    #[test]
    fn accepts_matches_any_listed_media_type() {
        let request = FetchRequest::get(url("/kavita")).with_header(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9"),
        );
        assert!(request.accepts("text/html"));
        assert!(!request.accepts("application/json"));
    }

    #[test]
    fn ok_is_limited_to_success_statuses() {
        assert!(FetchResponse::new(StatusCode::NO_CONTENT, "").ok());
        assert!(!FetchResponse::new(StatusCode::NOT_MODIFIED, "").ok());
        assert!(!FetchResponse::new(StatusCode::SERVICE_UNAVAILABLE, "").ok());
    }

    #[test]
    fn status_text_uses_canonical_reason() {
        let response = FetchResponse::new(StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(response.status_text(), "Too Many Requests");
    }
}
