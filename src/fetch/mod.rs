//! Resilient fetching for the site's JSON API.
//!
//! [`fetch_with_retry`] runs sequential attempts, each bounded by a timeout,
//! and backs off exponentially between retryable failures. [`ApiClient`]
//! layers JSON encoding on top, and [`state`] holds the request state
//! machines pages bind to.

pub mod error;
pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method, StatusCode, header};
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::net::{FetchRequest, FetchResponse, Network};

pub use error::{ApiRequestError, error_message, is_network_error, is_rate_limit_error};
pub use state::{ApiQuery, Mutation, RequestState, RequestStatus};

const METRIC_FETCH_RETRY: &str = "amanakshar_fetch_retry_total";

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_RETRY_ON: [StatusCode; 6] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Called with the 1-based number of the failed attempt before each backoff.
pub type RetryCallback = Arc<dyn Fn(u32, &ApiRequestError) + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^n`.
    pub retry_delay: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry_on: Vec<StatusCode>,
    pub on_retry: Option<RetryCallback>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            retry_on: DEFAULT_RETRY_ON.to_vec(),
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("retry_on", &self.retry_on)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl From<&crate::config::FetchSettings> for RetryOptions {
    fn from(settings: &crate::config::FetchSettings) -> Self {
        Self {
            retries: settings.retries,
            retry_delay: settings.retry_delay,
            timeout: settings.timeout,
            retry_on: settings.retry_on.clone(),
            on_retry: None,
        }
    }
}

impl RetryOptions {
    pub fn with_on_retry(
        mut self,
        callback: impl Fn(u32, &ApiRequestError) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Delay before the attempt following `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }

    fn should_retry(&self, err: &ApiRequestError) -> bool {
        match err {
            ApiRequestError::Status { status, .. } => self.retry_on.contains(status),
            ApiRequestError::Timeout => self.retry_on.contains(&StatusCode::REQUEST_TIMEOUT),
            ApiRequestError::Network(_) => true,
            ApiRequestError::Aborted
            | ApiRequestError::Decode(_)
            | ApiRequestError::InvalidUrl(_) => false,
        }
    }
}

pub async fn fetch_with_retry(
    network: &dyn Network,
    request: &FetchRequest,
    options: &RetryOptions,
) -> Result<FetchResponse, ApiRequestError> {
    fetch_with_retry_cancellable(network, request, options, &CancellationToken::new()).await
}

/// [`fetch_with_retry`] that stops with [`ApiRequestError::Aborted`] as soon
/// as `cancel` fires, whether mid-attempt or mid-backoff.
#[instrument(skip_all, fields(method = %request.method, url = %request.url))]
pub async fn fetch_with_retry_cancellable(
    network: &dyn Network,
    request: &FetchRequest,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<FetchResponse, ApiRequestError> {
    let mut attempt = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ApiRequestError::Aborted),
            outcome = tokio::time::timeout(options.timeout, network.fetch(request)) => outcome,
        };

        let error = match outcome {
            Ok(Ok(response)) if response.ok() || !options.retry_on.contains(&response.status) => {
                return Ok(response);
            }
            Ok(Ok(response)) => ApiRequestError::from_status(response.status, &response.body),
            Ok(Err(err)) => ApiRequestError::from(err),
            Err(_elapsed) => ApiRequestError::Timeout,
        };

        if attempt >= options.retries || !options.should_retry(&error) {
            return Err(error);
        }

        counter!(METRIC_FETCH_RETRY).increment(1);
        if let Some(on_retry) = &options.on_retry {
            on_retry(attempt + 1, &error);
        }
        let delay = options.backoff(attempt);
        debug!(attempt, ?delay, error = %error, "retrying after backoff");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ApiRequestError::Aborted),
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// JSON client for one API origin.
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    network: Arc<dyn Network>,
    options: RetryOptions,
}

impl ApiClient {
    pub fn new(base: Url, network: Arc<dyn Network>) -> Self {
        Self {
            base,
            network,
            options: RetryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RetryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Build a JSON request for `path`, relative to the base URL.
    pub fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<FetchRequest, ApiRequestError> {
        let url = self
            .base
            .join(path)
            .map_err(|err| ApiRequestError::InvalidUrl(format!("{path}: {err}")))?;
        let mut request = FetchRequest::new(method, url)
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_header(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(body) = body {
            let encoded =
                serde_json::to_vec(body).map_err(|err| ApiRequestError::Decode(err.to_string()))?;
            request = request.with_body(encoded);
        }
        Ok(request)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiRequestError> {
        self.get_cancellable(path, &CancellationToken::new()).await
    }

    pub async fn get_cancellable<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T, ApiRequestError> {
        let request = self.request::<()>(Method::GET, path, None)?;
        self.send(&request, cancel).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiRequestError> {
        let request = self.request(Method::POST, path, Some(body))?;
        self.send(&request, &CancellationToken::new()).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiRequestError> {
        let request = self.request(Method::PUT, path, Some(body))?;
        self.send(&request, &CancellationToken::new()).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiRequestError> {
        let request = self.request::<()>(Method::DELETE, path, None)?;
        self.send(&request, &CancellationToken::new()).await
    }

    /// Send with retries and decode the JSON answer.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<T, ApiRequestError> {
        let response =
            fetch_with_retry_cancellable(self.network.as_ref(), request, &self.options, cancel)
                .await?;
        decode(&response)
    }

    /// A single attempt without retry or timeout, for non-idempotent writes.
    pub async fn send_once<T: DeserializeOwned>(
        &self,
        request: &FetchRequest,
    ) -> Result<T, ApiRequestError> {
        let response = self.network.fetch(request).await?;
        decode(&response)
    }
}

fn decode<T: DeserializeOwned>(response: &FetchResponse) -> Result<T, ApiRequestError> {
    if !response.ok() {
        return Err(ApiRequestError::from_status(response.status, &response.body));
    }
    let body: &[u8] = if response.body.is_empty() {
        b"null"
    } else {
        &response.body
    };
    serde_json::from_slice(body).map_err(|err| ApiRequestError::Decode(err.to_string()))
}
