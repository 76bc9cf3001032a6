//! Typed API errors and the classifiers the UI layer relies on.

use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::net::NetworkError;

/// Every failure a fetch-layer call can surface.
///
/// `Clone` so request state machines can keep the last error around.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiRequestError {
    /// The origin answered with a non-success status.
    #[error("{}", status_message(.status_text, .data.as_ref()))]
    Status {
        status: StatusCode,
        status_text: String,
        /// Best-effort parsed JSON body, if any.
        data: Option<Value>,
    },
    /// An attempt exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    /// Cancelled by the caller.
    #[error("request aborted")]
    Aborted,
    /// A JSON body could not be encoded or decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ApiRequestError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Status { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn from_status(status: StatusCode, body: &[u8]) -> Self {
        Self::Status {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            data: serde_json::from_slice(body).ok(),
        }
    }
}

impl From<NetworkError> for ApiRequestError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout { .. } => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

/// Prefer the `{ "error": "..." }` message of the body over the reason phrase.
fn status_message(status_text: &str, data: Option<&Value>) -> String {
    data.and_then(|value| value.get("error"))
        .and_then(Value::as_str)
        .map_or_else(|| status_text.to_string(), str::to_string)
}

pub fn is_network_error(err: &ApiRequestError) -> bool {
    matches!(err, ApiRequestError::Network(_) | ApiRequestError::Aborted)
}

pub fn is_rate_limit_error(err: &ApiRequestError) -> bool {
    err.status() == Some(StatusCode::TOO_MANY_REQUESTS)
}

/// User-facing Hindi message for an error.
pub fn error_message(err: &ApiRequestError) -> &'static str {
    if is_network_error(err) {
        return "इंटरनेट कनेक्शन उपलब्ध नहीं है। कृपया अपना कनेक्शन जाँचें।";
    }
    if is_rate_limit_error(err) {
        return "बहुत अधिक अनुरोध। कृपया कुछ देर बाद पुनः प्रयास करें।";
    }
    match err.status().map(|status| status.as_u16()) {
        Some(400) => "अमान्य अनुरोध। कृपया जानकारी जाँचें।",
        Some(401) => "कृपया पहले लॉग इन करें।",
        Some(403) => "आपको यह करने की अनुमति नहीं है।",
        Some(404) => "अनुरोधित सामग्री नहीं मिली।",
        Some(408) => "अनुरोध का समय समाप्त हो गया। कृपया पुनः प्रयास करें।",
        Some(500) => "सर्वर में त्रुटि हुई। कृपया बाद में प्रयास करें।",
        Some(502..=504) => "सेवा अस्थायी रूप से उपलब्ध नहीं है।",
        _ => "कुछ गलत हो गया। कृपया पुनः प्रयास करें।",
    }
}
