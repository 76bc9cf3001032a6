//! Wire types shared between Amanakshar pages and the offline edge.
//!
//! Pages talk to the edge through `postMessage`-shaped JSON messages and the
//! push service delivers [`PushPayload`] documents. Both sides serialise these
//! types with `serde`, so field names follow the browser conventions
//! (`SCREAMING_SNAKE_CASE` message types, camelCase payload keys).

use serde::{Deserialize, Serialize};

/// Commands a page can send to the offline edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Fetch the given poem page and keep it in the poem partition.
    CachePoem(CachePoemPayload),
    /// Drop every cached poem.
    ClearPoemCache,
    /// List the slugs of all cached poem pages.
    GetCachedPoems,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePoemPayload {
    pub slug: String,
    pub url: String,
}

/// Replies sent back over the message port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerReply {
    CachedPoems { poems: Vec<String> },
}

/// Push message body as produced by the notification service.
///
/// Every field is optional; the edge fills in site defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub image: Option<String>,
    pub tag: Option<String>,
    pub require_interaction: Option<bool>,
    pub actions: Option<Vec<NotificationAction>>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl NotificationAction {
    pub fn new(action: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            title: title.into(),
            icon: None,
        }
    }
}

/// A click on a shown notification, or on one of its action buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationClickPayload {
    /// Action identifier; `None` for a click on the notification body.
    pub action: Option<String>,
    /// URL carried in the notification data.
    pub url: Option<String>,
}
