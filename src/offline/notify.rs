//! Notification display and window clients.
//!
//! The edge cannot draw notifications or focus browser tabs itself, so both
//! concerns sit behind traits. The in-process implementations log shown
//! notifications and track window clients in memory, and both are bounded.

use std::collections::VecDeque;
use std::sync::Mutex;

use amanakshar_protocol::{NotificationAction, PushPayload};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "offline::notify";

pub const DEFAULT_TITLE: &str = "अमन अक्षर";
pub const DEFAULT_BODY: &str = "नई कविता आपकी प्रतीक्षा में है";
pub const DEFAULT_ICON: &str = "/icons/icon-192.svg";
pub const DEFAULT_BADGE: &str = "/icons/icon-72.svg";
pub const DEFAULT_TAG: &str = "amanakshar-notification";
pub const DEFAULT_URL: &str = "/";

pub const ACTION_OPEN: &str = "open";
pub const ACTION_CLOSE: &str = "close";

/// Notifications kept by [`LoggedNotifications`].
pub const RECENT_NOTIFICATIONS: usize = 32;
/// Windows tracked by [`ClientRegistry`]; opening more forgets the oldest.
pub const MAX_WINDOWS: usize = 64;

/// A notification ready to be shown, with every default applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub tag: String,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
    pub url: String,
}

impl Notification {
    pub fn from_payload(payload: PushPayload) -> Self {
        Self {
            title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            body: payload.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
            icon: payload.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
            badge: payload.badge.unwrap_or_else(|| DEFAULT_BADGE.to_string()),
            image: payload.image,
            tag: payload.tag.unwrap_or_else(|| DEFAULT_TAG.to_string()),
            require_interaction: payload.require_interaction.unwrap_or(false),
            actions: payload
                .actions
                .filter(|actions| !actions.is_empty())
                .unwrap_or_else(default_actions),
            url: payload.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
        }
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::from_payload(PushPayload::default())
    }
}

pub fn default_actions() -> Vec<NotificationAction> {
    vec![
        NotificationAction::new(ACTION_OPEN, "पढ़ें"),
        NotificationAction::new(ACTION_CLOSE, "बंद करें"),
    ]
}

pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: &Notification);
}

/// Sink that logs notifications and remembers the most recent ones.
#[derive(Debug, Default)]
pub struct LoggedNotifications {
    recent: Mutex<VecDeque<Notification>>,
}

impl LoggedNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Up to [`RECENT_NOTIFICATIONS`] notifications, oldest first.
    pub fn recent(&self) -> Vec<Notification> {
        mutex_lock(&self.recent, SOURCE, "recent")
            .iter()
            .cloned()
            .collect()
    }
}

impl NotificationSink for LoggedNotifications {
    fn show(&self, notification: &Notification) {
        info!(
            title = %notification.title,
            tag = %notification.tag,
            url = %notification.url,
            "showing notification"
        );
        let mut recent = mutex_lock(&self.recent, SOURCE, "show");
        if recent.len() == RECENT_NOTIFICATIONS {
            recent.pop_front();
        }
        recent.push_back(notification.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowClient {
    pub id: Uuid,
    pub url: String,
    pub focused: bool,
}

/// Windows controlled by the edge.
pub trait Clients: Send + Sync {
    fn match_all(&self) -> Vec<WindowClient>;
    fn focus(&self, id: Uuid) -> Option<WindowClient>;
    fn open_window(&self, url: &str) -> WindowClient;
    /// Take control of every window; returns how many were claimed.
    fn claim(&self) -> usize;
}

/// In-memory window registry holding at most [`MAX_WINDOWS`] clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    windows: Mutex<VecDeque<WindowClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a window the edge already serves.
    pub fn register(&self, url: impl Into<String>) -> WindowClient {
        let client = WindowClient {
            id: Uuid::new_v4(),
            url: url.into(),
            focused: false,
        };
        track(&mut mutex_lock(&self.windows, SOURCE, "register"), client.clone());
        client
    }
}

fn track(windows: &mut VecDeque<WindowClient>, client: WindowClient) {
    if windows.len() == MAX_WINDOWS {
        windows.pop_front();
    }
    windows.push_back(client);
}

impl Clients for ClientRegistry {
    fn match_all(&self) -> Vec<WindowClient> {
        mutex_lock(&self.windows, SOURCE, "match_all")
            .iter()
            .cloned()
            .collect()
    }

    fn focus(&self, id: Uuid) -> Option<WindowClient> {
        let mut windows = mutex_lock(&self.windows, SOURCE, "focus");
        let mut focused = None;
        for window in windows.iter_mut() {
            window.focused = window.id == id;
            if window.focused {
                focused = Some(window.clone());
            }
        }
        focused
    }

    fn open_window(&self, url: &str) -> WindowClient {
        let mut windows = mutex_lock(&self.windows, SOURCE, "open_window");
        for window in windows.iter_mut() {
            window.focused = false;
        }
        let client = WindowClient {
            id: Uuid::new_v4(),
            url: url.to_string(),
            focused: true,
        };
        track(&mut windows, client.clone());
        client
    }

    fn claim(&self) -> usize {
        mutex_lock(&self.windows, SOURCE, "claim").len()
    }
}
