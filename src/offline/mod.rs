//! Offline cache controller: routing, strategies, versioned partitions and
//! worker lifecycle events.

pub mod config;
pub mod controller;
pub mod notify;
pub mod pages;
pub mod partition;
pub mod routes;
pub mod storage;
mod strategy;

pub use config::OfflineConfig;
pub use controller::{
    ActivateReport, CacheController, ClickOutcome, ControllerError, FEATURED_POEMS_PATH,
    FetchOutcome, InstallReport, SYNC_LIKES_TAG, SyncReport, UPDATE_POEMS_TAG,
};
pub use notify::{ClientRegistry, Clients, LoggedNotifications, Notification, NotificationSink};
pub use pages::{OfflineKind, offline_response};
pub use partition::{CacheVersion, PartitionKind};
pub use routes::{BypassReason, Route, RouteTable};
pub use storage::{CacheStorage, Partition, QueuedRequest, StorageError};
