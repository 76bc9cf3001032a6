//! The offline cache controller.
//!
//! One method per worker event. The controller owns the partitions, the
//! routing table and the strategies; hosts translate their own events into
//! these calls and act on the returned values.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use amanakshar_protocol::{
    CachePoemPayload, NotificationClickPayload, PushPayload, WorkerMessage, WorkerReply,
};
use axum::http::{Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::net::{FetchRequest, FetchResponse, Network, NetworkError};

use super::config::OfflineConfig;
use super::notify::{
    ACTION_CLOSE, ClientRegistry, Clients, DEFAULT_URL, LoggedNotifications, Notification,
    NotificationSink, WindowClient,
};
use super::pages::OfflineKind;
use super::partition::{CacheVersion, PARTITION_PREFIX, PartitionKind};
use super::routes::{Route, RouteTable, is_like_path, poem_slug};
use super::storage::{AddAllError, CacheStorage, Partition, QueuedRequest, StorageError};
use super::strategy::{Strategies, store};

pub const SYNC_LIKES_TAG: &str = "sync-likes";
pub const UPDATE_POEMS_TAG: &str = "update-poems";
pub const FEATURED_POEMS_PATH: &str = "/api/poems/featured";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("static precache failed: {0}")]
    Precache(#[from] AddAllError),
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("`{url}` answered {status}")]
    Status { url: String, status: StatusCode },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of [`CacheController::on_fetch`].
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The controller does not handle this request; the host fetches it.
    Bypass(FetchRequest),
    Respond(FetchResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub static_cached: usize,
    /// `None` when the optional manifest failed to precache.
    pub three_cached: Option<usize>,
    pub models_cached: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
    pub claimed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "client", rename_all = "snake_case")]
pub enum ClickOutcome {
    Dismissed,
    Focused(WindowClient),
    Opened(WindowClient),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub replayed: usize,
    pub failed: usize,
}

pub struct CacheController {
    origin: Url,
    config: OfflineConfig,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    routes: RouteTable,
    strategies: Strategies,
    notifications: Arc<dyn NotificationSink>,
    clients: Arc<dyn Clients>,
    waiting_skipped: AtomicBool,
}

impl CacheController {
    pub fn new(origin: Url, config: OfflineConfig, network: Arc<dyn Network>) -> Self {
        let storage = Arc::new(CacheStorage::new(config.partition_quota_non_zero()));
        let strategies = Strategies::new(
            Arc::clone(&storage),
            Arc::clone(&network),
            config.version.clone(),
        );
        Self {
            routes: RouteTable::new(&origin),
            origin,
            config,
            storage,
            network,
            strategies,
            notifications: Arc::new(LoggedNotifications::new()),
            clients: Arc::new(ClientRegistry::new()),
            waiting_skipped: AtomicBool::new(false),
        }
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    pub fn with_clients(mut self, clients: Arc<dyn Clients>) -> Self {
        self.clients = clients;
        self
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn version(&self) -> &CacheVersion {
        &self.config.version
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn partition(&self, kind: PartitionKind) -> Arc<Partition> {
        self.strategies.partition(kind)
    }

    /// Whether installation finished and the controller took over at once.
    pub fn waiting_skipped(&self) -> bool {
        self.waiting_skipped.load(Ordering::Acquire)
    }

    /// Precache the manifests. Only the static manifest is mandatory.
    #[instrument(skip_all, fields(version = %self.config.version))]
    pub async fn on_install(&self) -> Result<InstallReport, ControllerError> {
        let static_urls = self.resolve_all(&self.config.static_assets)?;
        let static_cached = self
            .partition(PartitionKind::Static)
            .add_all(self.network.as_ref(), &static_urls)
            .await?;

        let three_cached = self
            .precache_optional(PartitionKind::Three, &self.config.three_assets)
            .await;
        let models_cached = self
            .precache_optional(PartitionKind::Models, &self.config.model_assets)
            .await;

        self.waiting_skipped.store(true, Ordering::Release);
        info!(static_cached, ?three_cached, ?models_cached, "install complete");
        Ok(InstallReport {
            static_cached,
            three_cached,
            models_cached,
        })
    }

    async fn precache_optional(&self, kind: PartitionKind, paths: &[String]) -> Option<usize> {
        let urls = match self.resolve_all(paths) {
            Ok(urls) => urls,
            Err(err) => {
                warn!(partition = %kind, error = %err, "optional precache skipped");
                return None;
            }
        };
        match self
            .partition(kind)
            .add_all(self.network.as_ref(), &urls)
            .await
        {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(partition = %kind, error = %err, "optional precache failed");
                None
            }
        }
    }

    /// Sweep partitions left behind by older versions, then claim clients.
    #[instrument(skip_all, fields(version = %self.config.version))]
    pub fn on_activate(&self) -> ActivateReport {
        let current = self.config.version.current_names();
        let deleted: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|name| name.starts_with(PARTITION_PREFIX) && !current.contains(name))
            .filter(|name| self.storage.delete(name))
            .collect();
        let claimed = self.clients.claim();
        info!(deleted = deleted.len(), claimed, "activate complete");
        ActivateReport { deleted, claimed }
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn on_fetch(&self, request: FetchRequest) -> FetchOutcome {
        let (rule, route) = self.routes.resolve_named(&request);
        debug!(rule, ?route, "routed");
        let response = match route {
            Route::Bypass(_) => return FetchOutcome::Bypass(request),
            Route::Poem => self.strategies.poem(&request).await,
            Route::PoemApi => self.strategies.poem_api(&request).await,
            Route::CacheFirst(kind) => self.strategies.cache_first(&request, kind).await,
            Route::NetworkFirst(kind) => {
                self.strategies
                    .network_first(&request, kind, OfflineKind::Page)
                    .await
            }
            Route::StaleWhileRevalidate(kind) => {
                self.strategies.stale_while_revalidate(&request, kind).await
            }
        };
        FetchOutcome::Respond(response)
    }

    pub async fn on_message(
        &self,
        message: WorkerMessage,
    ) -> Result<Option<WorkerReply>, ControllerError> {
        match message {
            WorkerMessage::CachePoem(payload) => {
                self.cache_poem(&payload).await?;
                Ok(None)
            }
            WorkerMessage::ClearPoemCache => {
                let name = self.config.version.partition_name(PartitionKind::Poems);
                let removed = self.storage.delete(&name);
                info!(partition = %name, removed, "poem cache cleared");
                Ok(None)
            }
            WorkerMessage::GetCachedPoems => Ok(Some(WorkerReply::CachedPoems {
                poems: self.cached_poems(),
            })),
        }
    }

    async fn cache_poem(&self, payload: &CachePoemPayload) -> Result<(), ControllerError> {
        let url = self.resolve(&payload.url)?;
        let request = FetchRequest::get(url);
        let response = self.network.fetch(&request).await?;
        if !response.ok() {
            return Err(ControllerError::Status {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        self.partition(PartitionKind::Poems).put(&request, response)?;
        debug!(slug = %payload.slug, "poem cached on request");
        Ok(())
    }

    /// Slugs of every cached poem page, oldest first.
    pub fn cached_poems(&self) -> Vec<String> {
        self.partition(PartitionKind::Poems)
            .keys()
            .iter()
            .filter_map(|request| poem_slug(request.url.path()).map(str::to_string))
            .collect()
    }

    /// Show a notification for a push message. Missing or malformed
    /// payloads fall back to the site defaults.
    pub fn on_push(&self, data: Option<&[u8]>) -> Notification {
        let payload = data.map(parse_push).unwrap_or_default();
        let notification = Notification::from_payload(payload);
        self.notifications.show(&notification);
        notification
    }

    pub fn on_notification_click(&self, click: NotificationClickPayload) -> ClickOutcome {
        if click.action.as_deref() == Some(ACTION_CLOSE) {
            return ClickOutcome::Dismissed;
        }

        let target = click.url.unwrap_or_else(|| DEFAULT_URL.to_string());
        let existing = self
            .clients
            .match_all()
            .into_iter()
            .find(|client| self.same_page(&client.url, &target));
        if let Some(focused) = existing.and_then(|client| self.clients.focus(client.id)) {
            return ClickOutcome::Focused(focused);
        }
        ClickOutcome::Opened(self.clients.open_window(&target))
    }

    /// Replay queued likes for `sync-likes`; other tags are ignored.
    #[instrument(skip(self))]
    pub async fn on_sync(&self, tag: &str) -> SyncReport {
        if tag != SYNC_LIKES_TAG {
            debug!("unknown sync tag ignored");
            return SyncReport::default();
        }

        let partition = self.partition(PartitionKind::Dynamic);
        let mut report = SyncReport::default();
        for QueuedRequest { id, request, .. } in self.queued_likes() {
            match self.network.fetch(&request).await {
                Ok(response) if response.ok() => {
                    partition.remove_queued(id);
                    report.replayed += 1;
                }
                Ok(response) => {
                    debug!(url = %request.url, status = %response.status, "like replay rejected");
                    report.failed += 1;
                }
                Err(err) => {
                    debug!(url = %request.url, error = %err, "like replay failed");
                    report.failed += 1;
                }
            }
        }
        info!(replayed = report.replayed, failed = report.failed, "likes synced");
        report
    }

    /// Refresh the featured poems for `update-poems`. Returns whether the
    /// tag was handled.
    #[instrument(skip(self))]
    pub async fn on_periodic_sync(&self, tag: &str) -> Result<bool, ControllerError> {
        if tag != UPDATE_POEMS_TAG {
            debug!("unknown periodic sync tag ignored");
            return Ok(false);
        }

        let request = FetchRequest::get(self.resolve(FEATURED_POEMS_PATH)?);
        let response = self.network.fetch(&request).await?;
        if !response.ok() {
            return Err(ControllerError::Status {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        store(
            &self.partition(PartitionKind::Poems),
            &request,
            &response,
            PartitionKind::Poems,
        );
        info!("featured poems refreshed");
        Ok(true)
    }

    /// Keep a like that could not reach the origin for the next
    /// `sync-likes` run. Every call queues a separate replay.
    pub fn queue_like(&self, request: FetchRequest) -> Result<(), StorageError> {
        let placeholder =
            FetchResponse::json(StatusCode::ACCEPTED, &serde_json::json!({"queued": true}));
        let id = self
            .partition(PartitionKind::Dynamic)
            .queue(&request, placeholder)?;
        info!(url = %request.url, %id, "like queued for sync");
        Ok(())
    }

    /// Likes waiting for `sync-likes`, oldest first.
    pub fn queued_likes(&self) -> Vec<QueuedRequest> {
        let name = self.config.version.partition_name(PartitionKind::Dynamic);
        let Some(partition) = self.storage.get(&name) else {
            return Vec::new();
        };
        partition
            .queued()
            .into_iter()
            .filter(|queued| {
                queued.request.method == Method::POST && is_like_path(queued.request.url.path())
            })
            .collect()
    }

    /// Wait for background revalidations to finish.
    pub async fn settle(&self) {
        self.strategies.settle().await;
    }

    fn resolve(&self, path: &str) -> Result<Url, ControllerError> {
        self.origin
            .join(path)
            .map_err(|source| ControllerError::InvalidUrl {
                url: path.to_string(),
                source,
            })
    }

    fn resolve_all(&self, paths: &[String]) -> Result<Vec<Url>, ControllerError> {
        paths.iter().map(|path| self.resolve(path)).collect()
    }

    fn same_page(&self, a: &str, b: &str) -> bool {
        match (self.origin.join(a), self.origin.join(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }
}

fn parse_push(data: &[u8]) -> PushPayload {
    serde_json::from_slice(data).unwrap_or_else(|err| {
        let text = String::from_utf8_lossy(data).trim().to_string();
        debug!(error = %err, "push payload is not JSON");
        PushPayload {
            body: (!text.is_empty()).then_some(text),
            ..PushPayload::default()
        }
    })
}
