//! Prioritised asset preloading.
//!
//! [`AssetPreloader`] is an explicitly constructed, cloneable handle. Loads
//! are deduplicated per URL through one shared future, dispatched by
//! priority under a concurrency cap derived from the current connection
//! speed, and their aggregate progress is broadcast after each settles.

pub mod connection;
pub mod hints;
pub mod loaders;
pub mod progress;
pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::net::Network;
use crate::util::lock::mutex_lock;

pub use connection::{ConnectionMonitor, ConnectionSpeed};
pub use hints::{LinkRel, PreloadLink, preconnect_links};
pub use loaders::{Asset, FormatSupport, PreloadError, Texture};
pub use progress::{PreloadProgress, ProgressWatcher};
pub use queue::{AssetKind, PreloadQueue, Priority};

use loaders::Loaders;
use progress::LoadTimer;

const SOURCE: &str = "preload";
const PROGRESS_CAPACITY: usize = 64;

const METRIC_PRELOAD_LOAD_MS: &str = "amanakshar_preload_load_ms";
const METRIC_PRELOAD_FAILED: &str = "amanakshar_preload_failed_total";

type LoadResult = Result<Asset, PreloadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// One entry of a [`AssetPreloader::preload_all`] batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PreloadRequest {
    pub url: String,
    pub kind: AssetKind,
    pub priority: Priority,
}

impl PreloadRequest {
    pub fn new(url: impl Into<String>, kind: AssetKind, priority: Priority) -> Self {
        Self {
            url: url.into(),
            kind,
            priority,
        }
    }
}

#[derive(Default)]
struct State {
    queue: PreloadQueue,
    cache: HashMap<String, Asset>,
    errors: HashMap<String, PreloadError>,
    inflight: HashMap<String, SharedLoad>,
    senders: HashMap<String, oneshot::Sender<LoadResult>>,
    timer: LoadTimer,
}

impl State {
    fn progress(&self) -> PreloadProgress {
        PreloadProgress::compute(
            self.queue.loaded_len(),
            self.queue.loading_len(),
            self.queue.queued_len(),
            self.timer.average(),
        )
    }
}

struct Inner {
    base: Url,
    loaders: Loaders,
    connection: watch::Receiver<ConnectionSpeed>,
    state: Mutex<State>,
    progress: broadcast::Sender<PreloadProgress>,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct AssetPreloader {
    inner: Arc<Inner>,
}

impl AssetPreloader {
    /// Relative asset URLs resolve against `base`.
    pub fn new(
        base: Url,
        network: Arc<dyn Network>,
        connection: &ConnectionMonitor,
        formats: FormatSupport,
    ) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                base,
                loaders: Loaders::new(network, formats),
                connection: connection.subscribe(),
                state: Mutex::new(State::default()),
                progress,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub async fn preload_model(&self, url: &str, priority: Priority) -> LoadResult {
        self.preload(url, AssetKind::Model, priority).await
    }

    pub async fn preload_texture(&self, url: &str, priority: Priority) -> LoadResult {
        self.preload(url, AssetKind::Texture, priority).await
    }

    /// `base` is the directory holding the decoder files.
    pub async fn preload_draco(&self, base: &str) -> LoadResult {
        self.preload(base, AssetKind::Draco, Priority::High).await
    }

    pub async fn preload_generic(&self, url: &str, priority: Priority) -> LoadResult {
        self.preload(url, AssetKind::Generic, priority).await
    }

    pub async fn preload(&self, url: &str, kind: AssetKind, priority: Priority) -> LoadResult {
        let load = self.enqueue(url, kind, priority);
        self.drain();
        load.await
    }

    /// Queue a whole batch before dispatching, so priorities apply across
    /// it. Results come back in input order.
    pub async fn preload_all(&self, requests: &[PreloadRequest]) -> Vec<LoadResult> {
        let loads: Vec<_> = requests
            .iter()
            .map(|request| self.enqueue(&request.url, request.kind, request.priority))
            .collect();
        self.drain();
        future::join_all(loads).await
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.resolve(url).is_ok_and(|key| {
            mutex_lock(&self.inner.state, SOURCE, "is_cached")
                .cache
                .contains_key(&key)
        })
    }

    pub fn cached(&self, url: &str) -> Option<Asset> {
        let key = self.resolve(url).ok()?;
        mutex_lock(&self.inner.state, SOURCE, "cached")
            .cache
            .get(&key)
            .cloned()
    }

    /// Last recorded failure for `url`.
    pub fn error(&self, url: &str) -> Option<PreloadError> {
        let key = self.resolve(url).ok()?;
        mutex_lock(&self.inner.state, SOURCE, "error")
            .errors
            .get(&key)
            .cloned()
    }

    /// Forget loaded assets and recorded failures so they can load again.
    pub fn clear_cache(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "clear_cache");
        state.cache.clear();
        state.errors.clear();
        state.queue.forget_loaded();
    }

    pub fn progress(&self) -> PreloadProgress {
        mutex_lock(&self.inner.state, SOURCE, "progress").progress()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadProgress> {
        self.inner.progress.subscribe()
    }

    pub fn watch_progress(&self) -> ProgressWatcher {
        ProgressWatcher::new(self.subscribe(), self.progress())
    }

    /// Preload hints for queued critical and high priority items.
    pub fn preload_links(&self) -> Vec<PreloadLink> {
        mutex_lock(&self.inner.state, SOURCE, "preload_links")
            .queue
            .queued_at_least(Priority::High)
            .iter()
            .map(|item| PreloadLink::preload(&item.url, item.kind))
            .collect()
    }

    /// Preconnect hints for the distinct origins among `urls`.
    pub fn warmup_connection<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Vec<PreloadLink> {
        let resolved: Vec<String> = urls
            .into_iter()
            .filter_map(|url| self.resolve(url).ok())
            .collect();
        preconnect_links(resolved.iter().map(String::as_str))
    }

    /// Wait until every dispatched load has settled.
    pub async fn settle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    fn resolve(&self, url: &str) -> Result<String, PreloadError> {
        self.inner
            .base
            .join(url)
            .map(String::from)
            .map_err(|_| PreloadError::InvalidUrl(url.to_string()))
    }

    /// Register interest in `url` and return the future of its load.
    fn enqueue(
        &self,
        url: &str,
        kind: AssetKind,
        priority: Priority,
    ) -> BoxFuture<'static, LoadResult> {
        let key = match self.resolve(url) {
            Ok(key) => key,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let mut state = mutex_lock(&self.inner.state, SOURCE, "enqueue");
        if let Some(asset) = state.cache.get(&key) {
            return future::ready(Ok(asset.clone())).boxed();
        }
        if let Some(shared) = state.inflight.get(&key) {
            debug!(url = %key, "joining in-flight load");
            return shared.clone().boxed();
        }

        let (sender, receiver) = oneshot::channel();
        let dropped = key.clone();
        let shared = receiver
            .map(move |result| result.unwrap_or_else(|_| Err(PreloadError::Dropped(dropped))))
            .boxed()
            .shared();
        state.queue.push(key.clone(), kind, priority);
        state.senders.insert(key.clone(), sender);
        state.inflight.insert(key, shared.clone());
        shared.boxed()
    }

    /// Start queued loads while loading slots are free.
    fn drain(&self) {
        loop {
            let max_concurrent = self.inner.connection.borrow().max_concurrent();
            let (item, sender) = {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "drain");
                let Some(item) = state.queue.next(max_concurrent) else {
                    return;
                };
                let sender = state.senders.remove(&item.url);
                (item, sender)
            };

            let preloader = self.clone();
            self.inner.tasks.spawn(async move {
                preloader.run(item, sender).await;
            });
        }
    }

    #[instrument(skip_all, fields(url = %item.url, kind = %item.kind, priority = ?item.priority))]
    async fn run(&self, item: queue::QueuedItem, sender: Option<oneshot::Sender<LoadResult>>) {
        let started = Instant::now();
        let result = match Url::parse(&item.url) {
            Ok(url) => self.inner.loaders.load(&url, item.kind).await,
            Err(_) => Err(PreloadError::InvalidUrl(item.url.clone())),
        };
        let elapsed = started.elapsed();

        histogram!(METRIC_PRELOAD_LOAD_MS, "kind" => item.kind.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
        let progress = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "run");
            state.queue.complete(&item.url, result.is_ok());
            state.inflight.remove(&item.url);
            state.timer.record(elapsed);
            match &result {
                Ok(asset) => {
                    state.errors.remove(&item.url);
                    state.cache.insert(item.url.clone(), asset.clone());
                }
                Err(err) => {
                    state.errors.insert(item.url.clone(), err.clone());
                }
            }
            state.progress()
        };

        if let Err(err) = &result {
            counter!(METRIC_PRELOAD_FAILED, "kind" => item.kind.as_str()).increment(1);
            warn!(error = %err, "preload failed");
        } else {
            debug!(?elapsed, "preloaded");
        }
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        let _ = self.inner.progress.send(progress);

        self.drain();
    }
}
