//! The four caching strategies plus the two poem variants.
//!
//! Every strategy answers with *something*: a network response, a cached
//! copy, or a synthesised offline document. Cache writes never fail a
//! request; a rejected write is logged and the network response is served
//! uncached. The edge is shared by every visitor, so only complete responses
//! carrying nothing per-user are stored (see [`cacheable`]).

use std::sync::Arc;

use axum::http::{StatusCode, header};
use metrics::counter;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::net::{FetchRequest, FetchResponse, Network};

use super::pages::{OfflineKind, offline_response};
use super::partition::{CacheVersion, PartitionKind};
use super::storage::{CacheStorage, Partition};

const METRIC_CACHE_HIT: &str = "amanakshar_cache_hit_total";
const METRIC_CACHE_MISS: &str = "amanakshar_cache_miss_total";
const METRIC_CACHE_WRITE_ERROR: &str = "amanakshar_cache_write_error_total";
const METRIC_OFFLINE_FALLBACK: &str = "amanakshar_offline_fallback_total";

pub(crate) struct Strategies {
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    version: CacheVersion,
    revalidations: TaskTracker,
}

impl Strategies {
    pub(crate) fn new(
        storage: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        version: CacheVersion,
    ) -> Self {
        Self {
            storage,
            network,
            version,
            revalidations: TaskTracker::new(),
        }
    }

    pub(crate) fn partition(&self, kind: PartitionKind) -> Arc<Partition> {
        self.storage.open(&self.version.partition_name(kind))
    }

    #[instrument(skip_all, fields(url = %request.url, partition = %kind))]
    pub(crate) async fn cache_first(
        &self,
        request: &FetchRequest,
        kind: PartitionKind,
    ) -> FetchResponse {
        let partition = self.partition(kind);
        if let Some(cached) = lookup(&partition, request, kind) {
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                store(&partition, request, &response, kind);
                response
            }
            Err(err) => {
                debug!(error = %err, "network unavailable and nothing cached");
                offline(OfflineKind::Page)
            }
        }
    }

    /// Network first; the cache answers when the network fails or the
    /// origin reports a 5xx and a cached copy exists.
    #[instrument(skip_all, fields(url = %request.url, partition = %kind))]
    pub(crate) async fn network_first(
        &self,
        request: &FetchRequest,
        kind: PartitionKind,
        fallback: OfflineKind,
    ) -> FetchResponse {
        let partition = self.partition(kind);
        match self.network.fetch(request).await {
            Ok(response) if response.ok() => {
                store(&partition, request, &response, kind);
                response
            }
            Ok(response) if response.status.is_server_error() => {
                match lookup(&partition, request, kind) {
                    Some(cached) => {
                        debug!(status = %response.status, "origin error, serving cached copy");
                        cached
                    }
                    None => response,
                }
            }
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "network failed, trying cache");
                lookup(&partition, request, kind).unwrap_or_else(|| offline(fallback))
            }
        }
    }

    /// Serve the cached copy immediately and refresh it in the background.
    #[instrument(skip_all, fields(url = %request.url, partition = %kind))]
    pub(crate) async fn stale_while_revalidate(
        &self,
        request: &FetchRequest,
        kind: PartitionKind,
    ) -> FetchResponse {
        let partition = self.partition(kind);
        if let Some(cached) = lookup(&partition, request, kind) {
            let network = Arc::clone(&self.network);
            let request = request.clone();
            self.revalidations.spawn(async move {
                match network.fetch(&request).await {
                    Ok(fresh) if fresh.ok() => store(&partition, &request, &fresh, kind),
                    Ok(fresh) => {
                        debug!(url = %request.url, status = %fresh.status, "revalidation skipped")
                    }
                    Err(err) => debug!(url = %request.url, error = %err, "revalidation failed"),
                }
            });
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                store(&partition, request, &response, kind);
                response
            }
            Err(err) => {
                debug!(error = %err, "network unavailable and nothing cached");
                offline(OfflineKind::Page)
            }
        }
    }

    pub(crate) async fn poem(&self, request: &FetchRequest) -> FetchResponse {
        self.network_first(request, PartitionKind::Poems, OfflineKind::Poem)
            .await
    }

    pub(crate) async fn poem_api(&self, request: &FetchRequest) -> FetchResponse {
        self.network_first(request, PartitionKind::Poems, OfflineKind::PoemApi)
            .await
    }

    /// Wait for every background revalidation started so far.
    pub(crate) async fn settle(&self) {
        self.revalidations.close();
        self.revalidations.wait().await;
        self.revalidations.reopen();
    }
}

fn lookup(
    partition: &Partition,
    request: &FetchRequest,
    kind: PartitionKind,
) -> Option<FetchResponse> {
    let cached = partition.match_url(&request.url);
    if cached.is_some() {
        counter!(METRIC_CACHE_HIT, "partition" => kind.as_str()).increment(1);
    } else {
        counter!(METRIC_CACHE_MISS, "partition" => kind.as_str()).increment(1);
    }
    cached
}

/// Whether `response` may be stored and replayed to other visitors.
///
/// Partial content and answers to ranged requests are never stored, nor are
/// responses that set cookies or opt out with `private` or `no-store`.
pub(crate) fn cacheable(request: &FetchRequest, response: &FetchResponse) -> bool {
    response.ok()
        && response.status != StatusCode::PARTIAL_CONTENT
        && !request.headers.contains_key(header::RANGE)
        && !response.headers.contains_key(header::SET_COOKIE)
        && !response
            .headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|directive| directive.split('=').next().unwrap_or_default().trim())
            .any(|directive| {
                matches!(directive.to_ascii_lowercase().as_str(), "no-store" | "private")
            })
}

pub(crate) fn store(
    partition: &Partition,
    request: &FetchRequest,
    response: &FetchResponse,
    kind: PartitionKind,
) {
    if !cacheable(request, response) {
        debug!(url = %request.url, status = %response.status, "response not cacheable");
        return;
    }
    if let Err(err) = partition.put(request, response.clone()) {
        counter!(METRIC_CACHE_WRITE_ERROR, "partition" => kind.as_str()).increment(1);
        warn!(url = %request.url, error = %err, "cache write failed, serving uncached");
    }
}

fn offline(kind: OfflineKind) -> FetchResponse {
    counter!(METRIC_OFFLINE_FALLBACK, "kind" => kind.as_str()).increment(1);
    offline_response(kind)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use axum::http::HeaderValue;
    use url::Url;

    use super::*;
    use crate::net::testing::{Reply, ScriptedNetwork};

    const PAGE: &str = "https://amanakshar.in/pustakein";

    fn strategies(network: Arc<ScriptedNetwork>, quota: usize) -> Strategies {
        let quota = NonZeroUsize::new(quota).expect("quota");
        Strategies::new(
            Arc::new(CacheStorage::new(quota)),
            network,
            CacheVersion::new("v2"),
        )
    }

    fn request(url: &str) -> FetchRequest {
        FetchRequest::get(Url::parse(url).expect("url"))
    }

    #[tokio::test]
    async fn cache_first_serves_cached_entry_when_offline() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set_offline(true);
        let strategies = strategies(Arc::clone(&network), 10);
        let req = request("https://amanakshar.in/icons/icon-192.svg");
        strategies
            .partition(PartitionKind::Static)
            .put(&req, FetchResponse::new(StatusCode::OK, "<svg/>"))
            .expect("seed");

        let response = strategies.cache_first(&req, PartitionKind::Static).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "<svg/>");
        assert_eq!(network.calls_to(req.url.as_str()), 0);
    }

    #[tokio::test]
    async fn ranged_answers_are_served_but_never_stored() {
        let image = "https://amanakshar.in/images/cover.jpg";
        let network = Arc::new(ScriptedNetwork::new());
        network.once(image, Reply::status(StatusCode::PARTIAL_CONTENT, "par"));
        network.once(image, Reply::status(StatusCode::OK, "full image"));
        let strategies = strategies(Arc::clone(&network), 10);
        let ranged =
            request(image).with_header(header::RANGE, HeaderValue::from_static("bytes=0-2"));

        let partial = strategies.cache_first(&ranged, PartitionKind::Static).await;
        assert_eq!(partial.status, StatusCode::PARTIAL_CONTENT);
        assert!(strategies.partition(PartitionKind::Static).is_empty());

        let full = strategies.cache_first(&request(image), PartitionKind::Static).await;
        assert_eq!(full.status, StatusCode::OK);
        assert_eq!(full.text(), "full image");
        let cached = strategies.cache_first(&request(image), PartitionKind::Static).await;
        assert_eq!(cached.text(), "full image");
        assert_eq!(network.calls_to(image), 2);
    }

    #[test]
    fn per_user_responses_are_not_cacheable() {
        let get = request(PAGE);
        let ok = || FetchResponse::new(StatusCode::OK, "page");
        let with = |name, value| ok().with_header(name, HeaderValue::from_static(value));

        assert!(cacheable(&get, &ok()));
        assert!(cacheable(&get, &with(header::CACHE_CONTROL, "public, max-age=60")));
        assert!(cacheable(&get, &with(header::CACHE_CONTROL, "no-cache")));
        assert!(!cacheable(&get, &with(header::SET_COOKIE, "session=user-a")));
        assert!(!cacheable(&get, &with(header::CACHE_CONTROL, "max-age=0, Private")));
        assert!(!cacheable(&get, &with(header::CACHE_CONTROL, "no-store")));
        assert!(!cacheable(&get, &FetchResponse::new(StatusCode::PARTIAL_CONTENT, "p")));
        assert!(!cacheable(&get, &FetchResponse::new(StatusCode::NOT_FOUND, "missing")));
    }

    #[tokio::test]
    async fn cache_first_stores_only_successful_responses() {
        let network = Arc::new(ScriptedNetwork::new());
        network.once(PAGE, Reply::status(StatusCode::NOT_FOUND, "missing"));
        network.once(PAGE, Reply::status(StatusCode::OK, "found"));
        let strategies = strategies(Arc::clone(&network), 10);
        let req = request(PAGE);

        let first = strategies.cache_first(&req, PartitionKind::Static).await;
        assert_eq!(first.status, StatusCode::NOT_FOUND);
        assert!(strategies.partition(PartitionKind::Static).is_empty());

        let second = strategies.cache_first(&req, PartitionKind::Static).await;
        assert_eq!(second.text(), "found");
        assert_eq!(strategies.partition(PartitionKind::Static).len(), 1);
    }

    #[tokio::test]
    async fn cache_first_without_cache_or_network_is_offline_page() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set_offline(true);
        let strategies = strategies(network, 10);

        let response = strategies
            .cache_first(&request(PAGE), PartitionKind::Static)
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.text().contains("आप ऑफ़लाइन हैं"));
    }

    #[tokio::test]
    async fn network_first_prefers_fresh_response() {
        let network = Arc::new(ScriptedNetwork::new());
        network.always(PAGE, Reply::status(StatusCode::OK, "fresh"));
        let strategies = strategies(network, 10);
        let req = request(PAGE);
        strategies
            .partition(PartitionKind::Dynamic)
            .put(&req, FetchResponse::new(StatusCode::OK, "stale"))
            .expect("seed");

        let response = strategies
            .network_first(&req, PartitionKind::Dynamic, OfflineKind::Page)
            .await;
        assert_eq!(response.text(), "fresh");
        let cached = strategies
            .partition(PartitionKind::Dynamic)
            .match_url(&req.url)
            .expect("refreshed");
        assert_eq!(cached.text(), "fresh");
    }

    #[tokio::test]
    async fn network_first_serves_cache_on_origin_5xx() {
        let network = Arc::new(ScriptedNetwork::new());
        network.always(PAGE, Reply::status(StatusCode::BAD_GATEWAY, "down"));
        let strategies = strategies(network, 10);
        let req = request(PAGE);

        let uncached = strategies
            .network_first(&req, PartitionKind::Dynamic, OfflineKind::Page)
            .await;
        assert_eq!(uncached.status, StatusCode::BAD_GATEWAY);

        strategies
            .partition(PartitionKind::Dynamic)
            .put(&req, FetchResponse::new(StatusCode::OK, "saved"))
            .expect("seed");
        let cached = strategies
            .network_first(&req, PartitionKind::Dynamic, OfflineKind::Page)
            .await;
        assert_eq!(cached.text(), "saved");
    }

    #[tokio::test]
    async fn network_first_passes_client_errors_through() {
        let network = Arc::new(ScriptedNetwork::new());
        network.always(PAGE, Reply::status(StatusCode::NOT_FOUND, "nope"));
        let strategies = strategies(network, 10);
        let req = request(PAGE);
        strategies
            .partition(PartitionKind::Dynamic)
            .put(&req, FetchResponse::new(StatusCode::OK, "saved"))
            .expect("seed");

        let response = strategies
            .network_first(&req, PartitionKind::Dynamic, OfflineKind::Page)
            .await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quota_errors_still_serve_the_network_response() {
        let network = Arc::new(ScriptedNetwork::new());
        network.always(PAGE, Reply::status(StatusCode::OK, "fresh"));
        let strategies = strategies(network, 1);
        let partition = strategies.partition(PartitionKind::Dynamic);
        partition
            .put(
                &request("https://amanakshar.in/other"),
                FetchResponse::new(StatusCode::OK, "filler"),
            )
            .expect("fill quota");

        let response = strategies
            .network_first(&request(PAGE), PartitionKind::Dynamic, OfflineKind::Page)
            .await;
        assert_eq!(response.text(), "fresh");
        assert_eq!(partition.len(), 1);
    }

    #[tokio::test]
    async fn poem_strategy_uses_poem_offline_page() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set_offline(true);
        let strategies = strategies(network, 10);

        let response = strategies
            .poem(&request("https://amanakshar.in/kavita/barish"))
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.text().contains("href=\"/kavita\""));
    }

    #[tokio::test]
    async fn poem_api_strategy_answers_json_when_offline() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set_offline(true);
        let strategies = strategies(network, 10);

        let response = strategies
            .poem_api(&request("https://amanakshar.in/api/poems/featured"))
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text(), r#"{"error":"Offline"}"#);
    }

    #[tokio::test]
    async fn stale_while_revalidate_returns_stale_then_fresh() {
        let network = Arc::new(ScriptedNetwork::new());
        network.once(PAGE, Reply::status(StatusCode::OK, "v1"));
        network.always(PAGE, Reply::status(StatusCode::OK, "v2"));
        let strategies = strategies(Arc::clone(&network), 10);
        let req = request(PAGE);

        let first = strategies
            .stale_while_revalidate(&req, PartitionKind::Dynamic)
            .await;
        assert_eq!(first.text(), "v1");

        let second = strategies
            .stale_while_revalidate(&req, PartitionKind::Dynamic)
            .await;
        assert_eq!(second.text(), "v1");

        strategies.settle().await;
        let third = strategies
            .stale_while_revalidate(&req, PartitionKind::Dynamic)
            .await;
        assert_eq!(third.text(), "v2");
        strategies.settle().await;
        assert_eq!(network.calls_to(PAGE), 3);
    }
}
