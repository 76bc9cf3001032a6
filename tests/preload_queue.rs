mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use amanakshar::net::{FetchRequest, FetchResponse, Network, NetworkError};
use amanakshar::preload::{
    Asset, AssetKind, AssetPreloader, ConnectionMonitor, ConnectionSpeed, FormatSupport,
    PreloadError, PreloadRequest, Priority,
};
use async_trait::async_trait;
use axum::http::StatusCode;

use common::{FakeNetwork, PNG_1X1, Reply, origin, url};

fn preloader(
    network: Arc<dyn Network>,
    speed: ConnectionSpeed,
) -> (AssetPreloader, ConnectionMonitor) {
    let monitor = ConnectionMonitor::new(speed);
    let preloader = AssetPreloader::new(origin(), network, &monitor, FormatSupport::default());
    (preloader, monitor)
}

/// Counts how many fetches overlap.
#[derive(Default)]
struct PeakTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Network for PeakTracker {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(FetchResponse::new(StatusCode::OK, "asset"))
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_texture_requests_share_one_fetch() {
    let network = Arc::new(FakeNetwork::new());
    network.always(
        &url("/textures/paper.png"),
        Reply::after(
            Duration::from_millis(30),
            Reply::Respond(FetchResponse::new(StatusCode::OK, PNG_1X1)),
        ),
    );
    let (preloader, _monitor) = preloader(network.clone(), ConnectionSpeed::Medium);

    let (first, second) = tokio::join!(
        preloader.preload_texture("/textures/paper.png", Priority::High),
        preloader.preload_texture("/textures/paper.png", Priority::Low),
    );

    let first = first.expect("texture");
    assert_eq!(first, second.expect("texture"));
    assert_eq!(network.calls_to(&url("/textures/paper.png")), 1);
    match first {
        Asset::Texture(texture) => assert_eq!((texture.width, texture.height), (1, 1)),
        other => panic!("expected a texture, got {other:?}"),
    }

    preloader
        .preload_texture("/textures/paper.png", Priority::High)
        .await
        .expect("cached");
    assert_eq!(network.calls_to(&url("/textures/paper.png")), 1);
}

#[tokio::test(start_paused = true)]
async fn batches_dispatch_by_priority_on_a_slow_connection() {
    let network = Arc::new(FakeNetwork::new());
    for path in ["/a.bin", "/b.bin", "/c.bin"] {
        network.always(&url(path), Reply::ok(path));
    }
    let (preloader, _monitor) = preloader(network.clone(), ConnectionSpeed::Slow);

    let results = preloader
        .preload_all(&[
            PreloadRequest::new("/a.bin", AssetKind::Generic, Priority::Low),
            PreloadRequest::new("/b.bin", AssetKind::Generic, Priority::Critical),
            PreloadRequest::new("/c.bin", AssetKind::Generic, Priority::Medium),
        ])
        .await;

    assert!(results.iter().all(Result::is_ok));
    let order: Vec<String> = network.calls().into_iter().map(|(_, url)| url).collect();
    assert_eq!(order, vec![url("/b.bin"), url("/c.bin"), url("/a.bin")]);
}

#[tokio::test(start_paused = true)]
async fn loading_never_exceeds_the_connection_cap() {
    let tracker = Arc::new(PeakTracker::default());
    let (preloader, _monitor) = preloader(tracker.clone(), ConnectionSpeed::Medium);

    let requests: Vec<PreloadRequest> = (0..5)
        .map(|index| {
            PreloadRequest::new(format!("/models/{index}.glb"), AssetKind::Model, Priority::Medium)
        })
        .collect();
    let results = preloader.preload_all(&requests).await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn connection_changes_apply_on_the_next_dispatch() {
    let tracker = Arc::new(PeakTracker::default());
    let (preloader, monitor) = preloader(tracker.clone(), ConnectionSpeed::Slow);
    monitor.set(ConnectionSpeed::Fast);

    let requests: Vec<PreloadRequest> = (0..6)
        .map(|index| {
            PreloadRequest::new(format!("/{index}.bin"), AssetKind::Generic, Priority::Low)
        })
        .collect();
    preloader.preload_all(&requests).await;

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn failures_are_recorded_and_cleared() {
    let network = Arc::new(FakeNetwork::new());
    network.once(&url("/models/quill.glb"), Reply::Fail);
    network.always(&url("/models/quill.glb"), Reply::ok("glb"));
    network.always(&url("/models/pen.glb"), Reply::ok("glb"));
    let (preloader, _monitor) = preloader(network.clone(), ConnectionSpeed::Slow);

    let results = preloader
        .preload_all(&[
            PreloadRequest::new("/models/quill.glb", AssetKind::Model, Priority::Critical),
            PreloadRequest::new("/models/pen.glb", AssetKind::Model, Priority::Low),
        ])
        .await;
    assert!(matches!(results[0], Err(PreloadError::Network { .. })));
    assert!(results[1].is_ok());
    assert!(preloader.error("/models/quill.glb").is_some());
    assert!(!preloader.is_cached("/models/quill.glb"));

    // No automatic retry.
    assert_eq!(network.calls_to(&url("/models/quill.glb")), 1);

    preloader.clear_cache();
    assert!(preloader.error("/models/quill.glb").is_none());
    preloader
        .preload_model("/models/quill.glb", Priority::High)
        .await
        .expect("second attempt");
    assert!(preloader.is_cached("/models/quill.glb"));
}

#[tokio::test(start_paused = true)]
async fn progress_is_broadcast_after_every_item() {
    let network = Arc::new(FakeNetwork::new());
    for path in ["/one.bin", "/two.bin"] {
        network.always(
            &url(path),
            Reply::after(Duration::from_millis(100), Reply::ok("x")),
        );
    }
    let (preloader, _monitor) = preloader(network.clone(), ConnectionSpeed::Slow);
    let mut progress = preloader.subscribe();
    assert_eq!(preloader.progress().percentage, 100);

    preloader
        .preload_all(&[
            PreloadRequest::new("/one.bin", AssetKind::Generic, Priority::Medium),
            PreloadRequest::new("/two.bin", AssetKind::Generic, Priority::Medium),
        ])
        .await;
    preloader.settle().await;

    let first = progress.recv().await.expect("first update");
    assert_eq!((first.loaded, first.total, first.percentage), (1, 2, 50));
    assert_eq!(first.estimated_time_remaining, Duration::from_millis(100));

    let second = progress.recv().await.expect("second update");
    assert_eq!((second.loaded, second.total, second.percentage), (2, 2, 100));
    assert!(second.is_complete());
}

#[tokio::test(start_paused = true)]
async fn draco_emits_hints_without_fetching() {
    let network = Arc::new(FakeNetwork::new());
    let (preloader, _monitor) = preloader(network.clone(), ConnectionSpeed::Medium);

    let asset = preloader.preload_draco("/draco/").await.expect("draco");

    match asset {
        Asset::Draco(links) => {
            let rendered: Vec<String> = links.iter().map(ToString::to_string).collect();
            assert_eq!(rendered.len(), 2);
            assert!(rendered.iter().any(|link| link.contains("draco_decoder.wasm")));
            assert!(rendered.iter().any(|link| link.contains("draco_wasm_wrapper.js")));
        }
        other => panic!("expected draco hints, got {other:?}"),
    }
    assert!(network.calls().is_empty());
}

#[test]
fn warmup_returns_one_preconnect_per_origin() {
    let network = Arc::new(FakeNetwork::new());
    let (preloader, _monitor) = preloader(network, ConnectionSpeed::Medium);

    let links = preloader.warmup_connection([
        "https://cdn.example/a.glb",
        "https://cdn.example/b.glb",
        "/local.png",
    ]);

    assert_eq!(links.len(), 2);
    assert!(links.iter().all(|link| link.to_string().contains("preconnect")));
}
