use std::{process, sync::Arc, time::Duration};

use amanakshar::{
    application::error::AppError,
    config::{self, FetchArgs, PreloadArgs, Settings},
    fetch::{ApiClient, RetryOptions, error_message},
    infra::{
        error::InfraError,
        http::{self, EdgeState},
        telemetry,
    },
    net::{HttpNetwork, Network},
    offline::{CacheController, OfflineConfig, SYNC_LIKES_TAG, UPDATE_POEMS_TAG},
    preload::{
        AssetKind, AssetPreloader, ConnectionMonitor, ConnectionSpeed, FormatSupport,
        PreloadRequest,
    },
};
use axum::http::Method;
use futures::future::join_all;
use serde_json::Value;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Preload(args) => run_preload(settings, args).await,
        config::Command::Fetch(args) => run_fetch(settings, args).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let origin = settings.origin.require()?.clone();
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new().map_err(InfraError::from)?);
    let controller = Arc::new(CacheController::new(
        origin.clone(),
        OfflineConfig::from(&settings.cache),
        Arc::clone(&network),
    ));

    match controller.on_install().await {
        Ok(report) => info!(
            static_cached = report.static_cached,
            three_cached = ?report.three_cached,
            models_cached = ?report.models_cached,
            "install complete"
        ),
        Err(err) if settings.cache.strict_install => return Err(err.into()),
        Err(err) => warn!(error = %err, "static precache failed; serving without it"),
    }
    controller.on_activate();

    let shutdown = CancellationToken::new();
    let timers = spawn_sync_timers(&controller, &settings.sync, &shutdown);

    let state = EdgeState::new(
        Arc::clone(&controller),
        network,
        settings.server.max_body_bytes.get(),
    );
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, origin = %origin, "edge listening");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            server_shutdown.cancel();
        });

    let result = server
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    shutdown.cancel();
    let drain = async {
        join_all(timers).await;
        controller.settle().await;
    };
    if tokio::time::timeout(settings.server.graceful_shutdown, drain)
        .await
        .is_err()
    {
        warn!("background work did not finish before the shutdown timeout");
    }

    result
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown signal received");
}

/// Fire `sync-likes` and `update-poems` on their configured cadence.
fn spawn_sync_timers(
    controller: &Arc<CacheController>,
    sync: &config::SyncSettings,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let likes = {
        let controller = Arc::clone(controller);
        spawn_interval(sync.likes_interval, shutdown.clone(), move || {
            let controller = Arc::clone(&controller);
            async move {
                controller.on_sync(SYNC_LIKES_TAG).await;
            }
        })
    };

    let poems = {
        let controller = Arc::clone(controller);
        spawn_interval(sync.poems_interval, shutdown.clone(), move || {
            let controller = Arc::clone(&controller);
            async move {
                if let Err(err) = controller.on_periodic_sync(UPDATE_POEMS_TAG).await {
                    warn!(error = %err, "featured poems refresh failed");
                }
            }
        })
    };

    vec![likes, poems]
}

fn spawn_interval<F, Fut>(
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip the first immediate tick
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

async fn run_preload(settings: Settings, args: PreloadArgs) -> Result<(), AppError> {
    let base = settings.origin.require()?.clone();
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new().map_err(InfraError::from)?);

    let speed = args
        .connection
        .as_deref()
        .map(ConnectionSpeed::from_effective_type)
        .unwrap_or(settings.preload.connection);
    let monitor = ConnectionMonitor::new(speed);
    let formats = FormatSupport::from_accept(
        args.accept
            .as_deref()
            .unwrap_or(settings.preload.accept.as_str()),
    );
    let preloader = AssetPreloader::new(base, network, &monitor, formats);

    let requests = preload_requests(&args);
    if requests.is_empty() {
        return Err(AppError::validation(
            "nothing to preload; pass --model, --texture, --draco or --generic",
        ));
    }
    info!(
        assets = requests.len(),
        connection = speed.as_str(),
        "preloading"
    );

    let mut watcher = preloader.watch_progress();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = watcher.changed().await {
            info!(
                loaded = progress.loaded,
                total = progress.total,
                percentage = progress.percentage,
                eta_ms = progress.estimated_time_remaining.as_millis() as u64,
                "preload progress"
            );
            if progress.is_complete() {
                break;
            }
        }
    });

    for link in preloader.preload_links() {
        info!(link = %link, "preload hint");
    }

    let results = preloader.preload_all(&requests).await;
    preloader.settle().await;
    reporter.abort();

    let mut failed = 0usize;
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(asset) => info!(
                url = %request.url,
                kind = %asset.kind(),
                bytes = asset.size(),
                "preloaded"
            ),
            Err(err) => {
                failed += 1;
                warn!(url = %request.url, error = %err, "preload failed");
            }
        }
    }

    if failed > 0 {
        return Err(AppError::unexpected(format!(
            "{failed} of {} assets failed to preload",
            requests.len()
        )));
    }
    Ok(())
}

fn preload_requests(args: &PreloadArgs) -> Vec<PreloadRequest> {
    let priority = args.priority;
    let models = args
        .models
        .iter()
        .map(|url| PreloadRequest::new(url.as_str(), AssetKind::Model, priority));
    let textures = args
        .textures
        .iter()
        .map(|url| PreloadRequest::new(url.as_str(), AssetKind::Texture, priority));
    let draco = args
        .draco
        .iter()
        .map(|url| PreloadRequest::new(url.as_str(), AssetKind::Draco, priority));
    let generic = args
        .generic
        .iter()
        .map(|url| PreloadRequest::new(url.as_str(), AssetKind::Generic, priority));

    models.chain(textures).chain(draco).chain(generic).collect()
}

async fn run_fetch(settings: Settings, args: FetchArgs) -> Result<(), AppError> {
    let origin = settings.origin.require()?.clone();
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new().map_err(InfraError::from)?);
    let options = RetryOptions::from(&settings.fetch)
        .with_on_retry(|attempt, err| warn!(attempt, error = %err, "retrying request"));
    let client = ApiClient::new(origin, network).with_options(options);

    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|err| AppError::validation(format!("invalid method `{}`: {err}", args.method)))?;
    let body = args
        .data
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|err| AppError::validation(format!("--data is not valid JSON: {err}")))?;

    let request = client.request(method, &args.path, body.as_ref())?;
    let idempotent = matches!(request.method, Method::GET | Method::HEAD | Method::OPTIONS);
    let outcome = if idempotent {
        client.send::<Value>(&request, &CancellationToken::new()).await
    } else {
        client.send_once::<Value>(&request).await
    };
    match outcome {
        Ok(value) => {
            let rendered = serde_json::to_string_pretty(&value)
                .map_err(|err| AppError::unexpected(err.to_string()))?;
            println!("{rendered}");
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", error_message(&err));
            Err(err.into())
        }
    }
}
