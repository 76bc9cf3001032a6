use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "amanakshar_cache_hit_total",
            Unit::Count,
            "Total number of responses served from a cache partition."
        );
        describe_counter!(
            "amanakshar_cache_miss_total",
            Unit::Count,
            "Total number of cache partition lookups that found nothing."
        );
        describe_counter!(
            "amanakshar_cache_write_error_total",
            Unit::Count,
            "Total number of cache writes that failed and were skipped."
        );
        describe_counter!(
            "amanakshar_offline_fallback_total",
            Unit::Count,
            "Total number of offline documents served in place of the network."
        );
        describe_counter!(
            "amanakshar_fetch_retry_total",
            Unit::Count,
            "Total number of API request retries."
        );
        describe_histogram!(
            "amanakshar_preload_load_ms",
            Unit::Milliseconds,
            "Asset preload latency in milliseconds."
        );
        describe_counter!(
            "amanakshar_preload_failed_total",
            Unit::Count,
            "Total number of asset preloads that failed."
        );
    });
}
