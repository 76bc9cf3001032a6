//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use axum::http::StatusCode;
use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::offline::config::{DEFAULT_MODEL_ASSETS, DEFAULT_STATIC_ASSETS, DEFAULT_THREE_ASSETS};
use crate::offline::partition::DEFAULT_CACHE_VERSION;
use crate::preload::{ConnectionSpeed, Priority};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "amanakshar";
const ENV_PREFIX: &str = "AMANAKSHAR";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_PARTITION_QUOTA: usize = 2000;
const DEFAULT_FETCH_RETRIES: u32 = 3;
const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FETCH_RETRY_ON: [u16; 6] = [408, 429, 500, 502, 503, 504];
const DEFAULT_PRELOAD_ACCEPT: &str = "image/avif,image/webp,*/*";
const DEFAULT_SYNC_LIKES_INTERVAL_SECS: u64 = 60;
const DEFAULT_SYNC_POEMS_INTERVAL_SECS: u64 = 3600;

/// Command-line arguments for the Amanakshar binary.
#[derive(Debug, Parser)]
#[command(
    name = "amanakshar",
    version,
    about = "Offline edge for the Amanakshar poetry site"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "AMANAKSHAR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the offline edge in front of the site origin.
    Serve(Box<ServeArgs>),
    /// Preload assets with priority scheduling and report progress.
    Preload(PreloadArgs),
    /// Call a JSON endpoint of the origin with retries.
    Fetch(FetchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the site origin the edge fronts.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the cache version stamped into partition names.
    #[arg(long = "cache-version", value_name = "VERSION")]
    pub cache_version: Option<String>,

    /// Abort startup when the static precache fails.
    #[arg(
        long = "cache-strict-install",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_strict_install: Option<bool>,

    /// Override the interval between `sync-likes` runs.
    #[arg(long = "sync-likes-interval-seconds", value_name = "SECONDS")]
    pub sync_likes_interval_seconds: Option<u64>,

    /// Override the interval between `update-poems` runs.
    #[arg(long = "sync-poems-interval-seconds", value_name = "SECONDS")]
    pub sync_poems_interval_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct PreloadArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Base URL relative asset paths resolve against.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// 3D model to preload; repeatable.
    #[arg(long = "model", value_name = "URL")]
    pub models: Vec<String>,

    /// Texture to preload; repeatable.
    #[arg(long = "texture", value_name = "URL")]
    pub textures: Vec<String>,

    /// Directory holding the Draco decoder files.
    #[arg(long = "draco", value_name = "URL")]
    pub draco: Option<String>,

    /// Any other asset; repeatable.
    #[arg(long = "generic", value_name = "URL")]
    pub generic: Vec<String>,

    /// Priority for every asset in this run.
    #[arg(long, value_name = "PRIORITY", default_value = "medium")]
    pub priority: Priority,

    /// Connection speed or effective type (slow|medium|fast|2g|3g|4g).
    #[arg(long = "connection", value_name = "TYPE")]
    pub connection: Option<String>,

    /// Image formats the client accepts, as an Accept header value.
    #[arg(long = "accept", value_name = "LIST")]
    pub accept: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the site origin.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the retry count.
    #[arg(long = "fetch-retries", value_name = "COUNT")]
    pub retries: Option<u32>,

    /// Override the per-attempt timeout.
    #[arg(long = "fetch-timeout-ms", value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,

    /// HTTP method.
    #[arg(long, default_value = "GET")]
    pub method: String,

    /// JSON request body.
    #[arg(long, value_name = "JSON")]
    pub data: Option<String>,

    /// API path, relative to the origin.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub fetch: FetchSettings,
    pub preload: PreloadSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub url: Option<Url>,
}

impl OriginSettings {
    pub fn require(&self) -> Result<&Url, LoadError> {
        self.url
            .as_ref()
            .ok_or_else(|| LoadError::invalid("origin.url", "an origin URL is required"))
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub version: String,
    pub partition_quota: usize,
    pub strict_install: bool,
    pub static_assets: Vec<String>,
    pub three_assets: Vec<String>,
    pub model_assets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub retry_on: Vec<StatusCode>,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub connection: ConnectionSpeed,
    pub accept: String,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub likes_interval: Duration,
    pub poems_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Preload(args)) => raw.apply_preload_overrides(args),
        Some(Command::Fetch(args)) => raw.apply_fetch_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    fetch: RawFetchSettings,
    preload: RawPreloadSettings,
    sync: RawSyncSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_origin_override(overrides.origin_url.as_ref());

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(version) = overrides.cache_version.as_ref() {
            self.cache.version = Some(version.clone());
        }
        if let Some(strict) = overrides.cache_strict_install {
            self.cache.strict_install = Some(strict);
        }
        if let Some(seconds) = overrides.sync_likes_interval_seconds {
            self.sync.likes_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.sync_poems_interval_seconds {
            self.sync.poems_interval_seconds = Some(seconds);
        }
    }

    fn apply_preload_overrides(&mut self, args: &PreloadArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_origin_override(args.origin_url.as_ref());

        if let Some(connection) = args.connection.as_ref() {
            self.preload.connection = Some(connection.clone());
        }
        if let Some(accept) = args.accept.as_ref() {
            self.preload.accept = Some(accept.clone());
        }
    }

    fn apply_fetch_overrides(&mut self, args: &FetchArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_origin_override(args.origin_url.as_ref());

        if let Some(retries) = args.retries {
            self.fetch.retries = Some(retries);
        }
        if let Some(timeout) = args.timeout_ms {
            self.fetch.timeout_ms = Some(timeout);
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_origin_override(&mut self, url: Option<&String>) {
        if let Some(url) = url {
            self.origin.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
            fetch,
            preload,
            sync,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache)?;
        let fetch = build_fetch_settings(fetch)?;
        let preload = build_preload_settings(preload);
        let sync = build_sync_settings(sync)?;

        Ok(Self {
            server,
            logging,
            origin,
            cache,
            fetch,
            preload,
            sync,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let max_body_bytes = NonZeroUsize::new(server.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES))
        .ok_or_else(|| LoadError::invalid("server.max_body_bytes", "must be greater than zero"))?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_body_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let url = match origin.url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => {
            let url = Url::parse(value).map_err(|err| {
                LoadError::invalid("origin.url", format!("failed to parse: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "origin.url",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
    };
    Ok(OriginSettings { url })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let version = cache
        .version
        .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_string());
    let version = version.trim();
    if version.is_empty() || version.contains(char::is_whitespace) {
        return Err(LoadError::invalid(
            "cache.version",
            "must be a non-empty tag without whitespace",
        ));
    }

    let partition_quota = cache.partition_quota.unwrap_or(DEFAULT_PARTITION_QUOTA);
    if partition_quota == 0 {
        return Err(LoadError::invalid(
            "cache.partition_quota",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        version: version.to_string(),
        partition_quota,
        strict_install: cache.strict_install.unwrap_or(false),
        static_assets: manifest(cache.static_assets, DEFAULT_STATIC_ASSETS, "cache.static_assets")?,
        three_assets: manifest(cache.three_assets, DEFAULT_THREE_ASSETS, "cache.three_assets")?,
        model_assets: manifest(cache.model_assets, DEFAULT_MODEL_ASSETS, "cache.model_assets")?,
    })
}

fn build_fetch_settings(fetch: RawFetchSettings) -> Result<FetchSettings, LoadError> {
    let timeout_ms = fetch.timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "fetch.timeout_ms",
            "must be greater than zero",
        ));
    }

    let retry_on = fetch
        .retry_on
        .unwrap_or_else(|| DEFAULT_FETCH_RETRY_ON.to_vec())
        .into_iter()
        .map(|code| {
            StatusCode::from_u16(code).map_err(|_| {
                LoadError::invalid("fetch.retry_on", format!("`{code}` is not an HTTP status"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FetchSettings {
        retries: fetch.retries.unwrap_or(DEFAULT_FETCH_RETRIES),
        retry_delay: Duration::from_millis(
            fetch.retry_delay_ms.unwrap_or(DEFAULT_FETCH_RETRY_DELAY_MS),
        ),
        timeout: Duration::from_millis(timeout_ms),
        retry_on,
    })
}

fn build_preload_settings(preload: RawPreloadSettings) -> PreloadSettings {
    PreloadSettings {
        connection: preload
            .connection
            .as_deref()
            .map(ConnectionSpeed::from_effective_type)
            .unwrap_or_default(),
        accept: preload
            .accept
            .unwrap_or_else(|| DEFAULT_PRELOAD_ACCEPT.to_string()),
    }
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let likes = sync
        .likes_interval_seconds
        .unwrap_or(DEFAULT_SYNC_LIKES_INTERVAL_SECS);
    if likes == 0 {
        return Err(LoadError::invalid(
            "sync.likes_interval_seconds",
            "must be greater than zero",
        ));
    }

    let poems = sync
        .poems_interval_seconds
        .unwrap_or(DEFAULT_SYNC_POEMS_INTERVAL_SECS);
    if poems == 0 {
        return Err(LoadError::invalid(
            "sync.poems_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(SyncSettings {
        likes_interval: Duration::from_secs(likes),
        poems_interval: Duration::from_secs(poems),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    version: Option<String>,
    partition_quota: Option<usize>,
    strict_install: Option<bool>,
    static_assets: Option<Vec<String>>,
    three_assets: Option<Vec<String>>,
    model_assets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFetchSettings {
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
    retry_on: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreloadSettings {
    connection: Option<String>,
    accept: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    likes_interval_seconds: Option<u64>,
    poems_interval_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Manifest paths must be absolute site paths.
fn manifest(
    configured: Option<Vec<String>>,
    defaults: &[&str],
    key: &'static str,
) -> Result<Vec<String>, LoadError> {
    let paths = configured
        .unwrap_or_else(|| defaults.iter().map(|path| (*path).to_string()).collect());
    if let Some(bad) = paths.iter().find(|path| !path.starts_with('/')) {
        return Err(LoadError::invalid(key, format!("`{bad}` must start with `/`")));
    }
    Ok(paths)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
