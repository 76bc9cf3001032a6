//! Offline cache configuration.
//!
//! Controls the partition version, per-partition quota and the install-time
//! precache manifests via `amanakshar.toml`.

use std::num::NonZeroUsize;

use super::partition::{CacheVersion, DEFAULT_CACHE_VERSION};

const DEFAULT_PARTITION_QUOTA: usize = 2000;

/// Pages, icons and textures every visitor needs offline.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/kavita",
    "/manifest.json",
    "/icons/icon-72.svg",
    "/icons/icon-192.svg",
    "/icons/icon-512.svg",
    "/textures/paper.webp",
    "/textures/ink.webp",
];

/// Decoder files the 3D scenes cannot start without.
pub const DEFAULT_THREE_ASSETS: &[&str] = &[
    "/draco/draco_decoder.wasm",
    "/draco/draco_wasm_wrapper.js",
];

/// The one model shown on the landing page.
pub const DEFAULT_MODEL_ASSETS: &[&str] = &["/models/quill.glb"];

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Version stamped into every partition name.
    pub version: CacheVersion,
    /// Maximum entries per partition.
    pub partition_quota: usize,
    /// Static manifest; a failure here fails installation.
    pub static_assets: Vec<String>,
    /// Optional three-chunk manifest.
    pub three_assets: Vec<String>,
    /// Optional model manifest.
    pub model_assets: Vec<String>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            version: CacheVersion::new(DEFAULT_CACHE_VERSION),
            partition_quota: DEFAULT_PARTITION_QUOTA,
            static_assets: owned(DEFAULT_STATIC_ASSETS),
            three_assets: owned(DEFAULT_THREE_ASSETS),
            model_assets: owned(DEFAULT_MODEL_ASSETS),
        }
    }
}

impl From<&crate::config::CacheSettings> for OfflineConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            version: CacheVersion::new(settings.version.clone()),
            partition_quota: settings.partition_quota,
            static_assets: settings.static_assets.clone(),
            three_assets: settings.three_assets.clone(),
            model_assets: settings.model_assets.clone(),
        }
    }
}

impl OfflineConfig {
    /// Returns the partition quota as NonZeroUsize, clamping to 1 if zero.
    pub fn partition_quota_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.partition_quota).unwrap_or(NonZeroUsize::MIN)
    }
}

fn owned(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|path| (*path).to_string()).collect()
}
