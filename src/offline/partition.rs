//! Cache partition names.
//!
//! Every partition name embeds the running cache version. Bumping the version
//! is the only way stale partitions get swept (see `CacheController::on_activate`).

use std::fmt;

/// Prefix shared by every partition this edge owns.
pub const PARTITION_PREFIX: &str = "amanakshar-";

pub const DEFAULT_CACHE_VERSION: &str = "v1.3.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    /// Precached pages, icons, fonts and other immutable assets.
    Static,
    /// Pages and responses cached as they are visited.
    Dynamic,
    /// Poem pages and poem API reads.
    Poems,
    /// three.js chunks and Draco decoder files.
    Three,
    /// glTF/GLB models.
    Models,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 5] = [
        PartitionKind::Static,
        PartitionKind::Dynamic,
        PartitionKind::Poems,
        PartitionKind::Three,
        PartitionKind::Models,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionKind::Static => "static",
            PartitionKind::Dynamic => "dynamic",
            PartitionKind::Poems => "poems",
            PartitionKind::Three => "three",
            PartitionKind::Models => "models",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version tag embedded in partition names, e.g. `v1.3.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn partition_name(&self, kind: PartitionKind) -> String {
        format!("{PARTITION_PREFIX}{kind}-{}", self.0)
    }

    /// Names of the five partitions that are current for this version.
    pub fn current_names(&self) -> Vec<String> {
        PartitionKind::ALL
            .iter()
            .map(|kind| self.partition_name(*kind))
            .collect()
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_VERSION)
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
