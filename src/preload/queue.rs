//! Preload queue bookkeeping.
//!
//! A pure state machine: no I/O, no async, no locking. The preloader owns
//! it behind a mutex and performs the loads it hands out.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Model,
    Texture,
    Draco,
    Generic,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Texture => "texture",
            Self::Draco => "draco",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority; higher weights are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn weight(self) -> u8 {
        self as u8
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub url: String,
    pub kind: AssetKind,
    pub priority: Priority,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct PreloadQueue {
    queued: Vec<QueuedItem>,
    loading: HashSet<String>,
    loaded: HashSet<String>,
    next_seq: u64,
}

impl PreloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `url` unless it is already queued or loading.
    pub fn push(&mut self, url: impl Into<String>, kind: AssetKind, priority: Priority) -> bool {
        let url = url.into();
        if self.is_pending(&url) {
            return false;
        }
        self.queued.push(QueuedItem {
            url,
            kind,
            priority,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    pub fn is_pending(&self, url: &str) -> bool {
        self.loading.contains(url) || self.queued.iter().any(|item| item.url == url)
    }

    /// Hand out the highest-priority item if a loading slot is free.
    /// Equal priorities leave in insertion order.
    pub fn next(&mut self, max_concurrent: usize) -> Option<QueuedItem> {
        if self.loading.len() >= max_concurrent {
            return None;
        }
        let index = self
            .queued
            .iter()
            .enumerate()
            .max_by_key(|(_, item)| (item.priority, Reverse(item.seq)))
            .map(|(index, _)| index)?;
        let item = self.queued.remove(index);
        self.loading.insert(item.url.clone());
        Some(item)
    }

    /// Record that a load handed out by [`next`](Self::next) settled.
    pub fn complete(&mut self, url: &str, success: bool) {
        self.loading.remove(url);
        if success {
            self.loaded.insert(url.to_string());
        }
    }

    pub fn forget_loaded(&mut self) {
        self.loaded.clear();
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn loading_len(&self) -> usize {
        self.loading.len()
    }

    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    /// Queued items at `min` priority or above, in dispatch order.
    pub fn queued_at_least(&self, min: Priority) -> Vec<QueuedItem> {
        let mut items: Vec<_> = self
            .queued
            .iter()
            .filter(|item| item.priority >= min)
            .cloned()
            .collect();
        items.sort_by_key(|item| (Reverse(item.priority), item.seq));
        items
    }
}
