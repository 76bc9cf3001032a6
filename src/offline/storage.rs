//! In-process equivalent of the browser Cache Storage API.
//!
//! A [`CacheStorage`] holds named [`Partition`]s; each partition keeps one
//! entry per request URL plus any requests queued for replay. Writes to a
//! single entry are atomic with respect to readers because every partition
//! sits behind its own lock.
//!
//! Partitions are bounded. A write past the quota evicts the least recently
//! used response; queued requests are never evicted, so a partition only
//! refuses writes once queued requests alone fill it.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use dashmap::DashMap;
use futures::future::try_join_all;
use lru::LruCache;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::net::{FetchRequest, FetchResponse, Network, NetworkError};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "offline::storage";

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("cache partition `{partition}` is full ({limit} entries)")]
    QuotaExceeded { partition: String, limit: usize },
}

/// Failure of [`Partition::add_all`]; nothing is stored when it is returned.
#[derive(Debug, Error)]
pub enum AddAllError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("precache request for {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Url(String),
    Queued(Uuid),
}

impl EntryKey {
    fn of(url: &Url) -> Self {
        Self::Url(url.to_string())
    }

    fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    request: FetchRequest,
    response: FetchResponse,
    stored_at: OffsetDateTime,
}

impl CacheEntry {
    fn new(request: FetchRequest, response: FetchResponse) -> Self {
        Self {
            request,
            response,
            stored_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A request held in a partition until it is replayed.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub request: FetchRequest,
    pub queued_at: OffsetDateTime,
}

/// One named cache.
pub struct Partition {
    name: String,
    quota: NonZeroUsize,
    entries: RwLock<LruCache<EntryKey, CacheEntry>>,
}

impl Partition {
    fn new(name: String, quota: NonZeroUsize) -> Self {
        Self {
            name,
            quota,
            entries: RwLock::new(LruCache::unbounded()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the response stored for `url`, marking it recently used.
    pub fn match_url(&self, url: &Url) -> Option<FetchResponse> {
        rw_write(&self.entries, SOURCE, "match_url")
            .get(&EntryKey::of(url))
            .map(|entry| entry.response.clone())
    }

    /// Store `response` under the request URL, replacing any previous entry.
    pub fn put(&self, request: &FetchRequest, response: FetchResponse) -> Result<(), StorageError> {
        let key = EntryKey::of(&request.url);
        let mut entries = rw_write(&self.entries, SOURCE, "put");
        if !entries.contains(&key) {
            self.make_room(&mut entries, 1)?;
        }
        entries.put(key, CacheEntry::new(request.clone(), response));
        Ok(())
    }

    /// Hold `request` for replay under a key of its own, so queuing the same
    /// URL twice keeps both requests.
    pub fn queue(
        &self,
        request: &FetchRequest,
        response: FetchResponse,
    ) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        let mut entries = rw_write(&self.entries, SOURCE, "queue");
        self.make_room(&mut entries, 1)?;
        entries.put(EntryKey::Queued(id), CacheEntry::new(request.clone(), response));
        Ok(id)
    }

    /// Queued requests, oldest first.
    pub fn queued(&self) -> Vec<QueuedRequest> {
        rw_read(&self.entries, SOURCE, "queued")
            .iter()
            .rev()
            .filter_map(|(key, entry)| match key {
                EntryKey::Queued(id) => Some(QueuedRequest {
                    id: *id,
                    request: entry.request.clone(),
                    queued_at: entry.stored_at,
                }),
                EntryKey::Url(_) => None,
            })
            .collect()
    }

    pub fn remove_queued(&self, id: Uuid) -> bool {
        rw_write(&self.entries, SOURCE, "remove_queued")
            .pop(&EntryKey::Queued(id))
            .is_some()
    }

    pub fn delete(&self, url: &Url) -> bool {
        rw_write(&self.entries, SOURCE, "delete")
            .pop(&EntryKey::of(url))
            .is_some()
    }

    /// Stored and queued requests, least recently used first.
    pub fn keys(&self) -> Vec<FetchRequest> {
        rw_read(&self.entries, SOURCE, "keys")
            .iter()
            .rev()
            .map(|(_, entry)| entry.request.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch every URL and store the results, all or nothing.
    pub async fn add_all(&self, network: &dyn Network, urls: &[Url]) -> Result<usize, AddAllError> {
        let fetches = urls.iter().map(|url| async move {
            let request = FetchRequest::get(url.clone());
            let response = network.fetch(&request).await?;
            if !response.ok() {
                return Err(AddAllError::Status {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            Ok::<_, AddAllError>((request, response))
        });
        let fetched = try_join_all(fetches).await?;

        let mut entries = rw_write(&self.entries, SOURCE, "add_all");
        let queued = queued_len(&entries);
        if queued + fetched.len() > self.quota.get() {
            return Err(self.quota_exceeded().into());
        }

        let stored = fetched.len();
        for (request, response) in fetched {
            let key = EntryKey::of(&request.url);
            if !entries.contains(&key) {
                self.make_room(&mut entries, 1)?;
            }
            entries.put(key, CacheEntry::new(request, response));
        }
        Ok(stored)
    }

    /// Evict least recently used responses until `needed` new entries fit.
    fn make_room(
        &self,
        entries: &mut LruCache<EntryKey, CacheEntry>,
        needed: usize,
    ) -> Result<(), StorageError> {
        let limit = self.quota.get();
        if queued_len(entries) + needed > limit {
            return Err(self.quota_exceeded());
        }
        while entries.len() + needed > limit {
            let victim = entries
                .iter()
                .rev()
                .map(|(key, _)| key)
                .find(|key| !key.is_queued())
                .cloned();
            let Some(victim) = victim else {
                return Err(self.quota_exceeded());
            };
            if let Some(evicted) = entries.pop(&victim) {
                debug!(partition = %self.name, url = %evicted.request.url, "evicted");
            }
        }
        Ok(())
    }

    fn quota_exceeded(&self) -> StorageError {
        StorageError::QuotaExceeded {
            partition: self.name.clone(),
            limit: self.quota.get(),
        }
    }
}

fn queued_len(entries: &LruCache<EntryKey, CacheEntry>) -> usize {
    entries.iter().filter(|(key, _)| key.is_queued()).count()
}

/// The set of named partitions.
pub struct CacheStorage {
    partitions: DashMap<String, Arc<Partition>>,
    quota: NonZeroUsize,
}

impl CacheStorage {
    /// `quota` bounds the number of entries each partition may hold.
    pub fn new(quota: NonZeroUsize) -> Self {
        Self {
            partitions: DashMap::new(),
            quota,
        }
    }

    /// Open the named partition, creating it when missing.
    pub fn open(&self, name: &str) -> Arc<Partition> {
        self.partitions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Partition::new(name.to_string(), self.quota)))
            .clone()
    }

    /// The named partition, without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Partition>> {
        self.partitions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn delete(&self, name: &str) -> bool {
        self.partitions.remove(name).is_some()
    }

    /// Names of every partition, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}
