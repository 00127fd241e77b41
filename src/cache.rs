use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::RwLock;

use crate::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Cache identity of a media request: origin, path and identifier only.
/// Control flags such as `nocache` never take part in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn canonical(scheme: &str, host: &str, path: &str, file_id: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        let id: String = url::form_urlencoded::byte_serialize(file_id.as_bytes()).collect();
        CacheKey(format!(
            "{}://{}{}?{}={}",
            scheme.to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            path,
            constants::QUERY_FILE_ID,
            id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully materialized response. Entries are never mutated; a refresh
/// writes a new entry over the old key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl CacheEntry {
    /// Content-Length is always rewritten from `body` so a stored entry
    /// cannot disagree with its own payload.
    pub fn new(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Self {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        Self { status, headers, body }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Response cache addressed by [`CacheKey`]. Implementations own their
/// eviction; callers treat every lookup as best effort.
pub trait ByteCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<CacheEntry>>>;
    fn put(&self, key: CacheKey, entry: CacheEntry) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    map: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
    bytes: u64,
}

/// In-process cache with FIFO eviction bounded by entry count and total bytes.
#[derive(Debug)]
pub struct MemoryByteCache {
    inner: RwLock<MemoryInner>,
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    puts: AtomicU64,
}

impl Default for MemoryByteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryByteCache {
    pub fn new() -> Self {
        Self::with_limits(None, None)
    }

    pub fn with_limits(max_entries: Option<usize>, max_bytes: Option<u64>) -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            max_entries: max_entries.filter(|v| *v > 0),
            max_bytes: max_bytes.filter(|v| *v > 0),
            puts: AtomicU64::new(0),
        }
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, key: CacheKey, entry: CacheEntry) {
        let mut inner = self.inner.write().await;
        let size = entry.size();
        if let Some(old) = inner.map.remove(&key) {
            inner.bytes = inner.bytes.saturating_sub(old.size());
        } else {
            inner.order.push_back(key.clone());
        }
        while self.over_limit(&inner, size) {
            let Some(oldest) = inner.order.pop_front() else { break };
            if oldest == key {
                inner.order.push_back(oldest);
                if inner.order.len() == 1 {
                    break;
                }
                continue;
            }
            if let Some(evicted) = inner.map.remove(&oldest) {
                inner.bytes = inner.bytes.saturating_sub(evicted.size());
                log::debug!("memory cache evicted {oldest}");
            }
        }
        inner.bytes += size;
        inner.map.insert(key, entry);
    }

    fn over_limit(&self, inner: &MemoryInner, incoming: u64) -> bool {
        if let Some(max) = self.max_entries {
            if inner.map.len() >= max {
                return true;
            }
        }
        if let Some(max) = self.max_bytes {
            if inner.bytes + incoming > max && !inner.map.is_empty() {
                return true;
            }
        }
        false
    }
}

impl ByteCache for MemoryByteCache {
    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        async move {
            let inner = self.inner.read().await;
            Ok(inner.map.get(key).cloned())
        }
        .boxed()
    }

    fn put(&self, key: CacheKey, entry: CacheEntry) -> BoxFuture<'_, Result<()>> {
        async move {
            self.puts.fetch_add(1, Ordering::Relaxed);
            self.insert(key, entry).await;
            Ok(())
        }
        .boxed()
    }
}
