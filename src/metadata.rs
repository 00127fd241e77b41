use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::{self, BoxFuture, FutureExt};
use sled::Db;

use crate::freshness::{Clock, FreshnessRecord};

/// Key-value store of [`FreshnessRecord`]s keyed by media identifier.
///
/// `put` never moves a record backwards: writing an older timestamp than
/// the stored one leaves the stored one in place. Records expire after the
/// store's configured expiry and then read as absent.
pub trait MetadataStore: Send + Sync {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<FreshnessRecord>>>;
    fn put<'a>(&'a self, id: &'a str, record: FreshnessRecord) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy)]
struct Stored {
    last_write_ms: u64,
    expires_at_ms: u64,
}

impl Stored {
    fn merge(old: Option<Stored>, record: FreshnessRecord, expiry: Duration) -> Stored {
        let last_write_ms = old
            .map(|s| s.last_write_ms.max(record.last_write_ms))
            .unwrap_or(record.last_write_ms);
        Stored {
            last_write_ms,
            expires_at_ms: last_write_ms.saturating_add(expiry.as_millis() as u64),
        }
    }

    fn live(self, now_ms: u64) -> Option<FreshnessRecord> {
        if now_ms >= self.expires_at_ms {
            return None;
        }
        Some(FreshnessRecord::at(self.last_write_ms))
    }

    fn encode(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.last_write_ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.expires_at_ms.to_be_bytes());
        buf
    }

    fn decode(raw: &[u8]) -> Option<Stored> {
        if raw.len() != 16 {
            return None;
        }
        let mut last = [0u8; 8];
        let mut exp = [0u8; 8];
        last.copy_from_slice(&raw[..8]);
        exp.copy_from_slice(&raw[8..]);
        Some(Stored {
            last_write_ms: u64::from_be_bytes(last),
            expires_at_ms: u64::from_be_bytes(exp),
        })
    }
}

pub struct MemoryMetadataStore {
    records: Mutex<HashMap<String, Stored>>,
    expiry: Duration,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryMetadataStore {
    pub fn new(expiry: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            expiry,
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `put` calls received, including ones that did not move
    /// the timestamp.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &str) -> Result<Option<FreshnessRecord>> {
        let map = self.records.lock().map_err(|_| anyhow!("metadata store poisoned"))?;
        Ok(map.get(id).and_then(|s| s.live(self.clock.now_ms())))
    }

    fn store(&self, id: &str, record: FreshnessRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut map = self.records.lock().map_err(|_| anyhow!("metadata store poisoned"))?;
        let now = self.clock.now_ms();
        let old = map.get(id).copied().filter(|s| now < s.expires_at_ms);
        map.insert(id.to_string(), Stored::merge(old, record, self.expiry));
        Ok(())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<FreshnessRecord>>> {
        future::ready(self.lookup(id)).boxed()
    }

    fn put<'a>(&'a self, id: &'a str, record: FreshnessRecord) -> BoxFuture<'a, Result<()>> {
        future::ready(self.store(id, record)).boxed()
    }
}

/// Persistent store on sled. Values are `last_write_ms` and `expires_at_ms`
/// as big-endian u64s.
pub struct SledMetadataStore {
    db: Db,
    expiry: Duration,
    clock: Arc<dyn Clock>,
}

impl SledMetadataStore {
    pub fn open(path: &Path, expiry: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("open metadata db {}", path.display()))?;
        Ok(Self { db, expiry, clock })
    }

    fn key(id: &str) -> Vec<u8> {
        format!("fr/{id}").into_bytes()
    }

    fn lookup(&self, id: &str) -> Result<Option<FreshnessRecord>> {
        let Some(raw) = self.db.get(Self::key(id))? else {
            return Ok(None);
        };
        let stored = Stored::decode(&raw).ok_or_else(|| anyhow!("corrupt freshness record for {id}"))?;
        Ok(stored.live(self.clock.now_ms()))
    }

    fn store(&self, id: &str, record: FreshnessRecord) -> Result<()> {
        let now = self.clock.now_ms();
        let expiry = self.expiry;
        self.db.fetch_and_update(Self::key(id), |old| {
            let old = old
                .and_then(Stored::decode)
                .filter(|s| now < s.expires_at_ms);
            Some(Stored::merge(old, record, expiry).encode().to_vec())
        })?;
        Ok(())
    }

    /// Drops expired records. Returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for item in self.db.scan_prefix(b"fr/") {
            let (key, val) = item?;
            let expired = Stored::decode(&val).map(|s| now >= s.expires_at_ms).unwrap_or(true);
            if expired {
                self.db.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl MetadataStore for SledMetadataStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<FreshnessRecord>>> {
        future::ready(self.lookup(id)).boxed()
    }

    fn put<'a>(&'a self, id: &'a str, record: FreshnessRecord) -> BoxFuture<'a, Result<()>> {
        future::ready(self.store(id, record)).boxed()
    }
}
