use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock source in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub last_write_ms: u64,
}

impl FreshnessRecord {
    pub fn at(now_ms: u64) -> Self {
        Self {
            last_write_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    pub staleness_interval: Duration,
    pub touch_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub stale: bool,
    /// Set on a fresh record older than the touch interval. Only acted on
    /// when the cache actually hits.
    pub touch: bool,
}

impl FreshnessPolicy {
    /// A missing record counts as written at epoch 0 and is therefore stale.
    pub fn decide(&self, record: Option<FreshnessRecord>, now_ms: u64, force_refresh: bool) -> Decision {
        let last = record.map(|r| r.last_write_ms).unwrap_or(0);
        let age = now_ms.saturating_sub(last);
        let stale = force_refresh || age > self.staleness_interval.as_millis() as u64;
        let touch = !stale && age > self.touch_interval.as_millis() as u64;
        Decision { stale, touch }
    }
}
