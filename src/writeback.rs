//! Background population of the response cache and the freshness store.
//!
//! The request path only enqueues; a single worker drains the queue. A full
//! or closed queue drops the job with a warning.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::{ByteCache, CacheEntry, CacheKey};
use crate::freshness::FreshnessRecord;
use crate::metadata::MetadataStore;
use crate::metrics;

pub enum Job {
    CachePut { key: CacheKey, entry: CacheEntry },
    Touch { id: String, record: FreshnessRecord },
    Flush(oneshot::Sender<()>),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::CachePut { .. } => "cache_put",
            Job::Touch { .. } => "touch",
            Job::Flush(_) => "flush",
        }
    }
}

#[derive(Clone)]
pub struct WriteBack {
    tx: mpsc::Sender<Job>,
}

impl WriteBack {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        cache: Arc<dyn ByteCache>,
        metadata: Arc<dyn MetadataStore>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(rx, cache, metadata));
        (Self { tx }, handle)
    }

    pub fn put_cache(&self, key: CacheKey, entry: CacheEntry) {
        self.dispatch(Job::CachePut { key, entry });
    }

    pub fn touch(&self, id: &str, record: FreshnessRecord) {
        self.dispatch(Job::Touch {
            id: id.to_string(),
            record,
        });
    }

    pub fn dispatch(&self, job: Job) {
        let kind = job.kind();
        if let Err(err) = self.tx.try_send(job) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            metrics::record_writeback(kind, "dropped");
            log::warn!("writeback {kind} dropped: {reason}");
        }
    }

    /// Resolves once every job queued before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    cache: Arc<dyn ByteCache>,
    metadata: Arc<dyn MetadataStore>,
) {
    while let Some(job) = rx.recv().await {
        let kind = job.kind();
        let result = match job {
            Job::CachePut { key, entry } => {
                let size = entry.size();
                cache
                    .put(key.clone(), entry)
                    .await
                    .map(|_| log::debug!("cached {key} ({size} bytes)"))
            }
            Job::Touch { id, record } => metadata
                .put(&id, record)
                .await
                .map(|_| log::debug!("freshness of {id} set to {}", record.last_write_ms)),
            Job::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        match result {
            Ok(()) => metrics::record_writeback(kind, "ok"),
            Err(err) => {
                metrics::record_writeback(kind, "error");
                log::warn!("writeback {kind} failed: {err:#}");
            }
        }
    }
    log::debug!("writeback worker stopped");
}
