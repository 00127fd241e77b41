//! Media request handling: freshness decision, cache lookup, origin fetch
//! and range slicing.
//!
//! Cache and freshness writes go through [`WriteBack`] and are never awaited
//! on the request path. Concurrent misses for one identifier each go to the
//! origin; there is no request coalescing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::{HeaderValue, Response, StatusCode};

use crate::cache::{ByteCache, CacheEntry, CacheStatus};
use crate::config;
use crate::error::{OriginStage, ProxyError};
use crate::freshness::{Clock, FreshnessPolicy, FreshnessRecord};
use crate::http_range::parse_content_range;
use crate::logging;
use crate::metadata::MetadataStore;
use crate::metrics;
use crate::origin::{Location, Origin, OriginResponse};
use crate::request::MediaRequest;
use crate::response::{
    error_response, force_media_headers, response_with_headers, set_cache_status, strip_hop_headers,
    MediaHeaders, ProxyBody,
};
use crate::upstream::{collect_capped, Capped};
use crate::writeback::WriteBack;

#[derive(Debug, Clone)]
pub struct Policy {
    pub freshness: FreshnessPolicy,
    pub fetch_timeout: Duration,
    pub max_cacheable_size: u64,
    pub headers: MediaHeaders,
}

impl Policy {
    pub fn from_config(cfg: &config::Bootstrap) -> Self {
        Self {
            freshness: FreshnessPolicy {
                staleness_interval: cfg.cache.staleness_interval,
                touch_interval: cfg.cache.touch_interval,
            },
            fetch_timeout: cfg.origin.fetch_timeout,
            max_cacheable_size: cfg.cache.max_cacheable_size,
            headers: MediaHeaders::new(cfg.cache.staleness_interval, &cfg.cache.default_content_type),
        }
    }
}

pub struct MediaHandler {
    cache: Arc<dyn ByteCache>,
    metadata: Arc<dyn MetadataStore>,
    origin: Arc<dyn Origin>,
    writeback: WriteBack,
    clock: Arc<dyn Clock>,
    policy: Policy,
}

impl MediaHandler {
    pub fn new(
        cache: Arc<dyn ByteCache>,
        metadata: Arc<dyn MetadataStore>,
        origin: Arc<dyn Origin>,
        writeback: WriteBack,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            metadata,
            origin,
            writeback,
            clock,
            policy,
        })
    }

    pub fn writeback(&self) -> &WriteBack {
        &self.writeback
    }

    /// Serves one inbound request. Never fails: every error becomes a
    /// response.
    ///
    /// The work runs on its own task so an origin fetch outlives a client
    /// that hung up and still populates the cache. A panic in that task is
    /// reported as a 500.
    pub async fn handle(self: &Arc<Self>, parts: &Parts) -> Response<ProxyBody> {
        let req = match MediaRequest::from_parts(parts) {
            Ok(req) => req,
            Err(err) => {
                log::debug!("rejecting {} {}: {err}", parts.method, parts.uri);
                return error_response(&err);
            }
        };
        let this = Arc::clone(self);
        let request_id = logging::current_request_id();
        let task = tokio::spawn(async move {
            match request_id {
                Some(request_id) => logging::with_request_id(request_id, this.serve(&req)).await,
                None => this.serve(&req).await,
            }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(ProxyError::Internal(panic_message(err.into_panic()))),
            Err(err) => Err(ProxyError::Internal(format!("request task failed: {err}"))),
        };
        match result {
            Ok(resp) => resp,
            Err(err) => {
                match &err {
                    ProxyError::Internal(_) => log::error!("{} {}: {err}", parts.method, parts.uri),
                    _ => log::warn!("{} {}: {err}", parts.method, parts.uri),
                }
                error_response(&err)
            }
        }
    }

    pub async fn serve(&self, req: &MediaRequest) -> Result<Response<ProxyBody>, ProxyError> {
        let now = self.clock.now_ms();
        let record = match self.metadata.get(&req.file_id).await {
            Ok(record) => record,
            Err(err) => {
                log::warn!("freshness lookup for {} failed, treating as stale: {err:#}", req.file_id);
                None
            }
        };
        let decision = self.policy.freshness.decide(record, now, req.force_refresh);

        if !decision.stale {
            match self.cache.get(&req.cache_key).await {
                Ok(Some(entry)) => {
                    if decision.touch {
                        self.writeback.touch(&req.file_id, FreshnessRecord::at(now));
                    }
                    metrics::record_cache(CacheStatus::Hit);
                    let mut resp = self.policy.headers.serve(&entry, req.range.as_deref());
                    set_cache_status(&mut resp, CacheStatus::Hit);
                    return Ok(resp);
                }
                Ok(None) => log::debug!("{} fresh but not cached, refetching", req.cache_key),
                Err(err) => log::warn!("cache lookup {} failed: {err:#}", req.cache_key),
            }
        } else if req.force_refresh {
            log::debug!("{} refresh forced by caller", req.file_id);
        }

        self.fetch_from_origin(req, now).await
    }

    async fn fetch_from_origin(&self, req: &MediaRequest, now: u64) -> Result<Response<ProxyBody>, ProxyError> {
        let max = self.policy.max_cacheable_size;
        let location = self
            .timed(OriginStage::Resolve, self.origin.resolve(&req.file_id))
            .await?;

        // Files known to fit are pulled whole so they can be cached. For the
        // rest the client's range goes to the origin and its reply decides.
        let forward_range = if location.size.is_some_and(|size| size <= max) {
            None
        } else {
            req.range.as_deref().and_then(|r| HeaderValue::from_str(r).ok())
        };
        let mut upstream = self.fetch_file(&location, forward_range).await?;

        if upstream.status == StatusCode::PARTIAL_CONTENT {
            if let Some(total) = declared_size(&upstream).filter(|total| *total <= max) {
                log::debug!("{} is {total} bytes, fetching it whole to cache it", req.file_id);
                upstream = self.fetch_file(&location, None).await?;
            }
        }

        let declared = declared_size(&upstream).or(location.size);
        if upstream.status == StatusCode::PARTIAL_CONTENT || declared.is_some_and(|size| size > max) {
            log::info!(
                "{} is {} bytes, over the {max} byte cache limit; streaming without caching",
                req.file_id,
                declared.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string()),
            );
            return Ok(self.passthrough(upstream));
        }

        let OriginResponse { status, headers, body } = upstream;
        let collected = match tokio::time::timeout(self.policy.fetch_timeout, collect_capped(body, max)).await {
            Ok(Ok(collected)) => collected,
            Ok(Err(err)) => {
                metrics::record_origin(OriginStage::Fetch, "error");
                return Err(ProxyError::origin(OriginStage::Fetch, None, format!("{err:#}")));
            }
            Err(_) => {
                metrics::record_origin(OriginStage::Fetch, "timeout");
                return Err(ProxyError::OriginTimeout {
                    stage: OriginStage::Fetch,
                    after: self.policy.fetch_timeout,
                });
            }
        };
        let body = match collected {
            Capped::Complete(body) => body,
            Capped::Overflow(body) => {
                log::warn!(
                    "{} passed {max} bytes without a declared length; streaming without caching",
                    req.file_id
                );
                return Ok(self.passthrough(OriginResponse { status, headers, body }));
            }
        };

        let entry = CacheEntry::new(StatusCode::OK, self.policy.headers.canonical(&headers), body);
        self.writeback.put_cache(req.cache_key.clone(), entry.clone());
        self.writeback.touch(&req.file_id, FreshnessRecord::at(now));
        metrics::record_cache(CacheStatus::Miss);
        let mut resp = self.policy.headers.serve(&entry, req.range.as_deref());
        set_cache_status(&mut resp, CacheStatus::Miss);
        Ok(resp)
    }

    /// Content fetch that only yields a 2xx reply.
    async fn fetch_file(&self, location: &Location, range: Option<HeaderValue>) -> Result<OriginResponse, ProxyError> {
        let upstream = self
            .timed(OriginStage::Fetch, self.origin.fetch(location, range))
            .await?;
        if !upstream.status.is_success() {
            metrics::record_origin(OriginStage::Fetch, "error");
            return Err(ProxyError::origin(
                OriginStage::Fetch,
                Some(upstream.status),
                format!("origin refused {}", location.path),
            ));
        }
        Ok(upstream)
    }

    /// Streams an origin response straight to the client, keeping the
    /// origin's status (206 when a forwarded range was honoured).
    fn passthrough(&self, upstream: OriginResponse) -> Response<ProxyBody> {
        let mut headers = strip_hop_headers(upstream.headers);
        force_media_headers(&mut headers);
        if !headers.contains_key(CONTENT_TYPE) {
            let content_type = self.policy.headers.content_type(&headers);
            headers.insert(CONTENT_TYPE, content_type);
        }
        metrics::record_cache(CacheStatus::Bypass);
        let mut resp = response_with_headers(upstream.status, headers, upstream.body);
        set_cache_status(&mut resp, CacheStatus::Bypass);
        resp
    }

    async fn timed<T>(
        &self,
        stage: OriginStage,
        call: impl Future<Output = Result<T, ProxyError>>,
    ) -> Result<T, ProxyError> {
        match tokio::time::timeout(self.policy.fetch_timeout, call).await {
            Ok(Ok(value)) => {
                metrics::record_origin(stage, "ok");
                Ok(value)
            }
            Ok(Err(err)) => {
                metrics::record_origin(stage, "error");
                Err(err)
            }
            Err(_) => {
                metrics::record_origin(stage, "timeout");
                Err(ProxyError::OriginTimeout {
                    stage,
                    after: self.policy.fetch_timeout,
                })
            }
        }
    }
}

/// Full size of the origin object: the total from Content-Range on a 206,
/// Content-Length otherwise.
fn declared_size(upstream: &OriginResponse) -> Option<u64> {
    if upstream.status == StatusCode::PARTIAL_CONTENT {
        return upstream
            .headers
            .get(http::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .map(|cr| cr.size);
    }
    upstream.declared_length()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("handler panicked: {msg}");
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("handler panicked: {msg}");
    }
    "handler panicked".to_string()
}
