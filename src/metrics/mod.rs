use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cache::CacheStatus;
use crate::constants;
use crate::error::OriginStage;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric definition");
    let _ = registry().register(Box::new(counter.clone()));
    counter
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition");
    let _ = registry().register(Box::new(counter.clone()));
    counter
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| counter("media_edge_requests_total", "Total requests"))
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("media_edge_requests_status_total", "Requests by status", &["code"]))
}

fn cache_results_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "media_edge_cache_results_total",
            "Media responses by cache result",
            &["result"],
        )
    })
}

fn origin_calls_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "media_edge_origin_calls_total",
            "Origin calls by stage and outcome",
            &["stage", "outcome"],
        )
    })
}

fn writeback_jobs_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec(
            "media_edge_writeback_jobs_total",
            "Background cache and metadata writes",
            &["kind", "outcome"],
        )
    })
}

fn init_metrics() {
    let _ = requests_total();
    for code in ["200", "206", "400", "416", "500", "502", "504"] {
        requests_status_total().with_label_values(&[code]).inc_by(0);
    }
    for status in [CacheStatus::Hit, CacheStatus::Miss, CacheStatus::Bypass] {
        cache_results_total().with_label_values(&[status.as_str()]).inc_by(0);
    }
    for stage in [OriginStage::Resolve, OriginStage::Fetch] {
        for outcome in ["ok", "error", "timeout"] {
            origin_calls_total()
                .with_label_values(&[stage.as_str(), outcome])
                .inc_by(0);
        }
    }
    let _ = writeback_jobs_total();
}

pub fn record(status: StatusCode) {
    requests_total().inc();
    let code = status.as_u16().to_string();
    requests_status_total().with_label_values(&[code.as_str()]).inc();
}

pub fn record_cache(status: CacheStatus) {
    cache_results_total().with_label_values(&[status.as_str()]).inc();
}

pub fn record_origin(stage: OriginStage, outcome: &str) {
    origin_calls_total()
        .with_label_values(&[stage.as_str(), outcome])
        .inc();
}

pub fn record_writeback(kind: &str, outcome: &str) {
    writeback_jobs_total().with_label_values(&[kind, outcome]).inc();
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
