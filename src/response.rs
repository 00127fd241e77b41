use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CACHE_CONTROL, CONNECTION, CONTENT_DISPOSITION,
    CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

use crate::cache::{CacheEntry, CacheStatus};
use crate::constants;
use crate::error::ProxyError;
use crate::http_range::{self, build_content_range, build_unsatisfied_range, RangeError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn response_with_headers(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    response_with_headers(status, headers, full(body.to_string()))
}

pub fn json_response<T: serde::Serialize>(payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
            response_with_headers(StatusCode::OK, headers, full(bytes))
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}

pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = text_response(err.status(), &err.to_string());
    force_media_headers(resp.headers_mut());
    if matches!(err, ProxyError::MethodNotAllowed(_)) {
        resp.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
    }
    resp
}

pub fn set_cache_status(resp: &mut Response<ProxyBody>, status: CacheStatus) {
    resp.headers_mut().insert(
        constants::PROTOCOL_CACHE_STATUS_KEY,
        HeaderValue::from_static(status.as_str()),
    );
}

/// Headers every media response carries, cacheable or not.
pub fn force_media_headers(headers: &mut HeaderMap) {
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_static(constants::CONTENT_DISPOSITION_INLINE),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(constants::ALLOW_ANY_ORIGIN),
    );
}

pub fn strip_hop_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in [
        CONNECTION,
        TRANSFER_ENCODING,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        http::header::TE,
        http::header::TRAILER,
        http::header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers
}

/// The header set written alongside a cacheable body.
#[derive(Debug, Clone)]
pub struct MediaHeaders {
    cache_control: HeaderValue,
    default_content_type: HeaderValue,
}

impl MediaHeaders {
    pub fn new(staleness_interval: Duration, default_content_type: &str) -> Self {
        let cache_control = HeaderValue::from_str(&format!("public, max-age={}", staleness_interval.as_secs()))
            .unwrap_or_else(|_| HeaderValue::from_static("public"));
        let default_content_type = HeaderValue::from_str(default_content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(constants::DEFAULT_CONTENT_TYPE));
        Self {
            cache_control,
            default_content_type,
        }
    }

    pub fn content_type(&self, origin: &HeaderMap) -> HeaderValue {
        origin
            .get(CONTENT_TYPE)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.default_content_type.clone())
    }

    /// Canonical headers for a materialized origin body. Content-Length is
    /// set by [`CacheEntry::new`].
    pub fn canonical(&self, origin: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, self.content_type(origin));
        headers.insert(CACHE_CONTROL, self.cache_control.clone());
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        force_media_headers(&mut headers);
        headers
    }

    /// Serves `entry`, slicing it when `range` is a satisfiable single range.
    /// A header that does not parse yields the unmodified full response.
    pub fn serve(&self, entry: &CacheEntry, range: Option<&str>) -> Response<ProxyBody> {
        let Some(requested) = range.and_then(http_range::parse_range) else {
            return response_with_headers(entry.status(), entry.headers().clone(), full(entry.body().clone()));
        };
        let total = entry.size();
        let content_type = self.content_type(entry.headers());
        match http_range::resolve(requested, total) {
            Ok(spec) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, content_type);
                headers.insert(
                    CONTENT_RANGE,
                    header_value(&build_content_range(spec.start, spec.end, total)),
                );
                headers.insert(CONTENT_LENGTH, HeaderValue::from(spec.len()));
                headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                headers.insert(CACHE_CONTROL, self.cache_control.clone());
                force_media_headers(&mut headers);
                let body = entry.body().slice(spec.start as usize..=spec.end as usize);
                response_with_headers(StatusCode::PARTIAL_CONTENT, headers, full(body))
            }
            Err(RangeError::Unsatisfiable { size }) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, content_type);
                headers.insert(CONTENT_RANGE, header_value(&build_unsatisfied_range(size)));
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                force_media_headers(&mut headers);
                response_with_headers(StatusCode::RANGE_NOT_SATISFIABLE, headers, empty())
            }
        }
    }
}

fn header_value(raw: &str) -> HeaderValue {
    // content-range values are ascii digits and punctuation
    HeaderValue::from_str(raw).unwrap_or_else(|_| HeaderValue::from_static("bytes */0"))
}
