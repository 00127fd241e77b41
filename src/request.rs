use http::header::{HOST, RANGE};
use http::request::Parts;
use http::{Method, Uri};

use crate::cache::CacheKey;
use crate::constants;
use crate::error::ProxyError;

/// What the handler needs from an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub file_id: String,
    pub force_refresh: bool,
    pub range: Option<String>,
    pub cache_key: CacheKey,
}

impl MediaRequest {
    pub fn from_parts(parts: &Parts) -> Result<Self, ProxyError> {
        if parts.method != Method::GET {
            return Err(ProxyError::MethodNotAllowed(parts.method.to_string()));
        }
        let query = parse_query(parts.uri.query());
        let file_id = query
            .file_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProxyError::BadRequest(format!("missing {} query parameter", constants::QUERY_FILE_ID)))?;
        let host = request_host(parts).unwrap_or_else(|| constants::DEFAULT_CACHE_AUTHORITY.to_string());
        let scheme = parts.uri.scheme_str().unwrap_or("http");
        let cache_key = CacheKey::canonical(scheme, &host, parts.uri.path(), &file_id);
        let range = parts
            .headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok(Self {
            file_id,
            force_refresh: query.force_refresh,
            range,
            cache_key,
        })
    }
}

#[derive(Debug, Default)]
struct Query {
    file_id: Option<String>,
    force_refresh: bool,
}

fn parse_query(raw: Option<&str>) -> Query {
    let mut query = Query::default();
    let Some(raw) = raw else { return query };
    for (key, val) in url::form_urlencoded::parse(raw.as_bytes()) {
        if key == constants::QUERY_FILE_ID {
            if query.file_id.is_none() {
                query.file_id = Some(val.into_owned());
            }
        } else if constants::QUERY_FORCE_REFRESH.contains(&key.as_ref()) {
            query.force_refresh |= !matches!(val.as_ref(), "0" | "false");
        }
    }
    query
}

pub fn request_host(parts: &Parts) -> Option<String> {
    host_of(&parts.uri).or_else(|| {
        parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    })
}

fn host_of(uri: &Uri) -> Option<String> {
    uri.authority().map(|a| a.as_str().to_string())
}
