use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http::header::{CONTENT_LENGTH, RANGE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use serde::Deserialize;

use crate::config;
use crate::error::{OriginStage, ProxyError};
use crate::response::ProxyBody;
use crate::upstream::{collect_body, UpstreamClient};

/// Where the origin keeps the bytes of one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    /// Size reported by the metadata call, when the origin provides one.
    pub size: Option<u64>,
}

pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

impl OriginResponse {
    pub fn declared_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Two-step origin file store: identifier to location, location to bytes.
///
/// `fetch` returns whatever status the origin answered with; judging it is
/// left to the caller. Both calls report transport failures as
/// [`ProxyError::Origin`] without a status.
pub trait Origin: Send + Sync {
    fn resolve<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<Location, ProxyError>>;
    fn fetch<'a>(
        &'a self,
        location: &'a Location,
        range: Option<HeaderValue>,
    ) -> BoxFuture<'a, Result<OriginResponse, ProxyError>>;
}

#[derive(Debug, Deserialize)]
struct ResolveReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<FileInfo>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

/// Origin speaking the bot-API file protocol: `GET {api_base}/getFile?file_id=..`
/// answers `{"ok":true,"result":{"file_path":..,"file_size":..}}`, and the bytes
/// live at `{file_base}/{file_path}`.
pub struct HttpOrigin {
    client: UpstreamClient,
    api_base: String,
    file_base: String,
}

impl HttpOrigin {
    pub fn new(cfg: &config::Origin) -> anyhow::Result<Self> {
        Ok(Self::with_client(UpstreamClient::new(cfg)?, &cfg.api_base, &cfg.file_base))
    }

    pub fn with_client(client: UpstreamClient, api_base: &str, file_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            file_base: file_base.trim_end_matches('/').to_string(),
        }
    }

    fn resolve_uri(&self, file_id: &str) -> Result<Uri, ProxyError> {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("file_id", file_id)
            .finish();
        let raw = format!("{}/getFile?{}", self.api_base, query);
        raw.parse()
            .map_err(|err| ProxyError::Internal(format!("bad resolve uri {raw}: {err}")))
    }

    fn file_uri(&self, location: &Location) -> Result<Uri, ProxyError> {
        let raw = format!("{}/{}", self.file_base, location.path.trim_start_matches('/'));
        raw.parse()
            .map_err(|err| ProxyError::Internal(format!("bad file uri {raw}: {err}")))
    }

    async fn do_resolve(&self, file_id: &str) -> Result<Location, ProxyError> {
        let uri = self.resolve_uri(file_id)?;
        let resp = self
            .client
            .send(Method::GET, uri, HeaderMap::new())
            .await
            .map_err(|err| ProxyError::origin(OriginStage::Resolve, None, format!("{err:#}")))?;
        let status = resp.status();
        let body = collect_body(resp.into_body())
            .await
            .map_err(|err| ProxyError::origin(OriginStage::Resolve, Some(status), format!("{err:#}")))?;
        parse_resolve_reply(status, &body)
    }

    async fn do_fetch(&self, location: &Location, range: Option<HeaderValue>) -> Result<OriginResponse, ProxyError> {
        let uri = self.file_uri(location)?;
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(RANGE, range);
        }
        let resp = self
            .client
            .send(Method::GET, uri, headers)
            .await
            .map_err(|err| ProxyError::origin(OriginStage::Fetch, None, format!("{err:#}")))?;
        let (parts, body) = resp.into_parts();
        Ok(OriginResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl Origin for HttpOrigin {
    fn resolve<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<Location, ProxyError>> {
        self.do_resolve(file_id).boxed()
    }

    fn fetch<'a>(
        &'a self,
        location: &'a Location,
        range: Option<HeaderValue>,
    ) -> BoxFuture<'a, Result<OriginResponse, ProxyError>> {
        self.do_fetch(location, range).boxed()
    }
}

fn parse_resolve_reply(status: StatusCode, body: &Bytes) -> Result<Location, ProxyError> {
    let reply: ResolveReply = match serde_json::from_slice(body) {
        Ok(reply) => reply,
        Err(err) if status.is_success() => {
            return Err(ProxyError::origin(
                OriginStage::Resolve,
                Some(status),
                format!("invalid metadata reply: {err}"),
            ));
        }
        Err(_) => {
            return Err(ProxyError::origin(OriginStage::Resolve, Some(status), snippet(body)));
        }
    };
    if !status.is_success() || !reply.ok {
        let code = reply
            .error_code
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(status);
        let detail = reply
            .description
            .unwrap_or_else(|| "origin rejected metadata request".to_string());
        return Err(ProxyError::origin(OriginStage::Resolve, Some(code), detail));
    }
    let info = reply.result.ok_or_else(|| {
        ProxyError::origin(OriginStage::Resolve, Some(status), "metadata reply has no result")
    })?;
    let path = info
        .file_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProxyError::origin(OriginStage::Resolve, Some(status), "metadata reply has no file_path"))?;
    Ok(Location {
        path,
        size: info.file_size,
    })
}

fn snippet(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(200).collect()
}
