use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use http::header::USER_AGENT;
use http::{HeaderMap, HeaderValue, Method, Response, Uri};
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config;
use crate::response::{BoxError, ProxyBody};
use crate::runtime;

/// Pooled HTTP(S) client for origin calls, optionally capping concurrent
/// requests per origin host.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    max_conns_per_host: Option<usize>,
    host_limits: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    user_agent: HeaderValue,
}

impl UpstreamClient {
    pub fn new(cfg: &config::Origin) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(err) => {
                log::warn!("no native tls roots ({err}); https origins will fail verification");
                HttpsConnectorBuilder::new().with_tls_config(empty_roots_tls_config()?)
            }
        };
        let https = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let mut builder = Client::builder(TokioExecutor::new());
        if cfg.max_idle_conns_per_host > 0 {
            builder.pool_max_idle_per_host(cfg.max_idle_conns_per_host);
        }
        let client = builder.build(https);
        let max_conns_per_host = if cfg.max_connections_per_server > 0 {
            Some(cfg.max_connections_per_server)
        } else {
            None
        };
        let user_agent = HeaderValue::from_str(&runtime::server_token())
            .unwrap_or_else(|_| HeaderValue::from_static("media-edge"));
        Ok(Self {
            client,
            max_conns_per_host,
            host_limits: Arc::new(Mutex::new(HashMap::new())),
            user_agent,
        })
    }

    /// Sends a bodiless request and returns the response with its body still
    /// streaming. The per-host permit is held until the body is dropped.
    pub async fn send(&self, method: Method, uri: Uri, headers: HeaderMap) -> Result<Response<ProxyBody>> {
        let permit = self.acquire_host_limit(&uri).await?;
        let mut req = http::Request::builder().method(method).uri(uri);
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        if !headers.contains_key(USER_AGENT) {
            req = req.header(USER_AGENT, self.user_agent.clone());
        }
        let req = req.body(Empty::new()).context("build upstream request")?;
        let resp = self.client.request(req).await.context("upstream request")?;
        Ok(resp.map(|body| hold_permit(body, permit)))
    }

    async fn acquire_host_limit(&self, uri: &Uri) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limit) = self.max_conns_per_host else { return Ok(None) };
        let Some(authority) = uri.authority() else { return Ok(None) };
        let key = authority.as_str().to_string();
        let sem = {
            let mut map = self.host_limits.lock().map_err(|_| anyhow!("host limits poisoned"))?;
            map.entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone()
        };
        let permit = sem.acquire_owned().await.context("host limit closed")?;
        Ok(Some(permit))
    }
}

fn hold_permit(body: Incoming, permit: Option<OwnedSemaphorePermit>) -> ProxyBody {
    body.map_frame(move |frame| {
        let _held = &permit;
        frame
    })
    .map_err(|err| Box::new(err) as BoxError)
    .boxed()
}

fn empty_roots_tls_config() -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls versions")?
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    Ok(config)
}

pub async fn collect_body(body: ProxyBody) -> Result<Bytes> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("read upstream body: {err}"))?;
    Ok(collected.to_bytes())
}

/// Outcome of reading an origin body under a size cap.
pub enum Capped {
    Complete(Bytes),
    /// The cap was crossed. The body replays the bytes already read and then
    /// continues with the unread remainder.
    Overflow(ProxyBody),
}

/// Buffers `body` until it ends or holds more than `limit` bytes, whichever
/// comes first. At most one frame past `limit` is ever held in memory.
pub async fn collect_capped(mut body: ProxyBody, limit: u64) -> Result<Capped> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| anyhow!("read upstream body: {err}"))?;
        let Ok(data) = frame.into_data() else { continue };
        buf.extend_from_slice(&data);
        if buf.len() as u64 > limit {
            let head = stream::once(futures::future::ready(Ok::<_, BoxError>(Frame::data(buf.freeze()))));
            let replay = StreamBody::new(head.chain(BodyStream::new(body)));
            return Ok(Capped::Overflow(BodyExt::boxed(replay)));
        }
    }
    Ok(Capped::Complete(buf.freeze()))
}
