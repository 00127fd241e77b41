#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use media_edge::cache::{ByteCache, MemoryByteCache};
use media_edge::config;
use media_edge::freshness::{Clock, FreshnessPolicy, ManualClock};
use media_edge::handler::{MediaHandler, Policy};
use media_edge::http_range;
use media_edge::metadata::{MemoryMetadataStore, MetadataStore};
use media_edge::error::ProxyError;
use media_edge::origin::{HttpOrigin, Location, Origin, OriginResponse};
use media_edge::response::{BoxError, MediaHeaders, ProxyBody};
use media_edge::server::{self, AppState};
use media_edge::writeback::WriteBack;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const DAY: Duration = Duration::from_secs(24 * 3600);
pub const HOUR: Duration = Duration::from_secs(3600);
pub const MEDIA_HOST: &str = "media.test";

/// 2024-01-01T00:00:00Z, so "epoch" records are always stale.
pub const START_MS: u64 = 1_704_067_200_000;

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.header("X-Cache")
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder().method(method).uri(path);
        if !headers.contains_key(http::header::HOST) {
            builder = builder.header(http::header::HOST, MEDIA_HOST);
        }
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Parts) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                let (parts, _) = req.into_parts();
                                let resp = handler(&parts);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn gen_bytes(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

#[derive(Clone)]
pub struct MockMedia {
    pub body: Bytes,
    pub content_type: Option<&'static str>,
    /// Report `file_size` in the metadata reply.
    pub report_size: bool,
}

impl MockMedia {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            content_type: Some("video/mp4"),
            report_size: true,
        }
    }
}

#[derive(Default)]
pub struct OriginLog {
    files: Mutex<HashMap<String, MockMedia>>,
    resolves: AtomicUsize,
    fetches: AtomicUsize,
    ranges: Mutex<Vec<Option<String>>>,
    fail_downloads: Mutex<Option<StatusCode>>,
}

/// Bot-API style origin: `/bot/getFile?file_id=..` answers metadata and
/// `/file/videos/<id>.mp4` serves bytes, honouring single ranges.
pub struct MockOrigin {
    server: MockServer,
    log: Arc<OriginLog>,
}

impl MockOrigin {
    pub async fn start() -> Self {
        let log = Arc::new(OriginLog::default());
        let state = Arc::clone(&log);
        let server = MockServer::start(move |parts| route(&state, parts)).await;
        Self { server, log }
    }

    pub fn add(&self, file_id: &str, media: MockMedia) {
        self.log.files.lock().unwrap().insert(file_id.to_string(), media);
    }

    pub fn fail_downloads(&self, status: StatusCode) {
        *self.log.fail_downloads.lock().unwrap() = Some(status);
    }

    pub fn resolves(&self) -> usize {
        self.log.resolves.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.log.fetches.load(Ordering::SeqCst)
    }

    pub fn forwarded_ranges(&self) -> Vec<Option<String>> {
        self.log.ranges.lock().unwrap().clone()
    }

    pub fn api_base(&self) -> String {
        format!("http://{}/bot", self.server.addr())
    }

    pub fn file_base(&self) -> String {
        format!("http://{}/file", self.server.addr())
    }
}

fn route(log: &OriginLog, parts: &Parts) -> Response<Full<Bytes>> {
    let path = parts.uri.path();
    if path == "/bot/getFile" {
        log.resolves.fetch_add(1, Ordering::SeqCst);
        let file_id = url::form_urlencoded::parse(parts.uri.query().unwrap_or("").as_bytes())
            .find(|(k, _)| k == "file_id")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        let files = log.files.lock().unwrap();
        let Some(media) = files.get(&file_id) else {
            return json(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"ok": false, "error_code": 400, "description": "Bad Request: invalid file_id"}),
            );
        };
        let mut result = serde_json::json!({
            "file_id": file_id,
            "file_unique_id": format!("u-{file_id}"),
            "file_path": format!("videos/{file_id}.mp4"),
        });
        if media.report_size {
            result["file_size"] = serde_json::json!(media.body.len());
        }
        return json(StatusCode::OK, serde_json::json!({"ok": true, "result": result}));
    }

    if let Some(file) = path.strip_prefix("/file/videos/") {
        log.fetches.fetch_add(1, Ordering::SeqCst);
        let range = parts
            .headers
            .get(http::header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        log.ranges.lock().unwrap().push(range.clone());
        if let Some(status) = *log.fail_downloads.lock().unwrap() {
            return plain(status, "download refused");
        }
        let file_id = file.trim_end_matches(".mp4");
        let files = log.files.lock().unwrap();
        let Some(media) = files.get(file_id) else {
            return plain(StatusCode::NOT_FOUND, "no such file");
        };
        return serve_media(media, range.as_deref());
    }

    plain(StatusCode::NOT_FOUND, "not found")
}

fn serve_media(media: &MockMedia, range: Option<&str>) -> Response<Full<Bytes>> {
    let total = media.body.len() as u64;
    let mut builder = Response::builder();
    if let Some(ct) = media.content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    builder = builder.header("X-Origin-Server", "mock-bot-api");
    let spec = range
        .and_then(http_range::parse_range)
        .and_then(|r| http_range::resolve(r, total).ok());
    if let Some(spec) = spec {
        let slice = media.body.slice(spec.start as usize..=spec.end as usize);
        return builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                http::header::CONTENT_RANGE,
                http_range::build_content_range(spec.start, spec.end, total),
            )
            .header(http::header::CONTENT_LENGTH, slice.len())
            .body(Full::new(slice))
            .unwrap();
    }
    builder
        .header(http::header::CONTENT_LENGTH, total)
        .status(StatusCode::OK).body(Full::new(media.body.clone())).unwrap()
}

fn json(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

#[derive(Clone, Copy)]
pub struct ProxyOptions {
    pub staleness_interval: Duration,
    pub touch_interval: Duration,
    pub fetch_timeout: Duration,
    pub max_cacheable_size: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            staleness_interval: 3 * DAY,
            touch_interval: HOUR,
            fetch_timeout: Duration::from_secs(5),
            max_cacheable_size: 1 << 20,
        }
    }
}

impl ProxyOptions {
    pub fn policy(&self) -> Policy {
        Policy {
            freshness: FreshnessPolicy {
                staleness_interval: self.staleness_interval,
                touch_interval: self.touch_interval,
            },
            fetch_timeout: self.fetch_timeout,
            max_cacheable_size: self.max_cacheable_size,
            headers: MediaHeaders::new(self.staleness_interval, "video/mp4"),
        }
    }
}

/// The proxy wired to in-memory stores and a manual clock, served over a
/// real socket.
pub struct Proxy {
    pub clock: Arc<ManualClock>,
    pub cache: Arc<MemoryByteCache>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub handler: Arc<MediaHandler>,
    pub client: TestClient,
    shutdown: watch::Sender<bool>,
}

impl Proxy {
    pub async fn start(origin: &MockOrigin) -> Self {
        Self::start_with(origin, ProxyOptions::default()).await
    }

    pub async fn start_with(origin: &MockOrigin, opts: ProxyOptions) -> Self {
        let cfg = config::Origin {
            api_base: origin.api_base(),
            file_base: origin.file_base(),
            fetch_timeout: opts.fetch_timeout,
            ..Default::default()
        };
        let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(&cfg).expect("origin client"));
        Self::start_with_origin(origin, opts).await
    }

    pub async fn start_with_origin(origin: Arc<dyn Origin>, opts: ProxyOptions) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let cache = Arc::new(MemoryByteCache::new());
        let metadata = Arc::new(MemoryMetadataStore::new(opts.staleness_interval, clock.clone()));
        let (writeback, _worker) = WriteBack::spawn(
            cache.clone() as Arc<dyn ByteCache>,
            metadata.clone() as Arc<dyn MetadataStore>,
            64,
        );
        let handler = MediaHandler::new(
            cache.clone(),
            metadata.clone(),
            origin,
            writeback,
            clock.clone() as Arc<dyn Clock>,
            opts.policy(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let (shutdown, rx) = watch::channel(false);
        let state = Arc::new(AppState::new(Arc::clone(&handler), &[]));
        tokio::spawn(async move {
            let _ = server::serve(listener, state, rx).await;
        });

        Self {
            clock,
            cache,
            metadata,
            handler,
            client: TestClient::new(addr),
            shutdown,
        }
    }

    pub async fn get(&self, file_id: &str, range: Option<&str>) -> TestResponse {
        self.get_path(&format!("/media?file_id={file_id}"), range).await
    }

    pub async fn get_path(&self, path: &str, range: Option<&str>) -> TestResponse {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(http::header::RANGE, HeaderValue::from_str(range).unwrap());
        }
        self.client.send(Method::GET, path, headers).await
    }

    /// Waits for queued cache and freshness writes to land.
    pub async fn settle(&self) {
        self.handler.writeback().flush().await;
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// How a [`FakeOrigin`] download ends once its body has been sent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BodyTail {
    End,
    /// Keep repeating the body forever.
    Repeat,
    /// Never finish and never send another byte.
    Stall,
}

/// In-process origin for cases a socket mock cannot express: calls that
/// hang or panic, downloads without a declared length, chunked or endless
/// bodies. It ignores forwarded ranges and always answers 200.
pub struct FakeOrigin {
    resolve_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    panic_on_resolve: bool,
    body: Bytes,
    chunk_size: usize,
    tail: BodyTail,
    declare_length: bool,
    resolves: AtomicUsize,
    fetches: AtomicUsize,
    ranges: Mutex<Vec<Option<String>>>,
}

impl FakeOrigin {
    pub fn new(body: Bytes) -> Self {
        Self {
            resolve_delay: None,
            fetch_delay: None,
            panic_on_resolve: false,
            chunk_size: body.len().max(1),
            body,
            tail: BodyTail::End,
            declare_length: true,
            resolves: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    /// Delay before the download's status and headers arrive.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_resolve = true;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.declare_length = false;
        self
    }

    pub fn in_chunks(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_tail(mut self, tail: BodyTail) -> Self {
        self.tail = tail;
        self
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn forwarded_ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    fn stream_body(&self) -> ProxyBody {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = self
            .body
            .chunks(self.chunk_size)
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        let head = stream::iter(chunks);
        match self.tail {
            BodyTail::End => BodyExt::boxed(StreamBody::new(head)),
            BodyTail::Repeat => {
                let body = self.body.clone();
                let tail = stream::repeat_with(move || Ok::<_, BoxError>(Frame::data(body.clone())));
                BodyExt::boxed(StreamBody::new(head.chain(tail)))
            }
            BodyTail::Stall => BodyExt::boxed(StreamBody::new(head.chain(stream::pending()))),
        }
    }
}

impl Origin for FakeOrigin {
    fn resolve<'a>(&'a self, _file_id: &'a str) -> BoxFuture<'a, Result<Location, ProxyError>> {
        async move {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_resolve {
                panic!("origin exploded");
            }
            if let Some(delay) = self.resolve_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(Location {
                path: "videos/fake.mp4".to_string(),
                size: self.declare_length.then_some(self.body.len() as u64),
            })
        }
        .boxed()
    }

    fn fetch<'a>(
        &'a self,
        _location: &'a Location,
        range: Option<HeaderValue>,
    ) -> BoxFuture<'a, Result<OriginResponse, ProxyError>> {
        async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.ranges
                .lock()
                .unwrap()
                .push(range.and_then(|r| r.to_str().ok().map(str::to_string)));
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            let mut headers = HeaderMap::new();
            if self.declare_length {
                headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
            }
            Ok(OriginResponse {
                status: StatusCode::OK,
                headers,
                body: self.stream_body(),
            })
        }
        .boxed()
    }
}

/// Request parts for calling [`MediaHandler::handle`] directly.
pub fn media_parts(file_id: &str) -> Parts {
    Request::builder()
        .uri(format!("/media?file_id={file_id}"))
        .header(http::header::HOST, MEDIA_HOST)
        .body(())
        .unwrap()
        .into_parts()
        .0
}
