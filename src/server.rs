use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use http::header::HOST;
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{ByteCache, MemoryByteCache};
use crate::config::Bootstrap;
use crate::constants;
use crate::freshness::{Clock, SystemClock};
use crate::handler::{MediaHandler, Policy};
use crate::logging;
use crate::metadata::{MemoryMetadataStore, MetadataStore, SledMetadataStore};
use crate::metrics;
use crate::origin::{HttpOrigin, Origin};
use crate::response::{empty, json_response, text_response, ProxyBody};
use crate::runtime;
use crate::writeback::WriteBack;

const DEFAULT_LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "127.1"];

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let (handler, _worker) = build_handler(&cfg)?;
    let state = Arc::new(AppState::new(Arc::clone(&handler), &cfg.server.local_api_allow_hosts));

    let listener = bind_listener(&cfg.server.addr).await?;
    log::info!(
        "{} listening on {}",
        runtime::server_token(),
        listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| cfg.server.addr.clone())
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    serve(listener, state, shutdown_rx).await?;

    log::info!("shutting down, flushing pending cache writes");
    handler.writeback().flush().await;
    Ok(())
}

/// Wires the production stores, origin client and writeback worker.
pub fn build_handler(cfg: &Bootstrap) -> Result<(Arc<MediaHandler>, JoinHandle<()>)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache: Arc<dyn ByteCache> = Arc::new(MemoryByteCache::with_limits(
        cfg.cache.max_entries,
        Some(cfg.cache.max_bytes),
    ));
    let metadata = build_metadata(cfg, Arc::clone(&clock))?;
    let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(&cfg.origin)?);
    let (writeback, worker) = WriteBack::spawn(
        Arc::clone(&cache),
        Arc::clone(&metadata),
        cfg.cache.writeback_queue,
    );
    let handler = MediaHandler::new(cache, metadata, origin, writeback, clock, Policy::from_config(cfg));
    Ok((handler, worker))
}

fn build_metadata(cfg: &Bootstrap, clock: Arc<dyn Clock>) -> Result<Arc<dyn MetadataStore>> {
    // records older than the staleness interval carry no information
    let expiry = cfg.cache.staleness_interval;
    match cfg.metadata.driver.as_str() {
        "sled" => {
            let store = SledMetadataStore::open(Path::new(&cfg.metadata.path), expiry, clock)?;
            match store.sweep_expired() {
                Ok(0) => {}
                Ok(n) => log::info!("removed {n} expired freshness records"),
                Err(err) => log::warn!("freshness sweep failed: {err:#}"),
            }
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(MemoryMetadataStore::new(expiry, clock))),
    }
}

pub struct AppState {
    handler: Arc<MediaHandler>,
    local_hosts: HashSet<String>,
}

impl AppState {
    pub fn new(handler: Arc<MediaHandler>, extra_local_hosts: &[String]) -> Self {
        let mut local_hosts: HashSet<String> = DEFAULT_LOCAL_HOSTS.iter().map(|h| h.to_string()).collect();
        local_hosts.extend(extra_local_hosts.iter().cloned());
        Self { handler, local_hosts }
    }

    fn is_local(&self, parts: &Parts) -> bool {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .or_else(|| parts.uri.host().map(|v| v.to_string()));
        let Some(host) = host else { return false };
        let name = host.split_once(':').map(|(h, _)| h).unwrap_or(&host);
        self.local_hosts.contains(name)
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("bind {socket_addr}"))
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT"),
        }
        let _ = shutdown.send(true);
    });
}

/// Accepts connections until `shutdown` flips. Connections already accepted
/// keep running on their own tasks.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<ProxyBody>, Infallible> {
    let request_id = metrics::request_id_from_headers(req.headers());
    let (parts, _body) = req.into_parts();
    let started = Instant::now();

    let mut resp = logging::with_request_id(request_id.clone(), async {
        let resp = match internal_route(&parts, &state) {
            Some(resp) => resp,
            None => state.handler.handle(&parts).await,
        };
        let cache = resp
            .headers()
            .get(constants::PROTOCOL_CACHE_STATUS_KEY)
            .and_then(|v| v.to_str().ok());
        logging::access(&parts.method, &parts.uri, resp.status(), cache, started.elapsed());
        resp
    })
    .await;

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());
    Ok(resp)
}

fn internal_route(parts: &Parts, state: &AppState) -> Option<Response<ProxyBody>> {
    if !state.is_local(parts) {
        return None;
    }
    let resp = match parts.uri.path() {
        "/healthz/startup-probe" => text_response(StatusCode::OK, "ok"),
        "/healthz/liveness-probe" | "/healthz/readiness-probe" => empty_response(StatusCode::OK),
        "/version" => json_response(&runtime::build_info()),
        "/metrics" => text_response(StatusCode::OK, &metrics::render()),
        _ => return None,
    };
    Some(resp)
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = status;
    resp
}
