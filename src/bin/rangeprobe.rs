use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, HOST, RANGE};
use http::header::AsHeaderName;
use http::{HeaderMap, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use media_edge::constants;
use media_edge::http_range::parse_content_range;

/// Issues one ranged GET against a running proxy and reports what came back.
#[derive(Parser, Debug)]
#[command(name = "rangeprobe", version)]
struct Cli {
    /// Full request URL, e.g. http://127.0.0.1:8080/media?file_id=abc
    url: Uri,

    /// Range header value, e.g. "bytes=0-1023"
    #[arg(short = 'r', long = "range")]
    range: Option<String>,

    /// Host header to send instead of the URL authority
    #[arg(long = "host")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.url.scheme_str().is_some_and(|s| s != "http") {
        return Err(anyhow!("only plain http urls are supported"));
    }
    let authority = cli
        .url
        .authority()
        .ok_or_else(|| anyhow!("url has no host: {}", cli.url))?
        .clone();
    let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.context("handshake")?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            eprintln!("connection error: {err}");
        }
    });

    let path = cli.url.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let host = cli.host.unwrap_or_else(|| authority.as_str().to_string());
    let mut req = Request::get(path).header(HOST, host);
    if let Some(range) = &cli.range {
        req = req.header(RANGE, range);
    }
    let resp = sender
        .send_request(req.body(Empty::<Bytes>::new())?)
        .await
        .context("send request")?;

    let status = resp.status();
    let content_range = header(resp.headers(), CONTENT_RANGE);
    let content_length = header(resp.headers(), CONTENT_LENGTH);
    let cache = header(resp.headers(), constants::PROTOCOL_CACHE_STATUS_KEY);
    let request_id = header(resp.headers(), constants::PROTOCOL_REQUEST_ID_KEY);
    let body = resp.into_body().collect().await.context("read body")?.to_bytes();

    println!("status:          {}", status);
    println!("x-cache:         {}", cache.as_deref().unwrap_or("-"));
    println!("x-request-id:    {}", request_id.as_deref().unwrap_or("-"));
    println!("content-length:  {}", content_length.as_deref().unwrap_or("-"));
    match content_range.as_deref() {
        Some(raw) => match parse_content_range(raw) {
            Some(cr) => println!("content-range:   {}-{} of {}", cr.start, cr.end, cr.size),
            None => println!("content-range:   {raw}"),
        },
        None => println!("content-range:   -"),
    }
    println!("bytes received:  {}", body.len());
    Ok(())
}

fn header(headers: &HeaderMap, name: impl AsHeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}
