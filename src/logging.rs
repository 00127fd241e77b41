//! flexi_logger setup.
//!
//! Every line written while a request is in flight carries that request's
//! id (the same value returned in `X-Request-ID`), including lines from the
//! spawned handler task. One access line per request is written under the
//! `access` target:
//!
//! ```text
//! 2024-01-01T00:00:00.000Z INFO  rid=5f3c.. media_edge::handler: ...
//! 2024-01-01T00:00:00.004Z ACCESS rid=5f3c.. GET /media?file_id=abc 200 cache=HIT 4ms
//! ```

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use http::{Method, StatusCode, Uri};
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
pub const ACCESS_TARGET: &str = "access";

#[derive(Clone, Copy)]
struct LineFormat {
    pid: bool,
    caller: bool,
    request_id: bool,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            pid: false,
            caller: false,
            request_id: true,
        }
    }
}

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();

task_local! {
    static REQUEST_ID: String;
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    LINE_FORMAT.get_or_init(|| LineFormat {
        pid: !config.nopid,
        caller: config.caller,
        request_id: config.request_id,
    });

    let spec = log_spec(&config.level, verbose, !config.no_access_log);
    let mut logger = FlexiLogger::try_with_str(&spec)
        .with_context(|| format!("logger spec {spec:?}"))?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(format_record);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path)).context("logger.path")?;
        logger = logger
            .log_to_file(spec)
            .format(format_record)
            .write_mode(WriteMode::BufferAndFlush);
        if config.max_size > 0 {
            let cleanup = match config.max_backups {
                0 => Cleanup::Never,
                n => Cleanup::KeepLogFiles(n as usize),
            };
            logger = logger.rotate(Criterion::Size(config.max_size * 1024 * 1024), Naming::Numbers, cleanup);
        }
    }

    logger.start().context("start logger")?;
    Ok(())
}

/// Builds the flexi_logger spec. `level` may be a bare level or a full spec
/// such as `info, media_edge::handler=debug`. Storage and HTTP internals are
/// held at warn unless the level names them.
fn log_spec(level: &str, verbose: bool, access: bool) -> String {
    let level = level.trim();
    let mut spec = match (verbose, level.is_empty()) {
        (true, _) => "debug".to_string(),
        (false, true) => "info".to_string(),
        (false, false) => level.to_ascii_lowercase(),
    };
    for noisy in ["sled", "hyper", "hyper_util", "rustls"] {
        if !spec.contains(noisy) {
            spec.push_str(&format!(", {noisy}=warn"));
        }
    }
    spec.push_str(if access { ", access=info" } else { ", access=off" });
    spec
}

fn format_record(writer: &mut dyn Write, now: &mut DeferredNow, record: &log::Record) -> std::io::Result<()> {
    let ts = now.now_utc_owned().format(TIMESTAMP_FORMAT).to_string();
    let format = LINE_FORMAT.get().copied().unwrap_or_default();
    write_line(writer, &ts, format, current_request_id().as_deref(), record)
}

fn write_line(
    writer: &mut dyn Write,
    ts: &str,
    format: LineFormat,
    request_id: Option<&str>,
    record: &log::Record,
) -> std::io::Result<()> {
    let access = record.target() == ACCESS_TARGET;
    if access {
        write!(writer, "{ts} ACCESS")?;
    } else {
        write!(writer, "{ts} {:<5}", record.level())?;
    }
    if format.pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if format.request_id || access {
        write!(writer, " rid={}", request_id.unwrap_or("-"))?;
    }
    if !access {
        write!(writer, " {}:", record.target())?;
        if format.caller {
            write!(writer, " {}:{}", record.file().unwrap_or("-"), record.line().unwrap_or(0))?;
        }
    }
    writeln!(writer, " {}", record.args())
}

/// Writes the access line for one finished request.
pub fn access(method: &Method, uri: &Uri, status: StatusCode, cache: Option<&str>, elapsed: Duration) {
    log::info!(
        target: ACCESS_TARGET,
        "{method} {uri} {} cache={} {}ms",
        status.as_u16(),
        cache.unwrap_or("-"),
        elapsed.as_millis()
    );
}

/// Runs `fut` with `request_id` stamped on every log line it emits.
pub async fn with_request_id<T>(request_id: String, fut: impl std::future::Future<Output = T>) -> T {
    REQUEST_ID.scope(request_id, fut).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|val| val.clone()).ok()
}
