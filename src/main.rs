use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use media_edge::config::{self, Bootstrap};
use media_edge::logging;
use media_edge::server;

#[derive(Parser, Debug)]
#[command(name = "media-edge", about = "Caching range proxy for media files", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Log at debug level regardless of logger.level
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Validate the config, print the effective cache policy and exit
    #[arg(short = 't', long = "check")]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    if cli.check {
        println!(
            "{}: ok (origin {}, stale after {:?}, touch every {:?}, cache up to {} bytes per file / {} total)",
            cli.config.display(),
            cfg.origin.api_base,
            cfg.cache.staleness_interval,
            cfg.cache.touch_interval,
            cfg.cache.max_cacheable_size,
            cfg.cache.max_bytes,
        );
        return Ok(());
    }

    logging::init(&cfg.logger, cli.verbose)?;
    if let Some(pidfile) = &cfg.pidfile {
        write_pid(Path::new(pidfile))?;
    }
    log::info!(
        "media-edge {} starting with config {}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );

    server::run(Arc::new(cfg)).await
}

/// Loads and validates the config. Unknown keys fail a strict config and are
/// reported on stderr otherwise, since the logger is not up yet.
fn load_config(path: &Path) -> Result<Bootstrap> {
    let (cfg, ignored) = config::load(path)?;
    if !ignored.is_empty() {
        if cfg.strict {
            bail!("{}: unknown config fields: {}", path.display(), ignored.join(", "));
        }
        eprintln!("{}: ignoring unknown config fields: {}", path.display(), ignored.join(", "));
    }
    cfg.validate().with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn write_pid(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create pid dir {}", parent.display()))?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("write pid file {}", path.display()))
}
