use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.origin.api_base.trim().is_empty() {
            return Err(anyhow!("origin.api_base is required"));
        }
        if self.origin.file_base.trim().is_empty() {
            return Err(anyhow!("origin.file_base is required"));
        }
        if self.cache.touch_interval > self.cache.staleness_interval {
            return Err(anyhow!(
                "cache.touch_interval ({:?}) must not exceed cache.staleness_interval ({:?})",
                self.cache.touch_interval,
                self.cache.staleness_interval
            ));
        }
        if self.cache.max_bytes < self.cache.max_cacheable_size {
            return Err(anyhow!(
                "cache.max_bytes ({}) must be at least cache.max_cacheable_size ({})",
                self.cache.max_bytes,
                self.cache.max_cacheable_size
            ));
        }
        match self.metadata.driver.as_str() {
            "memory" => {}
            "sled" if !self.metadata.path.trim().is_empty() => {}
            "sled" => return Err(anyhow!("metadata.path is required for the sled driver")),
            other => return Err(anyhow!("unknown metadata.driver {other:?}")),
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub request_id: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
    #[serde(default)]
    pub no_access_log: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub local_api_allow_hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Origin {
    /// Base of the metadata API; `getFile` is appended.
    #[serde(default)]
    pub api_base: String,
    /// Base of the file download endpoint; the resolved file path is appended.
    #[serde(default)]
    pub file_base: String,
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(default)]
    pub max_connections_per_server: usize,
    #[serde(default)]
    pub max_idle_conns_per_host: usize,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            file_base: String::new(),
            fetch_timeout: default_fetch_timeout(),
            max_connections_per_server: 0,
            max_idle_conns_per_host: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_staleness", with = "humantime_serde")]
    pub staleness_interval: Duration,
    #[serde(default = "default_touch", with = "humantime_serde")]
    pub touch_interval: Duration,
    #[serde(default = "default_max_cacheable_size")]
    pub max_cacheable_size: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Upper bound on the bytes held by the in-memory cache.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
    #[serde(default = "default_writeback_queue")]
    pub writeback_queue: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            staleness_interval: default_staleness(),
            touch_interval: default_touch(),
            max_cacheable_size: default_max_cacheable_size(),
            max_entries: None,
            max_bytes: default_cache_max_bytes(),
            default_content_type: default_content_type(),
            writeback_queue: default_writeback_queue(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Metadata {
    #[serde(default = "default_metadata_driver")]
    pub driver: String,
    #[serde(default)]
    pub path: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            driver: default_metadata_driver(),
            path: String::new(),
        }
    }
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(constants::DEFAULT_FETCH_TIMEOUT_SECS)
}

fn default_staleness() -> Duration {
    Duration::from_secs(constants::DEFAULT_STALENESS_SECS)
}

fn default_touch() -> Duration {
    Duration::from_secs(constants::DEFAULT_TOUCH_SECS)
}

fn default_max_cacheable_size() -> u64 {
    constants::DEFAULT_MAX_CACHEABLE_SIZE
}

fn default_cache_max_bytes() -> u64 {
    constants::DEFAULT_CACHE_MAX_BYTES
}

fn default_content_type() -> String {
    constants::DEFAULT_CONTENT_TYPE.to_string()
}

fn default_writeback_queue() -> usize {
    constants::DEFAULT_WRITEBACK_QUEUE
}

fn default_metadata_driver() -> String {
    "memory".to_string()
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  addr: "127.0.0.1:8080"
origin:
  api_base: "https://api.example.net/botTOKEN"
  file_base: "https://api.example.net/file/botTOKEN"
  fetch_timeout: 10s
cache:
  staleness_interval: 2d
  touch_interval: 30m
  max_cacheable_size: 1048576
metadata:
  driver: sled
  path: /var/lib/media-edge/meta
"#;

    #[test]
    fn parses_durations_and_sections() {
        let (cfg, ignored) = parse(SAMPLE).unwrap();
        assert!(ignored.is_empty());
        assert_eq!(cfg.origin.fetch_timeout, Duration::from_secs(10));
        assert_eq!(cfg.cache.staleness_interval, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(cfg.cache.touch_interval, Duration::from_secs(30 * 60));
        assert_eq!(cfg.cache.max_cacheable_size, 1_048_576);
        assert_eq!(cfg.metadata.driver, "sled");
        cfg.validate().unwrap();
    }

    #[test]
    fn defaults_follow_policy_constants() {
        let (cfg, _) = parse("server:\n  addr: \":8080\"\n").unwrap();
        assert_eq!(cfg.cache.staleness_interval, Duration::from_secs(3 * 24 * 3600));
        assert_eq!(cfg.cache.touch_interval, Duration::from_secs(3600));
        assert_eq!(cfg.origin.fetch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.cache.max_cacheable_size, 500 * 1024 * 1024);
        assert_eq!(cfg.cache.max_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(cfg.cache.max_entries, None);
        assert_eq!(cfg.cache.default_content_type, "video/mp4");
        assert_eq!(cfg.metadata.driver, "memory");
    }

    #[test]
    fn collects_unknown_fields() {
        let (_, ignored) = parse("server:\n  addr: \":8080\"\n  bogus: 1\n").unwrap();
        assert_eq!(ignored, vec!["server.bogus".to_string()]);
    }

    #[test]
    fn rejects_touch_longer_than_staleness() {
        let raw = "server:\n  addr: \":1\"\norigin:\n  api_base: a\n  file_base: b\ncache:\n  staleness_interval: 1h\n  touch_interval: 2h\n";
        let (cfg, _) = parse(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_cache_budget_is_bounded_and_valid() {
        let (cfg, _) = parse("origin:\n  api_base: a\n  file_base: b\nserver:\n  addr: \":1\"\n").unwrap();
        cfg.validate().unwrap();
        assert!(cfg.cache.max_bytes >= cfg.cache.max_cacheable_size);
    }

    #[test]
    fn rejects_cache_budget_below_one_entry() {
        for max_bytes in ["0", "1024"] {
            let raw = format!(
                "server:\n  addr: \":1\"\norigin:\n  api_base: a\n  file_base: b\ncache:\n  max_cacheable_size: 4096\n  max_bytes: {max_bytes}\n"
            );
            let (cfg, _) = parse(&raw).unwrap();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("cache.max_bytes"), "{err}");
        }
    }

    #[test]
    fn example_config_is_valid() {
        let (cfg, ignored) = parse(include_str!("../config.example.yaml")).unwrap();
        assert!(ignored.is_empty(), "{ignored:?}");
        assert!(cfg.strict);
        assert_eq!(cfg.cache.max_entries, Some(4096));
        assert_eq!(cfg.server.local_api_allow_hosts, vec!["media-edge.internal".to_string()]);
        cfg.validate().unwrap();
    }
}
