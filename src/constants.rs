pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const QUERY_FILE_ID: &str = "file_id";
pub const QUERY_FORCE_REFRESH: &[&str] = &["nocache", "refresh"];

pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";
pub const CONTENT_DISPOSITION_INLINE: &str = "inline";
pub const ALLOW_ANY_ORIGIN: &str = "*";

pub const DEFAULT_STALENESS_SECS: u64 = 3 * 24 * 60 * 60;
pub const DEFAULT_TOUCH_SECS: u64 = 60 * 60;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CACHEABLE_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_WRITEBACK_QUEUE: usize = 1024;
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Authority used in cache keys when a request names no host.
pub const DEFAULT_CACHE_AUTHORITY: &str = "localhost";
