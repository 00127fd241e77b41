pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod freshness;
pub mod handler;
pub mod http_range;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod origin;
pub mod request;
pub mod response;
pub mod runtime;
pub mod server;
pub mod upstream;
pub mod writeback;
