//! Terminal error categories of the media handler.
//!
//! Everything that can go wrong while serving a request ends up as one of
//! these and is rendered as a plain-text response. Failures of background
//! cache/metadata writes never reach this type.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Which of the two chained origin calls failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginStage {
    Resolve,
    Fetch,
}

impl OriginStage {
    pub fn as_str(self) -> &'static str {
        match self {
            OriginStage::Resolve => "resolve",
            OriginStage::Fetch => "fetch",
        }
    }
}

impl std::fmt::Display for OriginStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("origin {stage} failed{}: {detail}", status_suffix(.status))]
    Origin {
        stage: OriginStage,
        status: Option<StatusCode>,
        detail: String,
    },

    #[error("origin {stage} timed out after {}ms", .after.as_millis())]
    OriginTimeout { stage: OriginStage, after: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn origin(stage: OriginStage, status: Option<StatusCode>, detail: impl Into<String>) -> Self {
        ProxyError::Origin {
            stage,
            status,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Origin { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::OriginTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal(format!("{err:#}"))
    }
}

fn status_suffix(status: &Option<StatusCode>) -> String {
    match status {
        Some(code) => format!(" with status {}", code.as_u16()),
        None => String::new(),
    }
}
