use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WekeoError {
    #[error("invalid job handle: {0:?}")]
    InvalidJobHandle(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no credential available: {0}")]
    #[diagnostic(help("set WEKEO_TOKEN, or WEKEO_USERNAME and WEKEO_PASSWORD"))]
    MissingCredential(String),

    #[error("broker rejected credential (status {status}): {message}")]
    #[diagnostic(help("tokens are not refreshed; request a new one with `wekeo token`"))]
    Auth { status: u16, message: String },

    #[error("broker rejected query (status {status}): {message}")]
    Submission { status: u16, message: String },

    #[error("status check failed after retries: {0}")]
    PollTransport(String),

    #[error("malformed status payload: {0}")]
    MalformedStatus(String),

    #[error("unusable result manifest: {0}")]
    Manifest(String),

    #[error("data order failed (status {status}): {message}")]
    Order { status: u16, message: String },

    #[error("broker request failed: {0}")]
    BrokerHttp(String),

    #[error("broker returned status {status}: {message}")]
    BrokerStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to decode dataset: {0}")]
    Decode(String),
}

impl WekeoError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WekeoError::BrokerHttp(_) => true,
            WekeoError::BrokerStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
