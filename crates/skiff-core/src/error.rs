//! Observable download error kinds and retry classification.
//!
//! These cross the engine boundary (state streams, persisted records), so
//! they are serializable and carry only data, never source chains.

use serde::{Deserialize, Serialize};

/// Error surfaced for a download task. Serializable so frontends and the
/// task store can carry it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadError {
    /// Connection, timeout, or unexpected EOF. Retryable.
    #[error("network error: {message}")]
    Network { message: String },

    /// Non-2xx HTTP status. Retryable for 5xx and 429; a 429 additionally
    /// carries the server's throttling hints.
    #[error("HTTP {code}: {message}")]
    Http {
        code: u16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratelimit_remaining: Option<u32>,
    },

    /// Local I/O failure (preallocate, write, flush).
    #[error("disk error: {message}")]
    Disk { message: String },

    /// The server cannot satisfy what the download needs (no byte ranges
    /// with unknown length, no matching source for the URL).
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// ETag/Last-Modified mismatch on resume; the remote file changed and
    /// progress must be discarded.
    #[error("remote file changed: {message}")]
    FileChanged { message: String },

    /// The persisted resume blob failed to parse.
    #[error("corrupt resume state: {message}")]
    CorruptResumeState { message: String },

    /// User-initiated cancellation.
    #[error("canceled")]
    Canceled,

    /// Source-level credential rejection (e.g. FTP 530).
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Other source-specific failure.
    #[error("source error: {message}")]
    Source { message: String },

    /// Catch-all for faults that do not fit a domain kind.
    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl DownloadError {
    pub fn network(message: impl Into<String>) -> Self {
        DownloadError::Network { message: message.into() }
    }

    pub fn http(code: u16, message: impl Into<String>) -> Self {
        DownloadError::Http {
            code,
            message: message.into(),
            retry_after_secs: None,
            ratelimit_remaining: None,
        }
    }

    pub fn disk(message: impl Into<String>) -> Self {
        DownloadError::Disk { message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        DownloadError::Unsupported { message: message.into() }
    }

    pub fn file_changed(message: impl Into<String>) -> Self {
        DownloadError::FileChanged { message: message.into() }
    }

    pub fn corrupt_resume(message: impl Into<String>) -> Self {
        DownloadError::CorruptResumeState { message: message.into() }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        DownloadError::Unknown { message: message.into() }
    }

    /// True for faults worth another attempt: network-level failures and
    /// HTTP 5xx / 429 responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network { .. } => true,
            DownloadError::Http { code, .. } => (500..=599).contains(code) || *code == 429,
            _ => false,
        }
    }

    /// The HTTP status code, when this error carries one.
    pub fn http_code(&self) -> Option<u16> {
        match self {
            DownloadError::Http { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Disk { message: e.to_string() }
    }
}
