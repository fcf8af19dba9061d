//! HTTP metadata probing and streaming body transfer.
//!
//! The trait is the seam for tests and alternative clients; the engine
//! ships a reqwest-backed implementation. A HEAD probe confirms
//! `Content-Length`, `Accept-Ranges: bytes`, and captures ETag/
//! Last-Modified for resume safety.

mod http;

pub use http::HttpClient;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

use crate::error::DownloadError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Key headers from a HEAD probe, needed for segmenting and resume.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Total size in bytes, if `Content-Length` is present.
    pub content_length: Option<u64>,
    /// True if the server sent `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    /// `ETag` value, verbatim including weak prefix and quotes.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// `Content-Disposition` value (filename hint).
    pub content_disposition: Option<String>,
}

/// An accepted response body.
pub struct HttpBody {
    pub status: u16,
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

/// Minimal HTTP surface the download sources need.
///
/// `get` with a range sends `Range: bytes=a-b` (inclusive on both ends) and
/// expects a 206; without a range a 200 is expected. Connection and timeout
/// failures surface as [`DownloadError::Network`]; non-2xx responses as
/// [`DownloadError::Http`], with 429 carrying `Retry-After` and
/// `RateLimit-Remaining` hints.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ServerInfo, DownloadError>;

    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        headers: &HashMap<String, String>,
    ) -> Result<HttpBody, DownloadError>;
}
