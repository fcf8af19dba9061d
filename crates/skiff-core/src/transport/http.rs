//! reqwest-backed transport.

use anyhow::Result;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use std::collections::HashMap;
use std::time::Duration;

use super::{HttpBody, HttpTransport, ServerInfo};
use crate::config::EngineConfig;
use crate::error::DownloadError;

pub struct HttpClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        // No total timeout on the client: segment bodies can stream for a
        // long time at low bandwidth. HEAD gets a per-request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .pool_max_idle_per_host(config.max_segments.max(1) as usize)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client, request_timeout })
    }
}

fn net_err(e: &reqwest::Error) -> DownloadError {
    DownloadError::network(e.to_string())
}

fn build_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let name = match HeaderName::from_bytes(name.trim().as_bytes()) {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(header = %name, "skipping invalid request header name");
                continue;
            }
        };
        match HeaderValue::from_str(value.trim()) {
            Ok(v) => {
                out.insert(name, v);
            }
            Err(_) => tracing::warn!(header = %name, "skipping invalid request header value"),
        }
    }
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Builds the error for a non-2xx status. 429 carries the server's
/// throttling hints so the source can adapt its concurrency.
pub(crate) fn status_error(status: u16, headers: &HeaderMap) -> DownloadError {
    if status == 429 {
        let retry_after_secs = header_str(headers, "retry-after").and_then(|v| v.parse().ok());
        let ratelimit_remaining = header_str(headers, "ratelimit-remaining")
            .or_else(|| header_str(headers, "x-ratelimit-remaining"))
            .and_then(|v| v.parse().ok());
        DownloadError::Http {
            code: 429,
            message: "too many requests".into(),
            retry_after_secs,
            ratelimit_remaining,
        }
    } else {
        DownloadError::http(status, format!("unexpected status {}", status))
    }
}

fn server_info(headers: &HeaderMap) -> ServerInfo {
    ServerInfo {
        content_length: header_str(headers, "content-length").and_then(|v| v.parse().ok()),
        accept_ranges: header_str(headers, "accept-ranges")
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false),
        etag: header_str(headers, "etag").map(str::to_string),
        last_modified: header_str(headers, "last-modified").map(str::to_string),
        content_disposition: header_str(headers, "content-disposition").map(str::to_string),
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    async fn head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ServerInfo, DownloadError> {
        let resp = self
            .client
            .head(url)
            .headers(build_headers(headers))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| net_err(&e))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(status_error(status, resp.headers()));
        }
        Ok(server_info(resp.headers()))
    }

    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        headers: &HashMap<String, String>,
    ) -> Result<HttpBody, DownloadError> {
        let mut req = self.client.get(url).headers(build_headers(headers));
        if let Some((start, end)) = range {
            req = req.header(RANGE, format!("bytes={}-{}", start, end));
        }

        let resp = req.send().await.map_err(|e| net_err(&e))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(status_error(status, resp.headers()));
        }

        let content_length = resp.content_length();
        let stream = resp
            .bytes_stream()
            .map_err(move |e| net_err(&e))
            .boxed();
        Ok(HttpBody { status, content_length, stream })
    }
}
