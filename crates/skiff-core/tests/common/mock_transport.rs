//! Scriptable in-memory transport for deterministic engine tests.
//!
//! Serves one body. GETs can be failed in arrival order (e.g. a 429 with
//! throttle hints) or gated: a gated response streams `after_bytes` and
//! then stalls until the gate opens, which lets tests freeze a download at
//! an exact byte count.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use skiff_core::error::DownloadError;
use skiff_core::transport::{HttpBody, HttpTransport, ServerInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Head,
    Get,
}

#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub kind: RequestKind,
    pub url: String,
    pub range: Option<(u64, u64)>,
    pub at: tokio::time::Instant,
}

/// Stall behavior for the first `first_gets` GET requests.
pub struct Gate {
    pub after_bytes: u64,
    pub first_gets: usize,
    pub open: watch::Receiver<bool>,
}

pub struct MockTransport {
    body: Vec<u8>,
    chunk_size: usize,
    info: Mutex<ServerInfo>,
    scripted_get_errors: Mutex<VecDeque<DownloadError>>,
    fail_when_range_len: Mutex<Option<(u64, DownloadError)>>,
    gate: Mutex<Option<Gate>>,
    log: Mutex<Vec<LoggedRequest>>,
    gets_seen: Mutex<usize>,
}

impl MockTransport {
    pub fn new(body: Vec<u8>) -> Self {
        let info = ServerInfo {
            content_length: Some(body.len() as u64),
            accept_ranges: true,
            etag: Some("W/\"mock-1\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            content_disposition: None,
        };
        Self {
            body,
            chunk_size: 10_000,
            info: Mutex::new(info),
            scripted_get_errors: Mutex::new(VecDeque::new()),
            fail_when_range_len: Mutex::new(None),
            gate: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            gets_seen: Mutex::new(0),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn set_info(&self, mutate: impl FnOnce(&mut ServerInfo)) {
        mutate(&mut self.info.lock().unwrap());
    }

    /// Queues an error returned to GETs in arrival order.
    pub fn script_get_error(&self, error: DownloadError) {
        self.scripted_get_errors.lock().unwrap().push_back(error);
    }

    /// Fails every GET whose requested range spans exactly `len` bytes.
    /// Range-length targeting keeps the failure deterministic regardless of
    /// worker arrival order.
    pub fn fail_gets_with_range_len(&self, len: u64, error: DownloadError) {
        *self.fail_when_range_len.lock().unwrap() = Some((len, error));
    }

    /// Installs a gate over the first GETs; returns the opener.
    pub fn gate_first_gets(&self, first_gets: usize, after_bytes: u64) -> watch::Sender<bool> {
        let tx = watch::Sender::new(false);
        *self.gate.lock().unwrap() = Some(Gate {
            after_bytes,
            first_gets,
            open: tx.subscribe(),
        });
        tx
    }

    pub fn log(&self) -> Vec<LoggedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn get_requests(&self) -> Vec<LoggedRequest> {
        self.log()
            .into_iter()
            .filter(|r| r.kind == RequestKind::Get)
            .collect()
    }

    pub fn head_count(&self) -> usize {
        self.log()
            .iter()
            .filter(|r| r.kind == RequestKind::Head)
            .count()
    }
}

struct StreamState {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    hold_at: Option<u64>,
    open: Option<watch::Receiver<bool>>,
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn head(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<ServerInfo, DownloadError> {
        self.log.lock().unwrap().push(LoggedRequest {
            kind: RequestKind::Head,
            url: url.to_string(),
            range: None,
            at: tokio::time::Instant::now(),
        });
        Ok(self.info.lock().unwrap().clone())
    }

    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        _headers: &HashMap<String, String>,
    ) -> Result<HttpBody, DownloadError> {
        let get_index = {
            let mut seen = self.gets_seen.lock().unwrap();
            let index = *seen;
            *seen += 1;
            index
        };
        self.log.lock().unwrap().push(LoggedRequest {
            kind: RequestKind::Get,
            url: url.to_string(),
            range,
            at: tokio::time::Instant::now(),
        });

        if let Some(err) = self.scripted_get_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some((len, err)) = self.fail_when_range_len.lock().unwrap().as_ref() {
            if let Some((start, end)) = range {
                if end - start + 1 == *len {
                    return Err(err.clone());
                }
            }
        }

        let total = self.body.len() as u64;
        let (start, end) = match range {
            Some((start, end)) => (start.min(total), end.min(total.saturating_sub(1))),
            None => (0, total.saturating_sub(1)),
        };
        let data = if total == 0 || start > end {
            Vec::new()
        } else {
            self.body[start as usize..=end as usize].to_vec()
        };
        let status = if range.is_some() { 206 } else { 200 };

        let (hold_at, open) = {
            let gate = self.gate.lock().unwrap();
            match gate.as_ref() {
                Some(gate) if get_index < gate.first_gets => {
                    (Some(gate.after_bytes), Some(gate.open.clone()))
                }
                _ => (None, None),
            }
        };

        let state = StreamState {
            data,
            pos: 0,
            chunk: self.chunk_size,
            hold_at,
            open,
        };
        let content_length = Some(state.data.len() as u64);
        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.pos >= st.data.len() {
                return None;
            }
            if let Some(hold_at) = st.hold_at {
                if st.pos as u64 >= hold_at {
                    if let Some(rx) = st.open.as_mut() {
                        while !*rx.borrow() {
                            if rx.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            let end = (st.pos + st.chunk).min(st.data.len());
            let chunk = Bytes::copy_from_slice(&st.data[st.pos..end]);
            st.pos = end;
            Some((Ok(chunk), st))
        })
        .boxed();

        Ok(HttpBody { status, content_length, stream })
    }
}

/// Deterministic test body: repeating counter bytes.
pub fn pattern_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A scripted 429 with throttle hints.
pub fn throttle_429(retry_after_secs: u64, remaining: u32) -> DownloadError {
    DownloadError::Http {
        code: 429,
        message: "too many requests".into(),
        retry_after_secs: Some(retry_after_secs),
        ratelimit_remaining: Some(remaining),
    }
}
