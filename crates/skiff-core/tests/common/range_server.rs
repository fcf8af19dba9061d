//! Tiny HTTP/1.1 fixture: serves one static body with HEAD and Range GET
//! support so transport tests can talk to a real socket on localhost.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ETAG: &str = "\"range-server-1\"";

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// When false, Range headers are ignored (plain 200 with the full
    /// body) and `Accept-Ranges` is never advertised.
    pub support_ranges: bool,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self { support_ranges: true }
    }
}

/// Serves `body` from a background thread until the process exits. Returns
/// the file URL, e.g. `http://127.0.0.1:12345/file.bin`.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let _ = handle(stream, &body, opts);
            });
        }
    });
    format!("http://127.0.0.1:{}/file.bin", port)
}

struct Request {
    method: String,
    range: Option<(u64, u64)>,
}

fn handle(mut stream: TcpStream, body: &[u8], opts: RangeServerOptions) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    stream.set_write_timeout(Some(Duration::from_secs(2)))?;
    let request = read_request(&mut stream)?;
    let total = body.len() as u64;

    let common = if opts.support_ranges {
        vec![
            format!("ETag: {}", ETAG),
            "Accept-Ranges: bytes".to_string(),
        ]
    } else {
        vec![format!("ETag: {}", ETAG)]
    };

    if request.method.eq_ignore_ascii_case("HEAD") {
        let mut headers = common;
        headers.push(format!("Content-Length: {}", total));
        return respond(&mut stream, "200 OK", &headers, &[]);
    }
    if !request.method.eq_ignore_ascii_case("GET") {
        return respond(&mut stream, "405 Method Not Allowed", &[], &[]);
    }

    match request.range.filter(|_| opts.support_ranges) {
        None => respond(&mut stream, "200 OK", &common, body),
        Some((start, end)) => {
            let end = end.min(total.saturating_sub(1));
            if start > end || start >= total {
                let mut headers = common;
                headers.push(format!("Content-Range: bytes */{}", total));
                return respond(&mut stream, "416 Range Not Satisfiable", &headers, &[]);
            }
            let mut headers = common;
            headers.push(format!("Content-Range: bytes {}-{}/{}", start, end, total));
            respond(
                &mut stream,
                "206 Partial Content",
                &headers,
                &body[start as usize..=end as usize],
            )
        }
    }
}

/// Reads the request line plus headers, keeping only what the fixture
/// cares about: the method and an optional `Range: bytes=a-b`.
fn read_request(stream: &mut TcpStream) -> std::io::Result<Request> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let method = line.split_whitespace().next().unwrap_or("").to_string();

    let mut range = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some(value) = header
            .split_once(':')
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
            .map(|(_, value)| value.trim().to_string())
        {
            range = parse_range(&value);
        }
    }
    Ok(Request { method, range })
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn respond(
    stream: &mut TcpStream,
    status: &str,
    headers: &[String],
    body: &[u8],
) -> std::io::Result<()> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for header in headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    // HEAD responses set their own Content-Length; everything else
    // advertises the actual body length.
    if headers.iter().all(|h| !h.starts_with("Content-Length")) {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");
    stream.write_all(out.as_bytes())?;
    stream.write_all(body)
}
