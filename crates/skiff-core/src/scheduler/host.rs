//! Lexical host extraction for per-host fairness.

/// Host part of a URL: scheme stripped, up to the first `/`, then before
/// `:`. A plain lexical parse, no URI allocation per call.
pub fn host_of(url: &str) -> String {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = rest.split('/').next().unwrap_or("");
    let host = authority.split(':').next().unwrap_or("");
    host.to_ascii_lowercase()
}
