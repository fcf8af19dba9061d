//! Filename derivation from a URL path.

use super::content_disposition::percent_decode;

/// Last non-empty path segment of the URL, percent-decoded. Returns None
/// for root paths, unparseable URLs, and segments that decode to nothing.
pub fn filename_from_url_path(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?
        .to_string();

    let decoded = percent_decode(&segment);
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
