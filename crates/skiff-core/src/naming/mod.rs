//! Filename derivation and destination handling.
//!
//! Derives safe local filenames from `Content-Disposition` headers or URL
//! paths, classifies destination strings, and deduplicates colliding output
//! paths.

mod content_disposition;
mod destination;
mod path;
mod sanitize;

pub use content_disposition::parse_content_disposition_filename;
pub use destination::{dedup_path, Destination};
pub use path::filename_from_url_path;
pub use sanitize::sanitize_filename;

use crate::request::DownloadRequest;
use crate::source::ResolvedSource;

/// Default filename when every derivation source yields nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Picks the output filename for a task whose destination does not name one.
pub trait FileNameResolver: Send + Sync {
    fn resolve(&self, request: &DownloadRequest, resolved: &ResolvedSource) -> String;
}

/// First non-blank of: the request's explicit name (bare-name destination),
/// the source's suggested name, a URL-path fallback. Sanitized for local
/// filesystems.
pub struct DefaultFileNameResolver;

impl FileNameResolver for DefaultFileNameResolver {
    fn resolve(&self, request: &DownloadRequest, resolved: &ResolvedSource) -> String {
        let explicit = match Destination::classify(request.destination.as_deref()) {
            Destination::BareName(name) => Some(name),
            _ => None,
        };

        let candidate = explicit
            .or_else(|| {
                resolved
                    .suggested_file_name
                    .clone()
                    .filter(|s| !s.trim().is_empty())
            })
            .or_else(|| filename_from_url_path(&request.url));

        let raw = match candidate {
            Some(c) => c,
            None => return DEFAULT_FILENAME.to_string(),
        };

        let sanitized = sanitize_filename(&raw);
        if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
            DEFAULT_FILENAME.to_string()
        } else {
            sanitized
        }
    }
}

/// Derives a filename for a probed resource: `Content-Disposition` first
/// (`filename*` over `filename`), then the URL path.
pub fn suggested_name(url: &str, content_disposition: Option<&str>) -> Option<String> {
    content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url))
}
