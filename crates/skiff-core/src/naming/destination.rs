//! Destination string classification and collision handling.

use std::path::{Path, PathBuf};

/// What a request's destination string means.
///
/// | shape | meaning |
/// |---|---|
/// | absent/empty | engine-default directory, derived filename |
/// | ends with separator | directory, derived filename |
/// | contains separator | full path, used verbatim |
/// | `scheme://…` | opaque URI for the platform writer |
/// | otherwise | bare filename, joined with the default directory |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Default,
    Directory(PathBuf),
    FullPath(PathBuf),
    BareName(String),
    Uri(String),
}

impl Destination {
    pub fn classify(destination: Option<&str>) -> Destination {
        let Some(raw) = destination else {
            return Destination::Default;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Destination::Default;
        }
        if let Some((scheme, _)) = raw.split_once("://") {
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
                return Destination::Uri(raw.to_string());
            }
        }
        if raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR) {
            return Destination::Directory(PathBuf::from(raw));
        }
        if raw.contains('/') || raw.contains(std::path::MAIN_SEPARATOR) {
            return Destination::FullPath(PathBuf::from(raw));
        }
        Destination::BareName(raw.to_string())
    }
}

/// Resolves a filename collision by appending `" (n)"` before the last
/// extension, starting at n = 1, until the path does not exist. Given an
/// unchanged filesystem, repeated calls return the same output.
pub fn dedup_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("dedup counter exhausted");
}
