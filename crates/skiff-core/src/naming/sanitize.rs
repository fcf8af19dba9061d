//! Filename sanitization for local filesystems.

/// Strips characters that cannot appear in a filename: path separators,
/// NUL, and other control characters become `_`; leading/trailing dots and
/// whitespace are trimmed.
pub fn sanitize_filename(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    replaced.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}
