//! URL → source routing.

use std::sync::Arc;

use super::DownloadSource;
use crate::error::DownloadError;

/// Routes URLs to registered sources in registration order: the first
/// source whose `can_handle` accepts the URL wins. The HTTP source is the
/// conventional catch-all and is registered last.
#[derive(Default)]
pub struct SourceResolver {
    sources: Vec<Arc<dyn DownloadSource>>,
}

impl SourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn DownloadSource>) {
        self.sources.push(source);
    }

    /// First registered source accepting the URL.
    pub fn resolve_for_url(&self, url: &str) -> Result<Arc<dyn DownloadSource>, DownloadError> {
        self.sources
            .iter()
            .find(|s| s.can_handle(url))
            .cloned()
            .ok_or_else(|| DownloadError::unsupported(format!("no source can handle {}", url)))
    }

    /// Look up a source by its persisted type tag (restoring a run whose
    /// source is already known from the task record).
    pub fn resolve_by_type(&self, source_type: &str) -> Option<Arc<dyn DownloadSource>> {
        self.sources
            .iter()
            .find(|s| s.source_type() == source_type)
            .cloned()
    }
}
