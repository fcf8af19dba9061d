//! Segmented HTTP download source.
//!
//! Resolution is a HEAD probe; the download runs parallel ranged GETs over
//! a segment plan, re-planning live when the target connection count
//! changes or the server throttles with 429. Resume re-probes and verifies
//! ETag/Last-Modified before touching the file.

mod run;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{DownloadSource, ResolvedSource, SourceContext, SourceResumeState};
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::naming;
use crate::segment::{downloaded_total, single};
use crate::transport::{HttpTransport, ServerInfo};

pub const HTTP_SOURCE_TYPE: &str = "http";

pub(crate) const META_ETAG: &str = "etag";
pub(crate) const META_LAST_MODIFIED: &str = "lastModified";
pub(crate) const META_ACCEPT_RANGES: &str = "acceptRanges";

/// Resume blob persisted for HTTP downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HttpResumeData {
    pub etag: Option<String>,
    #[serde(rename = "lastModified")]
    pub last_modified: Option<String>,
    #[serde(rename = "totalBytes")]
    pub total_bytes: i64,
}

pub struct HttpDownloadSource {
    transport: Arc<dyn HttpTransport>,
    config: EngineConfig,
}

impl HttpDownloadSource {
    pub fn new(transport: Arc<dyn HttpTransport>, config: EngineConfig) -> Self {
        Self { transport, config }
    }

    fn resolved_from_info(&self, url: &str, info: &ServerInfo) -> ResolvedSource {
        let total_bytes = info.content_length.map(|n| n as i64).unwrap_or(-1);
        let supports_resume = info.accept_ranges;

        let mut resolved = ResolvedSource::new(url, HTTP_SOURCE_TYPE);
        resolved.total_bytes = total_bytes;
        resolved.supports_resume = supports_resume;
        resolved.max_segments = if supports_resume && total_bytes > 0 {
            self.config.max_segments.max(1)
        } else {
            1
        };
        resolved.suggested_file_name =
            naming::suggested_name(url, info.content_disposition.as_deref());
        if let Some(etag) = &info.etag {
            resolved.metadata.insert(META_ETAG.into(), etag.clone());
        }
        if let Some(lm) = &info.last_modified {
            resolved.metadata.insert(META_LAST_MODIFIED.into(), lm.clone());
        }
        resolved
            .metadata
            .insert(META_ACCEPT_RANGES.into(), supports_resume.to_string());
        resolved
    }
}

/// Compares the persisted identity against a fresh probe. ETag wins when
/// stored, compared byte-for-byte including a weak prefix; Last-Modified is
/// the fallback validator.
fn validate_identity(stored: &HttpResumeData, probe: &ServerInfo) -> Result<(), DownloadError> {
    if let Some(stored_etag) = &stored.etag {
        return match &probe.etag {
            Some(current) if current == stored_etag => Ok(()),
            Some(current) => Err(DownloadError::file_changed(format!(
                "ETag changed from {} to {}",
                stored_etag, current
            ))),
            None => Err(DownloadError::file_changed(
                "server no longer reports an ETag",
            )),
        };
    }
    if let Some(stored_lm) = &stored.last_modified {
        return match &probe.last_modified {
            Some(current) if current == stored_lm => Ok(()),
            Some(current) => Err(DownloadError::file_changed(format!(
                "Last-Modified changed from {} to {}",
                stored_lm, current
            ))),
            None => Err(DownloadError::file_changed(
                "server no longer reports Last-Modified",
            )),
        };
    }
    Ok(())
}

#[async_trait]
impl DownloadSource for HttpDownloadSource {
    fn source_type(&self) -> &'static str {
        HTTP_SOURCE_TYPE
    }

    fn can_handle(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn resolve(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ResolvedSource, DownloadError> {
        let info = self.transport.head(url, headers).await?;
        Ok(self.resolved_from_info(url, &info))
    }

    async fn download(&self, ctx: &SourceContext) -> Result<(), DownloadError> {
        let resolved = match &ctx.pre_resolved {
            Some(r) => r.clone(),
            None => self.resolve(&ctx.url, &ctx.headers).await?,
        };
        if resolved.total_bytes < 0 {
            return Err(DownloadError::unsupported(
                "server did not report a content length",
            ));
        }
        let total = resolved.total_bytes as u64;

        let connections = run::effective_connections(&self.config, ctx, &resolved);
        let plan = crate::segment::calculate(total, connections);
        ctx.publish_segments(plan.clone());

        ctx.writer
            .preallocate(total)
            .await
            .map_err(|e| DownloadError::disk(e.to_string()))?;

        if plan.is_empty() {
            (ctx.on_progress)(0, 0);
            return Ok(());
        }
        run::run_plan(self, ctx, &resolved, plan).await
    }

    async fn resume(
        &self,
        ctx: &SourceContext,
        state: SourceResumeState,
    ) -> Result<(), DownloadError> {
        if state.source_type != HTTP_SOURCE_TYPE {
            return Err(DownloadError::corrupt_resume(format!(
                "resume state belongs to source {:?}",
                state.source_type
            )));
        }
        let stored: HttpResumeData = serde_json::from_str(&state.data)
            .map_err(|e| DownloadError::corrupt_resume(e.to_string()))?;

        let info = self.transport.head(&ctx.url, &ctx.headers).await?;
        validate_identity(&stored, &info)?;

        let total = if stored.total_bytes >= 0 {
            stored.total_bytes as u64
        } else if let Some(len) = info.content_length {
            len
        } else {
            return Err(DownloadError::unsupported(
                "server did not report a content length",
            ));
        };

        let mut plan = ctx.current_segments();
        if plan.is_empty() && total > 0 {
            return Err(DownloadError::corrupt_resume("missing segment plan"));
        }
        // Without byte ranges a mid-file offset cannot be requested; start
        // over inside this run.
        if !info.accept_ranges {
            plan = single(total);
        }

        let claimed = downloaded_total(&plan);
        let size = ctx
            .writer
            .size()
            .await
            .map_err(|e| DownloadError::disk(e.to_string()))?;
        if size < total.max(claimed) {
            tracing::warn!(
                task_id = %ctx.task_id,
                size,
                claimed,
                "local file smaller than recorded progress, restarting segments"
            );
            for s in plan.iter_mut() {
                s.downloaded_bytes = 0;
            }
            ctx.writer
                .preallocate(total)
                .await
                .map_err(|e| DownloadError::disk(e.to_string()))?;
        }
        ctx.publish_segments(plan.clone());

        if plan.is_empty() {
            (ctx.on_progress)(0, 0);
            return Ok(());
        }

        let mut resolved = self.resolved_from_info(&ctx.url, &info);
        resolved.total_bytes = total as i64;
        run::run_plan(self, ctx, &resolved, plan).await
    }

    fn build_resume_state(&self, resolved: &ResolvedSource) -> Option<SourceResumeState> {
        let data = HttpResumeData {
            etag: resolved.metadata.get(META_ETAG).cloned(),
            last_modified: resolved.metadata.get(META_LAST_MODIFIED).cloned(),
            total_bytes: resolved.total_bytes,
        };
        Some(SourceResumeState {
            source_type: HTTP_SOURCE_TYPE.into(),
            data: serde_json::to_string(&data).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(etag: Option<&str>, lm: Option<&str>) -> ServerInfo {
        ServerInfo {
            content_length: Some(100),
            accept_ranges: true,
            etag: etag.map(String::from),
            last_modified: lm.map(String::from),
            content_disposition: None,
        }
    }

    fn stored(etag: Option<&str>, lm: Option<&str>) -> HttpResumeData {
        HttpResumeData {
            etag: etag.map(String::from),
            last_modified: lm.map(String::from),
            total_bytes: 100,
        }
    }

    #[test]
    fn etag_match_passes() {
        assert!(validate_identity(&stored(Some("W/\"a\""), None), &info(Some("W/\"a\""), None)).is_ok());
    }

    #[test]
    fn etag_mismatch_is_file_changed() {
        let err =
            validate_identity(&stored(Some("W/\"a\""), None), &info(Some("W/\"b\""), None))
                .unwrap_err();
        assert!(matches!(err, DownloadError::FileChanged { .. }));
    }

    #[test]
    fn etag_preferred_over_last_modified() {
        // Same ETag but different Last-Modified: the ETag decides.
        let ok = validate_identity(
            &stored(Some("\"a\""), Some("Mon, 01 Jan 2024 00:00:00 GMT")),
            &info(Some("\"a\""), Some("Tue, 02 Jan 2024 00:00:00 GMT")),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn last_modified_fallback() {
        let lm = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert!(validate_identity(&stored(None, Some(lm)), &info(None, Some(lm))).is_ok());
        let err = validate_identity(
            &stored(None, Some(lm)),
            &info(None, Some("Thu, 22 Oct 2015 07:28:00 GMT")),
        )
        .unwrap_err();
        assert!(matches!(err, DownloadError::FileChanged { .. }));
    }

    #[test]
    fn no_validators_stored_passes() {
        assert!(validate_identity(&stored(None, None), &info(Some("\"x\""), None)).is_ok());
    }

    #[test]
    fn resume_data_json_field_names() {
        let data = HttpResumeData {
            etag: Some("\"e\"".into()),
            last_modified: Some("lm".into()),
            total_bytes: 42,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["etag"], "\"e\"");
        assert_eq!(json["lastModified"], "lm");
        assert_eq!(json["totalBytes"], 42);
    }
}
