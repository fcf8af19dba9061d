//! Segment worker orchestration: batches, live re-segmentation, 429
//! adaptation.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::HttpDownloadSource;
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::segment::{all_complete, downloaded_total, resegment, Segment};
use crate::source::{ProgressFn, ResolvedSource, SourceContext, ThrottleFn};
use crate::transport::HttpTransport;
use crate::writer::FileWriter;

/// After this long without a 429 the effective connection count may grow
/// back toward the requested one.
const THROTTLE_RECOVERY: Duration = Duration::from_secs(60);

/// Connection count the source should currently use: the live override when
/// positive, else the request's count, else the configured default; always
/// clamped to what the server supports.
pub(super) fn effective_connections(
    config: &EngineConfig,
    ctx: &SourceContext,
    resolved: &ResolvedSource,
) -> u32 {
    let live = *ctx.max_connections.borrow();
    let base = if live > 0 {
        live
    } else if ctx.request.connections > 0 {
        ctx.request.connections
    } else {
        config.default_connections
    };
    base.clamp(1, resolved.max_segments.max(1))
}

enum Outcome {
    /// Every spawned worker finished cleanly.
    BatchDone,
    Canceled,
    /// The target connection count changed under us.
    Resegment,
    Failed(DownloadError),
}

/// Drives the plan to completion in batches of segment workers. A batch is
/// torn down (without touching observable task state) when the connection
/// target changes or a worker hits 429; progress survives in the shared
/// plan and the next batch continues from it.
pub(super) async fn run_plan(
    src: &HttpDownloadSource,
    ctx: &SourceContext,
    resolved: &ResolvedSource,
    mut plan: Vec<Segment>,
) -> Result<(), DownloadError> {
    let total = resolved.total_bytes.max(0) as u64;
    let ranged = resolved.supports_resume;

    let mut throttle_cap: Option<u32> = None;
    let mut last_throttled: Option<Instant> = None;
    let mut max_conn_rx = ctx.max_connections.clone();
    let _ = max_conn_rx.borrow_and_update();

    loop {
        ctx.publish_segments(plan.clone());
        (ctx.on_progress)(downloaded_total(&plan), total);
        if all_complete(&plan) {
            return Ok(());
        }
        if ctx.cancel.is_cancelled() {
            return Err(DownloadError::Canceled);
        }

        if let Some(at) = last_throttled {
            if at.elapsed() >= THROTTLE_RECOVERY {
                tracing::debug!(task_id = %ctx.task_id, "throttle window passed, lifting connection cap");
                throttle_cap = None;
                last_throttled = None;
            }
        }
        let mut target = effective_connections(&src.config, ctx, resolved);
        if let Some(cap) = throttle_cap {
            target = target.min(cap);
        }
        let target = target.max(1);

        let shared = Arc::new(Mutex::new(plan.clone()));
        let batch = CancellationToken::new();
        let mut join = JoinSet::new();
        let worker_indexes: Vec<u32> = plan
            .iter()
            .filter(|s| !s.is_complete())
            .take(target as usize)
            .map(|s| s.index)
            .collect();
        for index in worker_indexes {
            join.spawn(run_segment(SegmentJob {
                transport: Arc::clone(&src.transport),
                url: ctx.url.clone(),
                headers: ctx.headers.clone(),
                index,
                shared: Arc::clone(&shared),
                segments_tx: Arc::clone(&ctx.segments),
                writer: Arc::clone(&ctx.writer),
                throttle: Arc::clone(&ctx.throttle),
                on_progress: Arc::clone(&ctx.on_progress),
                cancel: batch.child_token(),
                ranged,
                total,
            }));
        }

        let outcome = supervise(ctx, &mut max_conn_rx, &mut join).await;
        batch.cancel();
        join.shutdown().await;
        plan = shared.lock().unwrap().clone();

        match outcome {
            Outcome::BatchDone => {
                // Next loop iteration either finishes or starts the
                // remaining segments.
            }
            Outcome::Canceled => return Err(DownloadError::Canceled),
            Outcome::Resegment => {
                let _ = ctx
                    .pending_resegment
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |n| n.checked_sub(1),
                    );
                let mut n = effective_connections(&src.config, ctx, resolved);
                if let Some(cap) = throttle_cap {
                    n = n.min(cap);
                }
                tracing::debug!(task_id = %ctx.task_id, connections = n, "re-segmenting for new connection count");
                plan = resegment(&plan, n.max(1));
            }
            Outcome::Failed(e) if e.http_code() == Some(429) => {
                let (retry_after, remaining) = match &e {
                    DownloadError::Http { retry_after_secs, ratelimit_remaining, .. } => {
                        (*retry_after_secs, *ratelimit_remaining)
                    }
                    _ => (None, None),
                };
                let reduced = remaining
                    .map(|r| r.max(1))
                    .unwrap_or_else(|| (target / 2).max(1))
                    .min(target)
                    .max(1);
                throttle_cap = Some(reduced);
                last_throttled = Some(Instant::now());
                tracing::warn!(
                    task_id = %ctx.task_id,
                    connections = reduced,
                    retry_after = ?retry_after,
                    "server throttled with 429, reducing connection count"
                );

                let delay = Duration::from_secs(retry_after.unwrap_or(1).max(1));
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(DownloadError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
                plan = resegment(&plan, reduced);
            }
            Outcome::Failed(e) => return Err(e),
        }
    }
}

async fn supervise(
    ctx: &SourceContext,
    max_conn_rx: &mut watch::Receiver<u32>,
    join: &mut JoinSet<Result<(), DownloadError>>,
) -> Outcome {
    let mut watch_open = true;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Outcome::Canceled,
            changed = max_conn_rx.changed(), if watch_open => {
                match changed {
                    Ok(()) => {
                        let _ = max_conn_rx.borrow_and_update();
                        return Outcome::Resegment;
                    }
                    Err(_) => watch_open = false,
                }
            }
            joined = join.join_next() => match joined {
                None => return Outcome::BatchDone,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => return Outcome::Failed(e),
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => {
                    return Outcome::Failed(DownloadError::unknown(format!(
                        "segment worker panicked: {}",
                        err
                    )));
                }
            }
        }
    }
}

struct SegmentJob {
    transport: Arc<dyn HttpTransport>,
    url: String,
    headers: HashMap<String, String>,
    index: u32,
    shared: Arc<Mutex<Vec<Segment>>>,
    segments_tx: Arc<watch::Sender<Vec<Segment>>>,
    writer: Arc<dyn FileWriter>,
    throttle: ThrottleFn,
    on_progress: ProgressFn,
    cancel: CancellationToken,
    ranged: bool,
    total: u64,
}

/// Downloads one segment from its current offset, throttling before every
/// write and publishing per-chunk progress.
async fn run_segment(job: SegmentJob) -> Result<(), DownloadError> {
    let (start_offset, end, already) = {
        let plan = job.shared.lock().unwrap();
        let seg = plan
            .iter()
            .find(|s| s.index == job.index)
            .copied()
            .ok_or_else(|| DownloadError::unknown("segment vanished from plan"))?;
        if seg.is_complete() {
            return Ok(());
        }
        (seg.current_offset(), seg.end, seg.downloaded_bytes)
    };

    let range = if job.ranged { Some((start_offset, end)) } else { None };
    let body = tokio::select! {
        _ = job.cancel.cancelled() => return Err(DownloadError::Canceled),
        r = job.transport.get(&job.url, range, &job.headers) => r?,
    };
    if range.is_some() && body.status != 206 {
        return Err(DownloadError::http(
            body.status,
            "expected 206 Partial Content for ranged request",
        ));
    }

    let expected = end - start_offset + 1;
    let mut received = 0u64;
    let mut stream = body.stream;

    loop {
        let chunk = tokio::select! {
            _ = job.cancel.cancelled() => return Err(DownloadError::Canceled),
            c = stream.next() => c,
        };
        let chunk = match chunk {
            None => break,
            Some(Ok(c)) => c,
            Some(Err(e)) => return Err(e),
        };
        if chunk.is_empty() {
            continue;
        }
        let room = expected - received;
        if room == 0 {
            // Server over-sent; everything we asked for has landed.
            break;
        }
        let take = (chunk.len() as u64).min(room) as usize;

        tokio::select! {
            _ = job.cancel.cancelled() => return Err(DownloadError::Canceled),
            _ = (job.throttle)(take as u64) => {}
        }
        job.writer
            .write_at(start_offset + received, &chunk[..take])
            .await
            .map_err(|e| DownloadError::disk(e.to_string()))?;
        received += take as u64;

        let (snapshot, downloaded_sum) = {
            let mut plan = job.shared.lock().unwrap();
            if let Some(seg) = plan.iter_mut().find(|s| s.index == job.index) {
                seg.downloaded_bytes = already + received;
            }
            let sum = downloaded_total(&plan);
            (plan.clone(), sum)
        };
        job.segments_tx.send_replace(snapshot);
        (job.on_progress)(downloaded_sum, job.total);
    }

    if received < expected {
        return Err(if range.is_some() {
            DownloadError::http(
                body.status,
                format!("short body: got {} of {} bytes", received, expected),
            )
        } else {
            DownloadError::network(format!(
                "connection closed early: got {} of {} bytes",
                received, expected
            ))
        });
    }
    Ok(())
}
