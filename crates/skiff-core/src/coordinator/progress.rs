//! Throttled progress emission and periodic segment persistence.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::tasks::TaskShared;
use crate::segment::downloaded_total;
use crate::state::{DownloadProgress, DownloadState};
use crate::store::TaskStore;

/// Rate-limits observable `Downloading` updates to one per interval and
/// keeps `downloaded_bytes` monotonically non-decreasing. Updates are
/// dropped once the task leaves the downloading state, so a late worker
/// callback cannot overwrite `Paused`.
pub(crate) struct ProgressTracker {
    state_tx: Arc<watch::Sender<DownloadState>>,
    interval: Duration,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    peak_downloaded: u64,
    last_emit: Option<Instant>,
    rate_window_start: Instant,
    rate_window_bytes: u64,
    bytes_per_second: u64,
}

impl ProgressTracker {
    pub fn new(state_tx: Arc<watch::Sender<DownloadState>>, interval: Duration) -> Self {
        Self {
            state_tx,
            interval,
            inner: Mutex::new(TrackerInner {
                peak_downloaded: 0,
                last_emit: None,
                rate_window_start: Instant::now(),
                rate_window_bytes: 0,
                bytes_per_second: 0,
            }),
        }
    }

    pub fn update(&self, downloaded: u64, total: u64) {
        let progress = {
            let mut inner = self.inner.lock().unwrap();
            let downloaded = downloaded.max(inner.peak_downloaded);
            inner.peak_downloaded = downloaded;

            let now = Instant::now();
            let window = now.duration_since(inner.rate_window_start);
            if window >= Duration::from_secs(1) {
                let delta = downloaded.saturating_sub(inner.rate_window_bytes);
                inner.bytes_per_second = (delta as f64 / window.as_secs_f64()) as u64;
                inner.rate_window_start = now;
                inner.rate_window_bytes = downloaded;
            }

            match inner.last_emit {
                Some(at) if now.duration_since(at) < self.interval => return,
                _ => inner.last_emit = Some(now),
            }
            DownloadProgress::new(downloaded, total as i64, inner.bytes_per_second)
        };

        self.state_tx.send_if_modified(|state| match state {
            DownloadState::Downloading { progress: current } => {
                *current = progress;
                true
            }
            _ => false,
        });
    }
}

/// Flushes the live segment plan into the task record every `every` until
/// stopped. Persistence failures are logged and do not affect the run.
pub(crate) async fn run_save_loop(
    store: Arc<dyn TaskStore>,
    shared: Arc<TaskShared>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticks = tokio::time::interval(every.max(Duration::from_millis(50)));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticks.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticks.tick() => {}
        }
        persist_segments(&store, &shared).await;
    }
}

pub(crate) async fn persist_segments(store: &Arc<dyn TaskStore>, shared: &Arc<TaskShared>) {
    let segments = shared.segments();
    if segments.is_empty() {
        return;
    }
    match store.load(&shared.task_id).await {
        Ok(Some(mut record)) => {
            record.downloaded_bytes = downloaded_total(&segments);
            record.segments = Some(segments);
            record.touch();
            if let Err(e) = store.save(&record).await {
                tracing::warn!(task_id = %shared.task_id, error = %e, "segment progress flush failed");
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(task_id = %shared.task_id, error = %e, "segment progress flush failed");
        }
    }
}
