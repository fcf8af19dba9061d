//! End-to-end engine scenarios over the scriptable mock transport.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skiff_core::config::EngineConfig;
use skiff_core::engine::Engine;
use skiff_core::error::DownloadError;
use skiff_core::request::{DownloadRequest, Priority, Schedule};
use skiff_core::segment::downloaded_total;
use skiff_core::state::DownloadState;
use skiff_core::store::{MemoryTaskStore, TaskState, TaskStore};

use common::mock_transport::{pattern_body, throttle_429, MockTransport};

fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        default_directory: dir.to_path_buf(),
        save_interval_ms: 100,
        progress_interval_ms: 10,
        retry_delay_ms: 50,
        ..EngineConfig::default()
    }
}

fn build_engine(
    mock: &Arc<MockTransport>,
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
) -> Engine {
    Engine::builder(config)
        .transport(Arc::clone(mock) as Arc<dyn skiff_core::transport::HttpTransport>)
        .store(store)
        .build()
        .expect("engine builds")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn single_segment_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(1000);
    let mock = Arc::new(MockTransport::new(body.clone()).with_chunk_size(100));
    mock.set_info(|i| {
        i.accept_ranges = false;
        i.etag = None;
        i.last_modified = None;
    });
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let dest_dir = dir.path().join("d");
    let handle = engine
        .download(
            DownloadRequest::new("http://h/f")
                .with_destination(format!("{}/", dest_dir.display())),
        )
        .await
        .unwrap();

    let state = handle.wait_for(|s| s.is_terminal()).await;
    let path = match state {
        DownloadState::Completed { path } => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(Path::new(&path), dest_dir.join("f"));
    assert_eq!(std::fs::read(&path).unwrap(), body);

    let gets = mock.get_requests();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].range, None, "single GET without a Range header");

    let segments = handle.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!((segments[0].start, segments[0].end), (0, 999));
    assert!(segments[0].is_complete());
}

#[tokio::test]
async fn zero_byte_resource_completes_with_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTransport::new(Vec::new()));
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let out = dir.path().join("empty.bin");
    let handle = engine
        .download(
            DownloadRequest::new("http://h/empty.bin")
                .with_destination(out.to_string_lossy().into_owned()),
        )
        .await
        .unwrap();

    let state = handle.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    assert!(handle.segments().is_empty());
    assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
    assert!(mock.get_requests().is_empty(), "nothing to GET");
}

#[tokio::test]
async fn unknown_length_fails_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockTransport::new(pattern_body(100)));
    mock.set_info(|i| i.content_length = None);
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let handle = engine
        .download(DownloadRequest::new("http://h/stream"))
        .await
        .unwrap();
    let state = handle.wait_for(|s| s.is_terminal()).await;
    match state {
        DownloadState::Failed { error } => {
            assert!(matches!(error, DownloadError::Unsupported { .. }))
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn pause_then_resume_yields_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(500_000);
    let mock = Arc::new(MockTransport::new(body.clone()).with_chunk_size(25_000));
    let _gate = mock.gate_first_gets(1, 200_000);
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let engine = build_engine(&mock, test_config(dir.path()), Arc::clone(&store));

    let out = dir.path().join("big.bin");
    let handle = engine
        .download(
            DownloadRequest::new("http://h/big.bin")
                .with_destination(out.to_string_lossy().into_owned())
                .with_connections(1),
        )
        .await
        .unwrap();
    let task_id = handle.task_id.clone();

    {
        let handle = handle.clone();
        wait_until(move || downloaded_total(&handle.segments()) >= 200_000).await;
    }
    assert!(engine.pause(&task_id).await.unwrap());

    let state = handle.state();
    match &state {
        DownloadState::Paused { progress } => {
            assert_eq!(progress.downloaded_bytes, 200_000);
        }
        other => panic!("expected paused, got {:?}", other),
    }
    let record = store.load(&task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Paused);
    assert_eq!(record.downloaded_bytes, 200_000);
    assert!(record.segments.is_some());

    assert!(engine.resume(&task_id, None).await.unwrap());
    let state = handle.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    assert_eq!(std::fs::read(&out).unwrap(), body);

    let gets = mock.get_requests();
    let resume_get = gets.last().unwrap();
    assert_eq!(resume_get.range, Some((200_000, 499_999)));
}

#[tokio::test]
async fn urgent_preempts_and_both_complete() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(1_000_000);
    let mock = Arc::new(MockTransport::new(body.clone()).with_chunk_size(50_000));
    let _gate = mock.gate_first_gets(1, 300_000);
    let config = EngineConfig {
        max_concurrent_downloads: 1,
        ..test_config(dir.path())
    };
    let engine = build_engine(&mock, config, Arc::new(MemoryTaskStore::new()));

    let a_path = dir.path().join("a.bin");
    let normal = engine
        .download(
            DownloadRequest::new("http://h/a.bin")
                .with_destination(a_path.to_string_lossy().into_owned())
                .with_connections(1),
        )
        .await
        .unwrap();
    {
        let normal = normal.clone();
        wait_until(move || downloaded_total(&normal.segments()) >= 300_000).await;
    }

    let b_path = dir.path().join("b.bin");
    let urgent = engine
        .download(
            DownloadRequest::new("http://h/b.bin")
                .with_destination(b_path.to_string_lossy().into_owned())
                .with_connections(1)
                .with_priority(Priority::Urgent),
        )
        .await
        .unwrap();

    let paused = normal
        .wait_for(|s| matches!(s, DownloadState::Paused { .. }))
        .await;
    match paused {
        DownloadState::Paused { progress } => {
            assert!(progress.downloaded_bytes >= 300_000, "paused at 30%+")
        }
        other => panic!("expected paused, got {:?}", other),
    }

    let state = urgent.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    let state = normal.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));

    assert_eq!(std::fs::read(&a_path).unwrap(), body);
    assert_eq!(std::fs::read(&b_path).unwrap(), body);

    // The urgent GET went out before the preempted task's resume GET.
    let gets = mock.get_requests();
    let urgent_pos = gets.iter().position(|g| g.url.ends_with("b.bin")).unwrap();
    let resume_pos = gets
        .iter()
        .rposition(|g| g.url.ends_with("a.bin"))
        .unwrap();
    assert!(urgent_pos < resume_pos);
}

#[tokio::test(start_paused = true)]
async fn throttled_429_reduces_connections_and_backs_off() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(80_000);
    let mock = Arc::new(MockTransport::new(body.clone()).with_chunk_size(10_000));
    // The first plan splits 80 KB over 8 connections into 10 KB segments;
    // throttling every 10 KB GET keeps the first batch at zero progress no
    // matter which worker arrives first.
    mock.fail_gets_with_range_len(10_000, throttle_429(2, 2));
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let out = dir.path().join("limited.bin");
    let handle = engine
        .download(
            DownloadRequest::new("http://h/limited.bin")
                .with_destination(out.to_string_lossy().into_owned())
                .with_connections(8),
        )
        .await
        .unwrap();

    let state = handle.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    assert_eq!(std::fs::read(&out).unwrap(), body);

    let gets = mock.get_requests();
    assert!(gets.len() >= 3);
    // After the 429 the effective connection count is the server's hint:
    // exactly two workers finish the file.
    let mut final_ranges: Vec<(u64, u64)> = gets[gets.len() - 2..]
        .iter()
        .map(|g| g.range.unwrap())
        .collect();
    final_ranges.sort_unstable();
    assert_eq!(final_ranges, vec![(0, 39_999), (40_000, 79_999)]);

    // Retry-After is honored before the next attempt.
    let backoff = gets[gets.len() - 2].at - gets[0].at;
    assert!(backoff >= Duration::from_secs(2), "backoff was {:?}", backoff);
}

#[tokio::test]
async fn live_resegmentation_preserves_progress() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(1_000_000);
    let mock = Arc::new(MockTransport::new(body.clone()).with_chunk_size(50_000));
    let _gate = mock.gate_first_gets(2, 200_000);
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let out = dir.path().join("grow.bin");
    let handle = engine
        .download(
            DownloadRequest::new("http://h/grow.bin")
                .with_destination(out.to_string_lossy().into_owned())
                .with_connections(2),
        )
        .await
        .unwrap();
    let task_id = handle.task_id.clone();

    {
        let handle = handle.clone();
        wait_until(move || {
            let segments = handle.segments();
            segments.len() == 2 && downloaded_total(&segments) >= 400_000
        })
        .await;
    }

    engine.set_connections(&task_id, 4).await;

    {
        let handle = handle.clone();
        wait_until(move || handle.segments().len() == 6).await;
    }
    let plan = handle.segments();
    assert_eq!(downloaded_total(&plan), 400_000, "no progress lost");
    let complete: Vec<_> = plan.iter().filter(|s| s.is_complete()).collect();
    let pending: Vec<_> = plan.iter().filter(|s| !s.is_complete()).collect();
    assert_eq!(complete.len(), 2);
    assert!(complete.iter().all(|s| s.total_bytes() == 200_000));
    assert_eq!(pending.len(), 4);
    assert_eq!(pending.iter().map(|s| s.total_bytes()).sum::<u64>(), 600_000);

    let state = handle.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    assert_eq!(std::fs::read(&out).unwrap(), body);
    assert_eq!(downloaded_total(&handle.segments()), 1_000_000);
}

#[tokio::test]
async fn fresh_download_dedups_existing_filename() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(100);
    std::fs::write(dir.path().join("report.bin"), b"old contents").unwrap();

    let mock = Arc::new(MockTransport::new(body.clone()));
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let handle = engine
        .download(DownloadRequest::new("http://h/report.bin"))
        .await
        .unwrap();
    let state = handle.wait_for(|s| s.is_terminal()).await;
    let path = match state {
        DownloadState::Completed { path } => path,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(Path::new(&path), dir.path().join("report (1).bin"));
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert_eq!(
        std::fs::read(dir.path().join("report.bin")).unwrap(),
        b"old contents"
    );
}

#[tokio::test(start_paused = true)]
async fn delayed_schedule_defers_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(100);
    let mock = Arc::new(MockTransport::new(body.clone()));
    let engine = build_engine(
        &mock,
        test_config(dir.path()),
        Arc::new(MemoryTaskStore::new()),
    );

    let started = tokio::time::Instant::now();
    let handle = engine
        .download(
            DownloadRequest::new("http://h/later.bin")
                .with_destination(dir.path().join("later.bin").to_string_lossy().into_owned())
                .with_schedule(Schedule::AfterDelay { delay_ms: 60_000 }),
        )
        .await
        .unwrap();
    assert!(matches!(handle.state(), DownloadState::Scheduled { .. }));

    let state = handle.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    assert!(started.elapsed() >= Duration::from_millis(60_000));
}

#[tokio::test]
async fn queued_tasks_start_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(10_000);
    let mock = Arc::new(MockTransport::new(body.clone()));
    let _gate = mock.gate_first_gets(1, 0);
    let config = EngineConfig {
        max_concurrent_downloads: 1,
        ..test_config(dir.path())
    };
    let engine = build_engine(&mock, config, Arc::new(MemoryTaskStore::new()));

    let blocker = engine
        .download(
            DownloadRequest::new("http://h/one")
                .with_destination(dir.path().join("one").to_string_lossy().into_owned())
                .with_connections(1),
        )
        .await
        .unwrap();
    {
        let mock = Arc::clone(&mock);
        wait_until(move || !mock.get_requests().is_empty()).await;
    }

    let low = engine
        .download(
            DownloadRequest::new("http://h/low")
                .with_destination(dir.path().join("low").to_string_lossy().into_owned())
                .with_connections(1)
                .with_priority(Priority::Low),
        )
        .await
        .unwrap();
    let high = engine
        .download(
            DownloadRequest::new("http://h/high")
                .with_destination(dir.path().join("high").to_string_lossy().into_owned())
                .with_connections(1)
                .with_priority(Priority::High),
        )
        .await
        .unwrap();
    assert!(matches!(low.state(), DownloadState::Queued));
    assert!(matches!(high.state(), DownloadState::Queued));

    assert!(engine.cancel(&blocker.task_id).await.unwrap());
    let state = high.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));
    let state = low.wait_for(|s| s.is_terminal()).await;
    assert!(matches!(state, DownloadState::Completed { .. }));

    let urls: Vec<String> = mock
        .get_requests()
        .iter()
        .skip(1)
        .map(|g| g.url.clone())
        .collect();
    assert_eq!(urls, vec!["http://h/high", "http://h/low"]);
}

#[tokio::test]
async fn cancel_persists_canceled_and_clears_segments() {
    let dir = tempfile::tempdir().unwrap();
    let body = pattern_body(100_000);
    let mock = Arc::new(MockTransport::new(body).with_chunk_size(10_000));
    let _gate = mock.gate_first_gets(1, 20_000);
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let engine = build_engine(&mock, test_config(dir.path()), Arc::clone(&store));

    let handle = engine
        .download(
            DownloadRequest::new("http://h/gone.bin")
                .with_destination(dir.path().join("gone.bin").to_string_lossy().into_owned())
                .with_connections(1),
        )
        .await
        .unwrap();
    let task_id = handle.task_id.clone();
    {
        let handle = handle.clone();
        wait_until(move || downloaded_total(&handle.segments()) >= 20_000).await;
    }

    assert!(engine.cancel(&task_id).await.unwrap());
    assert!(matches!(handle.state(), DownloadState::Canceled));

    let record = store.load(&task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Canceled);
    assert!(record.segments.is_none());

    // A second cancel is a no-op on a terminal task.
    assert!(!engine.cancel(&task_id).await.unwrap());
}
