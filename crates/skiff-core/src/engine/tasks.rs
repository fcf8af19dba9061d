//! Observable task registry.
//!
//! Each task owns a pair of watch channels (state, segment plan) that exist
//! from submission to removal, independent of whether a run is active.
//! Frontends hold [`TaskHandle`]s; engine components hold [`TaskShared`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

use crate::request::DownloadRequest;
use crate::segment::Segment;
use crate::state::DownloadState;
use crate::store::TaskId;

/// Engine-internal view of one task: request plus its live publishers.
pub struct TaskShared {
    pub task_id: TaskId,
    /// Epoch milliseconds; queue ordering tiebreak.
    pub created_at: i64,
    request: RwLock<DownloadRequest>,
    state_tx: Arc<watch::Sender<DownloadState>>,
    segments_tx: Arc<watch::Sender<Vec<Segment>>>,
}

impl TaskShared {
    fn new(
        task_id: TaskId,
        request: DownloadRequest,
        created_at: i64,
        initial_state: DownloadState,
        segments: Vec<Segment>,
    ) -> Self {
        Self {
            task_id,
            created_at,
            request: RwLock::new(request),
            state_tx: Arc::new(watch::Sender::new(initial_state)),
            segments_tx: Arc::new(watch::Sender::new(segments)),
        }
    }

    pub fn request(&self) -> DownloadRequest {
        self.request.read().unwrap().clone()
    }

    pub fn update_request(&self, mutate: impl FnOnce(&mut DownloadRequest)) {
        mutate(&mut self.request.write().unwrap());
    }

    pub fn state(&self) -> DownloadState {
        self.state_tx.borrow().clone()
    }

    pub fn set_state(&self, state: DownloadState) {
        self.state_tx.send_replace(state);
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.segments_tx.borrow().clone()
    }

    pub fn set_segments(&self, segments: Vec<Segment>) {
        self.segments_tx.send_replace(segments);
    }

    pub(crate) fn state_sender(&self) -> Arc<watch::Sender<DownloadState>> {
        Arc::clone(&self.state_tx)
    }

    pub(crate) fn segments_sender(&self) -> Arc<watch::Sender<Vec<Segment>>> {
        Arc::clone(&self.segments_tx)
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id.clone(),
            created_at: self.created_at,
            url: self.request.read().unwrap().url.clone(),
            state: self.state_tx.subscribe(),
            segments: self.segments_tx.subscribe(),
        }
    }
}

/// Frontend view of one task: identity plus its observable streams.
/// Operations (pause, resume, cancel, …) live on [`crate::engine::Engine`].
#[derive(Clone)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub created_at: i64,
    pub url: String,
    state: watch::Receiver<DownloadState>,
    segments: watch::Receiver<Vec<Segment>>,
}

impl TaskHandle {
    pub fn state(&self) -> DownloadState {
        self.state.borrow().clone()
    }

    pub fn state_stream(&self) -> watch::Receiver<DownloadState> {
        self.state.clone()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.segments.borrow().clone()
    }

    pub fn segments_stream(&self) -> watch::Receiver<Vec<Segment>> {
        self.segments.clone()
    }

    /// Waits until the state satisfies `pred` and returns it. Returns the
    /// last seen state if the task is removed first.
    pub async fn wait_for(&self, pred: impl Fn(&DownloadState) -> bool) -> DownloadState {
        let mut rx = self.state.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }
}

/// All live tasks, re-published as a list whenever membership changes.
pub struct TaskSet {
    inner: Mutex<HashMap<TaskId, Arc<TaskShared>>>,
    handles_tx: Arc<watch::Sender<Vec<TaskHandle>>>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            handles_tx: Arc::new(watch::Sender::new(Vec::new())),
        }
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        task_id: TaskId,
        request: DownloadRequest,
        created_at: i64,
        initial_state: DownloadState,
        segments: Vec<Segment>,
    ) -> Arc<TaskShared> {
        let shared = Arc::new(TaskShared::new(
            task_id.clone(),
            request,
            created_at,
            initial_state,
            segments,
        ));
        self.inner.lock().unwrap().insert(task_id, Arc::clone(&shared));
        self.republish();
        shared
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskShared>> {
        self.inner.lock().unwrap().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskShared>> {
        let removed = self.inner.lock().unwrap().remove(task_id);
        if removed.is_some() {
            self.republish();
        }
        removed
    }

    pub fn all(&self) -> Vec<Arc<TaskShared>> {
        let mut out: Vec<Arc<TaskShared>> =
            self.inner.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| (a.created_at, &a.task_id).cmp(&(b.created_at, &b.task_id)));
        out
    }

    pub fn handles(&self) -> watch::Receiver<Vec<TaskHandle>> {
        self.handles_tx.subscribe()
    }

    fn republish(&self) {
        let handles: Vec<TaskHandle> = self.all().iter().map(|s| s.handle()).collect();
        self.handles_tx.send_replace(handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DownloadProgress;

    fn register(set: &TaskSet, id: &str, at: i64) -> Arc<TaskShared> {
        set.register(
            id.into(),
            DownloadRequest::new("https://example.com/f"),
            at,
            DownloadState::Queued,
            Vec::new(),
        )
    }

    #[test]
    fn register_get_remove() {
        let set = TaskSet::new();
        register(&set, "a", 1);
        assert!(set.get("a").is_some());
        assert!(set.get("b").is_none());
        set.remove("a");
        assert!(set.get("a").is_none());
    }

    #[test]
    fn handles_list_tracks_membership_sorted() {
        let set = TaskSet::new();
        register(&set, "b", 20);
        register(&set, "a", 10);
        let handles = set.handles();
        let ids: Vec<String> = handles.borrow().iter().map(|h| h.task_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        set.remove("a");
        let ids: Vec<String> = handles.borrow().iter().map(|h| h.task_id.clone()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn state_flows_to_handles() {
        let set = TaskSet::new();
        let shared = register(&set, "a", 1);
        let handle = shared.handle();
        assert_eq!(handle.state(), DownloadState::Queued);

        shared.set_state(DownloadState::Downloading {
            progress: DownloadProgress::new(5, 10, 1),
        });
        let state = handle.wait_for(|s| s.is_active()).await;
        assert!(matches!(state, DownloadState::Downloading { .. }));
    }

    #[test]
    fn update_request_is_visible() {
        let set = TaskSet::new();
        let shared = register(&set, "a", 1);
        shared.update_request(|r| r.connections = 9);
        assert_eq!(shared.request().connections, 9);
    }
}
