//! Task admission and queueing.
//!
//! One mutex guards the whole tuple (active set, sorted queue, per-host
//! counts). Admission honors the global concurrency cap and per-host
//! fairness; the queue is ordered by priority then creation time, with no
//! aging. An URGENT submission may preempt the lowest-priority active task.

mod host;

pub use host::host_of;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorEvent, DownloadCoordinator};
use crate::engine::tasks::TaskSet;
use crate::request::Priority;
use crate::state::DownloadState;
use crate::store::TaskId;

struct ActiveEntry {
    host: String,
    priority: Priority,
}

#[derive(Clone)]
struct QueuedEntry {
    task_id: TaskId,
    host: String,
    priority: Priority,
    created_at: i64,
    /// Continue from persisted state instead of starting fresh (preempted
    /// or rescheduled tasks).
    prefer_resume: bool,
}

#[derive(Default)]
struct QueueState {
    active: HashMap<TaskId, ActiveEntry>,
    queued: Vec<QueuedEntry>,
    host_counts: HashMap<String, usize>,
}

impl QueueState {
    fn host_count(&self, host: &str) -> usize {
        self.host_counts.get(host).copied().unwrap_or(0)
    }

    fn insert_active(&mut self, task_id: &str, host: String, priority: Priority) {
        *self.host_counts.entry(host.clone()).or_insert(0) += 1;
        self.active.insert(task_id.to_string(), ActiveEntry { host, priority });
    }

    fn remove_active(&mut self, task_id: &str) -> Option<ActiveEntry> {
        let entry = self.active.remove(task_id)?;
        if let Some(count) = self.host_counts.get_mut(&entry.host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.host_counts.remove(&entry.host);
            }
        }
        Some(entry)
    }

    /// Keeps the queue sorted: higher priority first, then earlier
    /// creation time.
    fn insert_queued(&mut self, entry: QueuedEntry) {
        let pos = self
            .queued
            .iter()
            .position(|e| {
                e.priority < entry.priority
                    || (e.priority == entry.priority && e.created_at > entry.created_at)
            })
            .unwrap_or(self.queued.len());
        self.queued.insert(pos, entry);
    }

    fn take_queued(&mut self, task_id: &str) -> Option<QueuedEntry> {
        let pos = self.queued.iter().position(|e| e.task_id == task_id)?;
        Some(self.queued.remove(pos))
    }

    /// First queued entry whose host is under the per-host limit.
    fn next_startable(&mut self, max_per_host: usize) -> Option<QueuedEntry> {
        let pos = self
            .queued
            .iter()
            .position(|e| self.host_count(&e.host) < max_per_host)?;
        Some(self.queued.remove(pos))
    }
}

enum Admission {
    Start,
    Queue,
    Preempt { victim: TaskId, start_now: bool },
}

pub struct Scheduler {
    config: EngineConfig,
    tasks: Arc<TaskSet>,
    coordinator: Arc<DownloadCoordinator>,
    state: Mutex<QueueState>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        tasks: Arc<TaskSet>,
        coordinator: Arc<DownloadCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tasks,
            coordinator,
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Consumes run-ended notifications from the coordinator, freeing the
    /// slot and promoting queued work.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CoordinatorEvent::RunEnded { task_id } => this.task_finished(&task_id).await,
                }
            }
        })
    }

    /// Admits a task: starts it when limits allow, preempts for URGENT, or
    /// queues it sorted.
    pub async fn enqueue(self: &Arc<Self>, task_id: &str, prefer_resume: bool) {
        let Some(shared) = self.tasks.get(task_id) else {
            tracing::warn!(task_id = %task_id, "enqueue for unknown task");
            return;
        };
        let request = shared.request();
        let host = host_of(&request.url);
        let priority = request.priority;
        let entry = QueuedEntry {
            task_id: task_id.to_string(),
            host: host.clone(),
            priority,
            created_at: shared.created_at,
            prefer_resume,
        };

        let admission = {
            let mut st = self.state.lock().await;
            if st.active.contains_key(task_id) {
                return;
            }
            st.queued.retain(|e| e.task_id != task_id);

            if self.config.autostart
                && st.active.len() < self.config.max_concurrent_downloads
                && st.host_count(&host) < self.config.max_downloads_per_host
            {
                st.insert_active(task_id, host, priority);
                Admission::Start
            } else if priority == Priority::Urgent && self.config.autostart {
                let victim = st
                    .active
                    .iter()
                    .filter(|(_, e)| e.priority < Priority::Urgent)
                    .min_by_key(|(_, e)| e.priority)
                    .map(|(id, _)| id.clone());
                match victim.and_then(|id| st.remove_active(&id).map(|e| (id, e))) {
                    Some((victim_id, removed)) => {
                        let victim_created = self
                            .tasks
                            .get(&victim_id)
                            .map(|s| s.created_at)
                            .unwrap_or(0);
                        st.insert_queued(QueuedEntry {
                            task_id: victim_id.clone(),
                            host: removed.host,
                            priority: removed.priority,
                            created_at: victim_created,
                            prefer_resume: true,
                        });
                        if st.active.len() < self.config.max_concurrent_downloads
                            && st.host_count(&host) < self.config.max_downloads_per_host
                        {
                            st.insert_active(task_id, host, priority);
                            Admission::Preempt { victim: victim_id, start_now: true }
                        } else {
                            st.insert_queued(entry);
                            Admission::Preempt { victim: victim_id, start_now: false }
                        }
                    }
                    None => {
                        st.insert_queued(entry);
                        Admission::Queue
                    }
                }
            } else {
                st.insert_queued(entry);
                Admission::Queue
            }
        };

        match admission {
            Admission::Start => {
                if !self.launch(task_id, prefer_resume).await {
                    self.task_finished(task_id).await;
                }
            }
            Admission::Queue => shared.set_state(DownloadState::Queued),
            Admission::Preempt { victim, start_now } => {
                tracing::info!(task_id = %task_id, victim = %victim, "urgent task preempts");
                if let Err(e) = self.coordinator.pause(&victim).await {
                    tracing::warn!(victim = %victim, error = %e, "preemption pause failed");
                }
                if start_now {
                    if !self.launch(task_id, prefer_resume).await {
                        self.task_finished(task_id).await;
                    }
                } else {
                    shared.set_state(DownloadState::Queued);
                }
            }
        }
    }

    /// Removes a task from queue or active tracking (user cancel/remove).
    pub async fn dequeue(self: &Arc<Self>, task_id: &str) {
        let was_active = {
            let mut st = self.state.lock().await;
            if st.take_queued(task_id).is_some() {
                false
            } else {
                st.remove_active(task_id).is_some()
            }
        };
        if was_active {
            self.promote_next().await;
        }
    }

    pub async fn set_priority(self: &Arc<Self>, task_id: &str, priority: Priority) {
        {
            let mut st = self.state.lock().await;
            if let Some(entry) = st.active.get_mut(task_id) {
                entry.priority = priority;
            } else if let Some(mut entry) = st.take_queued(task_id) {
                entry.priority = priority;
                st.insert_queued(entry);
            }
        }
        self.promote_next().await;
    }

    pub async fn is_queued(&self, task_id: &str) -> bool {
        self.state
            .lock()
            .await
            .queued
            .iter()
            .any(|e| e.task_id == task_id)
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    async fn task_finished(self: &Arc<Self>, task_id: &str) {
        {
            let mut st = self.state.lock().await;
            st.remove_active(task_id);
        }
        self.promote_next().await;
    }

    /// Fills free slots from the queue in order, skipping host-saturated
    /// entries.
    async fn promote_next(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut st = self.state.lock().await;
                if st.active.len() >= self.config.max_concurrent_downloads {
                    return;
                }
                let Some(entry) = st.next_startable(self.config.max_downloads_per_host) else {
                    return;
                };
                st.insert_active(&entry.task_id, entry.host.clone(), entry.priority);
                entry
            };
            if !self.launch(&entry.task_id, entry.prefer_resume).await {
                let mut st = self.state.lock().await;
                st.remove_active(&entry.task_id);
            }
        }
    }

    /// Starts or resumes the task via the coordinator. A resume that finds
    /// no persisted state falls back to a fresh start. Returns whether a
    /// run is now active.
    async fn launch(self: &Arc<Self>, task_id: &str, prefer_resume: bool) -> bool {
        if prefer_resume {
            match self.coordinator.resume(task_id).await {
                Ok(true) => true,
                Ok(false) => self.launch_fresh(task_id).await,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "resume failed, starting fresh");
                    self.launch_fresh(task_id).await
                }
            }
        } else {
            self.launch_fresh(task_id).await
        }
    }

    async fn launch_fresh(self: &Arc<Self>, task_id: &str) -> bool {
        match self.coordinator.start(task_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "start failed");
                if let Some(shared) = self.tasks.get(task_id) {
                    shared.set_state(DownloadState::Failed { error: e });
                }
                false
            }
        }
    }
}
