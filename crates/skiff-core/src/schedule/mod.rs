//! Deferred task starts.
//!
//! A scheduled task waits for its wall-clock trigger, then for every
//! attached condition to hold simultaneously, and only then enters the
//! queue. Conditions are transient: they are not persisted, and tasks that
//! were waiting on them restore as queued after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::engine::tasks::TaskSet;
use crate::request::Schedule;
use crate::scheduler::Scheduler;
use crate::state::DownloadState;
use crate::store::TaskId;

/// An external gate a download may wait on (network type, charging state,
/// …). `is_met()` returns a boolean stream; the manager waits until every
/// condition's latest value is true at the same time.
pub trait DownloadCondition: Send + Sync {
    fn is_met(&self) -> watch::Receiver<bool>;

    fn describe(&self) -> &str {
        "condition"
    }
}

pub struct ScheduleManager {
    tasks: Arc<TaskSet>,
    scheduler: Arc<Scheduler>,
    waiters: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl ScheduleManager {
    pub fn new(tasks: Arc<TaskSet>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            scheduler,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Defers the task per its request's schedule and conditions; enqueues
    /// right away when there is nothing to wait for.
    pub async fn schedule(self: &Arc<Self>, task_id: &str, prefer_resume: bool) {
        let Some(shared) = self.tasks.get(task_id) else {
            tracing::warn!(task_id = %task_id, "schedule for unknown task");
            return;
        };
        let request = shared.request();
        let schedule = request.schedule;
        let conditions = request.conditions.clone();

        if schedule.is_immediate() && conditions.is_empty() {
            self.scheduler.enqueue(task_id, prefer_resume).await;
            return;
        }

        shared.set_state(DownloadState::Scheduled { schedule });

        let this = Arc::clone(self);
        let id = task_id.to_string();
        let waiter = tokio::spawn(async move {
            wait_until_due(schedule).await;
            wait_for_conditions(&conditions).await;
            this.waiters.lock().await.remove(&id);
            this.scheduler.enqueue(&id, prefer_resume).await;
        });

        let mut waiters = self.waiters.lock().await;
        if let Some(previous) = waiters.insert(task_id.to_string(), waiter) {
            previous.abort();
        }
    }

    /// Cancels any existing waiter and schedules anew. The task re-enters
    /// the queue as a continuation, not a fresh start.
    pub async fn reschedule(self: &Arc<Self>, task_id: &str) {
        self.cancel(task_id).await;
        self.schedule(task_id, true).await;
    }

    pub async fn cancel(&self, task_id: &str) {
        if let Some(waiter) = self.waiters.lock().await.remove(task_id) {
            waiter.abort();
        }
    }

    pub async fn is_waiting(&self, task_id: &str) -> bool {
        self.waiters.lock().await.contains_key(task_id)
    }

    pub async fn shutdown(&self) {
        for (_, waiter) in self.waiters.lock().await.drain() {
            waiter.abort();
        }
    }
}

async fn wait_until_due(schedule: Schedule) {
    match schedule {
        Schedule::Immediate => {}
        Schedule::AfterDelay { delay_ms } => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Schedule::AtTime { at_epoch_ms } => {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            if at_epoch_ms > now_ms {
                tokio::time::sleep(Duration::from_millis(at_epoch_ms - now_ms)).await;
            }
        }
    }
}

/// Resolves once every condition's current value is true simultaneously. A
/// condition whose provider went away counts as satisfied.
async fn wait_for_conditions(conditions: &[Arc<dyn DownloadCondition>]) {
    let mut receivers: Vec<watch::Receiver<bool>> =
        conditions.iter().map(|c| c.is_met()).collect();
    let mut open: Vec<bool> = vec![true; receivers.len()];

    loop {
        let all_met = receivers
            .iter()
            .zip(&open)
            .all(|(rx, open)| !open || *rx.borrow());
        if all_met {
            return;
        }

        let waits = receivers
            .iter_mut()
            .zip(open.iter_mut())
            .filter(|(_, open)| **open)
            .map(|(rx, open)| {
                Box::pin(async move {
                    if rx.changed().await.is_err() {
                        *open = false;
                    }
                })
            })
            .collect::<Vec<_>>();
        if waits.is_empty() {
            return;
        }
        futures::future::select_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCondition {
        tx: Arc<watch::Sender<bool>>,
    }

    impl TestCondition {
        fn new(initial: bool) -> (Arc<Self>, Arc<watch::Sender<bool>>) {
            let tx = Arc::new(watch::Sender::new(initial));
            (Arc::new(Self { tx: Arc::clone(&tx) }), tx)
        }
    }

    impl DownloadCondition for TestCondition {
        fn is_met(&self) -> watch::Receiver<bool> {
            self.tx.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_conditions_resolve_immediately() {
        wait_for_conditions(&[]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_all_conditions_jointly() {
        let (a, a_tx) = TestCondition::new(false);
        let (b, b_tx) = TestCondition::new(true);
        let conditions: Vec<Arc<dyn DownloadCondition>> = vec![a, b];

        let wait = tokio::spawn(async move { wait_for_conditions(&conditions).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wait.is_finished());

        // Flip b off, a on: still not jointly true.
        b_tx.send_replace(false);
        a_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wait.is_finished());

        b_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("conditions jointly true")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_schedule_waits() {
        let start = tokio::time::Instant::now();
        wait_until_due(Schedule::AfterDelay { delay_ms: 5000 }).await;
        assert!(start.elapsed() >= Duration::from_millis(4999));
    }

    #[tokio::test(start_paused = true)]
    async fn past_at_time_fires_immediately() {
        let start = tokio::time::Instant::now();
        wait_until_due(Schedule::AtTime { at_epoch_ms: 0 }).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
