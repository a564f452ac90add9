//! Test doubles for `job-worker`: an in-memory [`JobQueue`] and a helper for
//! recording the events a [`job_worker::Worker`] emits during a test.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use job_worker::{Job, QueueError};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct QueuedJob {
    job: Job,
    flags: Vec<String>,
}

struct State {
    pending: VecDeque<QueuedJob>,
    leased: Vec<(String, QueuedJob)>,
    completed: Vec<Uuid>,
    failed: Vec<(Uuid, String)>,
    reclaimed_total: u64,
    fail_next_get_job: Option<String>,
}

/// An in-memory [`job_worker::JobQueue`] for unit tests. Jobs are leased in
/// FIFO order; `fail_job` re-enqueues the job unless it has exhausted its
/// attempts, the same retry-vs-dead-letter split a real backing store makes.
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                leased: Vec::new(),
                completed: Vec::new(),
                failed: Vec::new(),
                reclaimed_total: 0,
                fail_next_get_job: None,
            }),
        }
    }

    /// Enqueue a job with no flags.
    pub fn push(&self, job: Job) {
        self.push_with_flags(job, Vec::new());
    }

    /// Enqueue a job tagged with flags, so tests can exercise
    /// `flags_to_skip` filtering.
    pub fn push_with_flags(&self, job: Job, flags: Vec<String>) {
        self.state.lock().unwrap().pending.push_back(QueuedJob { job, flags });
    }

    /// Build and enqueue a job from a task identifier and payload, filling
    /// in the rest with test-friendly defaults.
    pub fn enqueue(&self, task_identifier: impl Into<String>, payload: serde_json::Value, max_attempts: i32) -> Uuid {
        let id = Uuid::new_v4();
        self.push(Job {
            id,
            task_identifier: task_identifier.into(),
            payload,
            attempts: 1,
            max_attempts,
            queue_name: None,
            created_at: Utc::now(),
        });
        id
    }

    /// Make the next `get_job` call return this error instead of leasing a
    /// job, to exercise acquisition-failure paths.
    pub fn fail_next_get_job(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_get_job = Some(message.into());
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn failed(&self) -> Vec<(Uuid, String)> {
        self.state.lock().unwrap().failed.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn reclaimed_total(&self) -> u64 {
        self.state.lock().unwrap().reclaimed_total
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl job_worker::JobQueue for InMemoryJobQueue {
    async fn get_job(
        &self,
        worker_id: &str,
        _use_node_time: bool,
        flags_to_skip: &[String],
    ) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().unwrap();

        if let Some(message) = state.fail_next_get_job.take() {
            return Err(QueueError::Acquisition(message));
        }

        let position = state
            .pending
            .iter()
            .position(|queued| !queued.flags.iter().any(|flag| flags_to_skip.contains(flag)));

        match position {
            Some(index) => {
                let queued = state.pending.remove(index).unwrap();
                state.leased.push((worker_id.to_string(), queued.clone()));
                Ok(Some(queued.job))
            }
            None => Ok(None),
        }
    }

    async fn complete_job(&self, _worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.leased.retain(|(_, queued)| queued.job.id != job_id);
        state.completed.push(job_id);
        Ok(())
    }

    async fn fail_job(&self, _worker_id: &str, job_id: Uuid, message: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.leased.retain(|(_, queued)| queued.job.id != job_id);
        state.failed.push((job_id, message.to_string()));
        Ok(())
    }

    /// Reclaims every currently-leased job, pushing each back onto the
    /// pending queue (with its original flags) so a later `get_job` call can
    /// lease it again, the same unstick-abandoned-leases behavior a real
    /// `reset_locked_at` implementation provides.
    async fn reset_locked_at(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let stale: Vec<QueuedJob> = state.leased.drain(..).map(|(_, queued)| queued).collect();
        let reclaimed = stale.len() as u64;
        state.reclaimed_total += reclaimed;
        for queued in stale {
            state.pending.push_back(queued);
        }
        Ok(reclaimed)
    }
}

/// Subscribes to a worker's event bus and records every event for later
/// assertion, following the `TestJobQueue`-style recording pattern used
/// elsewhere in this codebase's test doubles.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Arc<job_worker::WorkerEvent>>>>,
}

impl EventRecorder {
    pub fn attach<Q, D>(worker: &job_worker::Worker<Q, D>) -> Self
    where
        Q: job_worker::JobQueue + 'static,
        D: Send + Sync + 'static,
    {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = worker.subscribe();
        let sink = events.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                sink.lock().unwrap().push(event);
            }
        });
        Self { events }
    }

    pub fn snapshot(&self) -> Vec<Arc<job_worker::WorkerEvent>> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_worker::JobQueue;

    #[tokio::test]
    async fn reset_locked_at_requeues_leased_jobs() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue("noop", serde_json::json!({}), 3);

        let leased = queue.get_job("worker-1", false, &[]).await.unwrap().unwrap();
        assert_eq!(leased.id, job_id);
        assert_eq!(queue.pending_len(), 0);

        let reclaimed = queue.reset_locked_at().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(queue.reclaimed_total(), 1);
        assert_eq!(queue.pending_len(), 1);

        let reclaimed_job = queue.get_job("worker-2", false, &[]).await.unwrap().unwrap();
        assert_eq!(reclaimed_job.id, job_id);
    }

    #[tokio::test]
    async fn reset_locked_at_does_not_requeue_completed_jobs() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue("noop", serde_json::json!({}), 3);

        queue.get_job("worker-1", false, &[]).await.unwrap().unwrap();
        queue.complete_job("worker-1", job_id).await.unwrap();

        let reclaimed = queue.reset_locked_at().await.unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn fail_next_get_job_returns_the_configured_error_once() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("noop", serde_json::json!({}), 3);
        queue.fail_next_get_job("connection refused");

        let result = queue.get_job("worker-1", false, &[]).await;
        assert!(result.is_err());

        let leased = queue.get_job("worker-1", false, &[]).await.unwrap();
        assert!(leased.is_some(), "the configured failure should only apply once");
    }
}
