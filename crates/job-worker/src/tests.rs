use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{Job, JobHelpers, JobQueue, QueueError, TaskHandler, WorkerBuilder, WorkerOptions};

struct MockQueue {
    pending: Mutex<VecDeque<Job>>,
    completed: Mutex<Vec<Uuid>>,
    failed: Mutex<Vec<(Uuid, String)>>,
    get_job_calls: AtomicU32,
    fail_every_get_job: bool,
}

impl MockQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            get_job_calls: AtomicU32::new(0),
            fail_every_get_job: false,
        }
    }

    fn always_failing() -> Self {
        Self {
            fail_every_get_job: true,
            ..Self::new()
        }
    }

    fn push(&self, task_identifier: &str, attempts: i32, max_attempts: i32) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.lock().unwrap().push_back(Job {
            id,
            task_identifier: task_identifier.to_string(),
            payload: serde_json::json!({}),
            attempts,
            max_attempts,
            queue_name: None,
            created_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl JobQueue for MockQueue {
    async fn get_job(&self, _worker_id: &str, _use_node_time: bool, _flags: &[String]) -> Result<Option<Job>, QueueError> {
        self.get_job_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_every_get_job {
            return Err(QueueError::Acquisition("connection refused".to_string()));
        }
        Ok(self.pending.lock().unwrap().pop_front())
    }

    async fn complete_job(&self, _worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        self.completed.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn fail_job(&self, _worker_id: &str, job_id: Uuid, message: &str) -> Result<(), QueueError> {
        self.failed.lock().unwrap().push((job_id, message.to_string()));
        Ok(())
    }

    async fn reset_locked_at(&self) -> Result<u64, QueueError> {
        Ok(0)
    }
}

struct NoopDeps;

struct Succeeds;

#[async_trait]
impl TaskHandler<NoopDeps> for Succeeds {
    async fn run(&self, _payload: serde_json::Value, _helpers: JobHelpers<'_, NoopDeps>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct SlowSucceeds;

#[async_trait]
impl TaskHandler<NoopDeps> for SlowSucceeds {
    async fn run(&self, _payload: serde_json::Value, _helpers: JobHelpers<'_, NoopDeps>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl TaskHandler<NoopDeps> for AlwaysFails {
    async fn run(&self, _payload: serde_json::Value, _helpers: JobHelpers<'_, NoopDeps>) -> anyhow::Result<()> {
        anyhow::bail!("handler blew up")
    }
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(10),
        max_contiguous_errors: 3,
        ..WorkerOptions::default()
    }
}

#[tokio::test]
async fn happy_path_emits_events_in_order() {
    let queue = std::sync::Arc::new(MockQueue::new());
    let job_id = queue.push("succeed", 1, 3);

    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_task("succeed", Succeeds)
        .with_options(fast_options())
        .build();

    let mut rx = worker.subscribe();
    let mut seen = Vec::new();
    while seen.len() < 7 {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive within a second")
            .unwrap();
        seen.push((*event).clone());
    }

    worker.release();

    use crate::WorkerEvent::*;
    let names: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            Create { .. } => "create",
            GetJobStart => "get_job_start",
            GetJobEmpty => "get_job_empty",
            GetJobError { .. } => "get_job_error",
            JobStart { .. } => "job_start",
            JobSuccess { .. } => "job_success",
            JobError { .. } => "job_error",
            JobFailed { .. } => "job_failed",
            JobComplete { .. } => "job_complete",
            FatalError { .. } => "fatal_error",
            Release => "release",
            Stop { .. } => "stop",
        })
        .collect();

    assert_eq!(
        names,
        vec![
            "create",
            "get_job_start",
            "job_start",
            "job_success",
            "job_complete",
            "get_job_start",
            "get_job_empty",
        ]
    );
    if let JobStart { job } = &seen[2] {
        assert_eq!(job.id, job_id);
    } else {
        panic!("expected job_start at index 2");
    }
}

#[tokio::test]
async fn happy_path_completes_the_job() {
    let queue = std::sync::Arc::new(MockQueue::new());
    let job_id = queue.push("succeed", 1, 3);

    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_task("succeed", Succeeds)
        .with_options(fast_options())
        .continuous(false)
        .build();

    worker.completion().wait().await.expect("worker should finish cleanly");
    assert_eq!(queue.completed.lock().unwrap().as_slice(), [job_id]);
}

#[tokio::test]
async fn handler_error_with_retries_remaining_calls_fail_job_not_complete_job() {
    let queue = std::sync::Arc::new(MockQueue::new());
    queue.push("flaky", 1, 3);

    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_task("flaky", AlwaysFails)
        .with_options(fast_options())
        .continuous(false)
        .build();

    worker.completion().wait().await.expect("acquisition-empty stop is not an error");
    assert_eq!(queue.failed.lock().unwrap().len(), 1);
    assert!(queue.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn handler_error_with_retries_exhausted_emits_job_failed_before_complete() {
    let queue = std::sync::Arc::new(MockQueue::new());
    let job_id = queue.push("flaky", 3, 3);

    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_task("flaky", AlwaysFails)
        .with_options(fast_options())
        .build();

    let mut rx = worker.subscribe();
    let mut seen = Vec::new();
    while seen.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive within a second")
            .unwrap();
        seen.push((*event).clone());
    }
    worker.release();

    use crate::WorkerEvent::*;
    let names: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            Create { .. } => "create",
            GetJobStart => "get_job_start",
            GetJobEmpty => "get_job_empty",
            GetJobError { .. } => "get_job_error",
            JobStart { .. } => "job_start",
            JobSuccess { .. } => "job_success",
            JobError { .. } => "job_error",
            JobFailed { .. } => "job_failed",
            JobComplete { .. } => "job_complete",
            FatalError { .. } => "fatal_error",
            Release => "release",
            Stop { .. } => "stop",
        })
        .collect();

    assert_eq!(
        names,
        vec!["create", "get_job_start", "job_start", "job_error", "job_failed"],
        "job_error and job_failed must both fire, in that order, before job_complete"
    );

    let failed = queue.failed.lock().unwrap();
    assert_eq!(failed.as_slice(), [(job_id, "handler blew up".to_string())]);
}

#[tokio::test]
async fn unsupported_task_is_reported_as_a_failure() {
    let queue = std::sync::Arc::new(MockQueue::new());
    queue.push("no_such_handler", 1, 3);

    let worker = WorkerBuilder::<MockQueueHandle, NoopDeps>::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_options(fast_options())
        .continuous(false)
        .build();

    worker.completion().wait().await.unwrap();
    let failed = queue.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.contains("Unsupported task"));
}

#[tokio::test]
async fn contiguous_acquisition_failures_settle_completion_with_an_error() {
    let queue = std::sync::Arc::new(MockQueue::always_failing());
    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_options(fast_options())
        .build();
    let mut rx = worker.subscribe();

    let outcome = worker.completion().wait().await;
    assert!(matches!(
        outcome,
        Err(crate::WorkerError::ContiguousAcquisitionFailures { count: 3, .. })
    ));
    assert_eq!(queue.get_job_calls.load(Ordering::SeqCst), 3, "no polling after the threshold is hit");

    assert_release_precedes_stop(&mut rx).await;
}

#[tokio::test]
async fn draining_a_non_continuous_worker_emits_release_before_stop() {
    let queue = std::sync::Arc::new(MockQueue::new());
    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_options(fast_options())
        .continuous(false)
        .build();
    let mut rx = worker.subscribe();

    worker.completion().wait().await.expect("draining an empty queue is not an error");

    assert_release_precedes_stop(&mut rx).await;
}

/// Drains `rx` until `Stop` is seen, asserting `Release` was observed first,
/// per the ordering guarantee that `worker:release` precedes the settling of
/// `completion` (and therefore `worker:stop`, which fires only after
/// settlement).
async fn assert_release_precedes_stop(rx: &mut tokio::sync::broadcast::Receiver<std::sync::Arc<crate::WorkerEvent>>) {
    let mut saw_release = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive within a second")
            .unwrap();
        match &*event {
            crate::WorkerEvent::Release => saw_release = true,
            crate::WorkerEvent::Stop { .. } => {
                assert!(saw_release, "worker:release must precede worker:stop");
                return;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn nudge_wakes_an_idle_worker_immediately() {
    let queue = std::sync::Arc::new(MockQueue::new());
    let worker = WorkerBuilder::new(
        MockQueueHandle(queue.clone()),
        NoopDeps,
    )
    .with_options(WorkerOptions {
        poll_interval: Duration::from_secs(60),
        ..WorkerOptions::default()
    })
    .build();

    // Let the worker reach its idle poll-interval wait.
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.push("succeed_after_nudge", 1, 3);
    assert!(worker.nudge(), "worker should have been idle and woken immediately");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.get_job_calls.load(Ordering::SeqCst) >= 2);

    worker.release();
}

#[tokio::test]
async fn release_lets_an_in_flight_job_finish_before_stopping() {
    let queue = std::sync::Arc::new(MockQueue::new());
    queue.push("succeed", 1, 3);

    let worker = WorkerBuilder::new(MockQueueHandle(queue.clone()), NoopDeps)
        .with_task("succeed", SlowSucceeds)
        .with_options(fast_options())
        .build();

    // Give the loop time to lease the job and start the (slow) handler
    // before asking the worker to release, so this actually exercises
    // "release while a job is in flight" rather than "release before the
    // loop ever ran".
    tokio::time::sleep(Duration::from_millis(10)).await;
    worker.release();

    worker.completion().wait().await.expect("release should resolve completion without an error");
    assert_eq!(queue.completed.lock().unwrap().len(), 1);
}

/// Lets several `WorkerBuilder`s in these tests share one `MockQueue` by
/// cloning an `Arc` handle while still satisfying `JobQueue`'s object
/// requirements, since `Worker` takes ownership of its queue.
struct MockQueueHandle(std::sync::Arc<MockQueue>);

#[async_trait]
impl JobQueue for MockQueueHandle {
    async fn get_job(&self, worker_id: &str, use_node_time: bool, flags: &[String]) -> Result<Option<Job>, QueueError> {
        self.0.get_job(worker_id, use_node_time, flags).await
    }

    async fn complete_job(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        self.0.complete_job(worker_id, job_id).await
    }

    async fn fail_job(&self, worker_id: &str, job_id: Uuid, message: &str) -> Result<(), QueueError> {
        self.0.fail_job(worker_id, job_id, message).await
    }

    async fn reset_locked_at(&self) -> Result<u64, QueueError> {
        self.0.reset_locked_at().await
    }
}
