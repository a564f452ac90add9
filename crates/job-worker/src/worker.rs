use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, watch, Notify};

use crate::config::{random_worker_id, WorkerOptions};
use crate::error::WorkerError;
use crate::events::{EventBus, WorkerEvent};
use crate::job::Job;
use crate::queue::JobQueue;
use crate::registry::{JobHelpers, TaskHandler, TaskRegistry};

pub(crate) type Outcome = Result<(), WorkerError>;

/// State shared between the main loop task, the lease-recovery task, and
/// every cloned [`Worker`] handle. Nothing here is ever held across an
/// `.await` by more than one task at a time except through the atomics and
/// channels below, which is what keeps `doNext`'s non-reentrance invariant
/// true without a lock around the whole iteration.
pub(crate) struct Shared<Q> {
    worker_id: String,
    pub(crate) queue: Arc<Q>,
    bus: EventBus,
    pub(crate) options: WorkerOptions,
    continuous: bool,
    pub(crate) active: AtomicBool,
    idle: AtomicBool,
    again: AtomicBool,
    wake: Notify,
    active_job: Mutex<Option<Job>>,
    settled: AtomicBool,
    completion_tx: watch::Sender<Option<Outcome>>,
    pub(crate) lease_busy_tx: watch::Sender<bool>,
    pub(crate) lease_wake: Notify,
}

enum LoopAction {
    Continue,
    Wait,
    Stop,
}

/// A handle to a worker's one-shot completion signal. Cheap to clone;
/// `wait` can be called from as many places as want to know when the worker
/// has shut down.
#[derive(Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<Outcome>>,
}

impl CompletionHandle {
    pub async fn wait(mut self) -> Outcome {
        let guard = self
            .rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .expect("completion sender is held by the shared state for the worker's lifetime");
        guard.clone().expect("checked is_some above")
    }
}

/// A single dedicated execution loop over jobs leased from a [`JobQueue`],
/// plus a lease-recovery task that periodically reclaims jobs whose lease
/// expired without a report. Construct one with [`WorkerBuilder`].
///
/// `Worker` is a cheap, `Clone`-able handle; the loop and lease-recovery
/// tasks themselves run independently once spawned and keep going even if
/// every handle is dropped.
pub struct Worker<Q, D> {
    shared: Arc<Shared<Q>>,
    tasks: Arc<TaskRegistry<D>>,
    deps: Arc<D>,
}

impl<Q, D> Clone for Worker<Q, D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tasks: self.tasks.clone(),
            deps: self.deps.clone(),
        }
    }
}

impl<Q, D> Worker<Q, D>
where
    Q: JobQueue + 'static,
    D: Send + Sync + 'static,
{
    fn new(queue: Q, tasks: TaskRegistry<D>, deps: D, options: WorkerOptions, continuous: bool) -> Self {
        let worker_id = options.worker_id.clone().unwrap_or_else(random_worker_id);
        let (completion_tx, _) = watch::channel(None);
        let (lease_busy_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            worker_id: worker_id.clone(),
            queue: Arc::new(queue),
            bus: EventBus::new(),
            options,
            continuous,
            active: AtomicBool::new(true),
            idle: AtomicBool::new(false),
            again: AtomicBool::new(false),
            wake: Notify::new(),
            active_job: Mutex::new(None),
            settled: AtomicBool::new(false),
            completion_tx,
            lease_busy_tx,
            lease_wake: Notify::new(),
        });

        let worker = Self {
            shared: shared.clone(),
            tasks: Arc::new(tasks),
            deps: Arc::new(deps),
        };

        tokio::spawn(run_main_loop(shared.clone(), worker.tasks.clone(), worker.deps.clone()));
        tokio::spawn(crate::lease_recovery::run(shared));

        worker
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WorkerEvent>> {
        self.shared.bus.subscribe()
    }

    pub fn get_active_job(&self) -> Option<Job> {
        self.shared.active_job.lock().unwrap().clone()
    }

    pub fn completion(&self) -> CompletionHandle {
        CompletionHandle {
            rx: self.shared.completion_tx.subscribe(),
        }
    }

    /// Wake the worker early if it is idle (sleeping until the next poll
    /// interval), returning `true` if the wake happened immediately. If the
    /// worker is mid-iteration, records that it should poll again
    /// immediately once the current iteration finishes and returns `false`.
    ///
    /// Panics if the worker has already been released.
    pub fn nudge(&self) -> bool {
        assert!(
            self.shared.active.load(Ordering::Acquire),
            "nudge called on a released worker"
        );
        if self.shared.idle.load(Ordering::Acquire) {
            self.shared.wake.notify_one();
            true
        } else {
            self.shared.again.store(true, Ordering::Release);
            false
        }
    }

    /// Ask the worker to stop after its current job (if any) finishes, and
    /// stop re-arming the lease-recovery timer. Does not abort in-flight
    /// work. Idempotent: calling it more than once is a no-op beyond the
    /// first call. Returns a handle to await the same completion signal
    /// [`Worker::completion`] would.
    pub fn release(&self) -> CompletionHandle {
        let was_idle = self.shared.idle.load(Ordering::Acquire);
        mark_released(&self.shared);
        if was_idle {
            self.shared.wake.notify_one();
        }
        self.completion()
    }
}

/// Builds a [`Worker`], mirroring the `with_*`/`build` shape used elsewhere
/// in this codebase for constructing runtimes.
pub struct WorkerBuilder<Q, D> {
    queue: Q,
    deps: D,
    tasks: TaskRegistry<D>,
    options: WorkerOptions,
    continuous: bool,
}

impl<Q, D> WorkerBuilder<Q, D>
where
    Q: JobQueue + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(queue: Q, deps: D) -> Self {
        Self {
            queue,
            deps,
            tasks: TaskRegistry::new(),
            options: WorkerOptions::default(),
            continuous: true,
        }
    }

    pub fn with_task(mut self, task_identifier: impl Into<String>, handler: impl TaskHandler<D> + 'static) -> Self {
        self.tasks = self.tasks.register(task_identifier, handler);
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// When `false`, the worker stops (resolving its completion future)
    /// the first time it finds the queue empty, rather than polling
    /// forever. Used for "drain the queue once and exit" invocations.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn build(self) -> Worker<Q, D> {
        Worker::new(self.queue, self.tasks, self.deps, self.options, self.continuous)
    }
}

async fn run_main_loop<Q, D>(shared: Arc<Shared<Q>>, tasks: Arc<TaskRegistry<D>>, deps: Arc<D>)
where
    Q: JobQueue + 'static,
    D: Send + Sync + 'static,
{
    shared.bus.emit(WorkerEvent::Create {
        worker_id: shared.worker_id.clone(),
    });

    let mut contiguous_errors: u32 = 0;

    loop {
        if !shared.active.load(Ordering::Acquire) {
            resolve_completion_ok(&shared).await;
            return;
        }

        match do_next_iteration(&shared, &tasks, &deps, &mut contiguous_errors).await {
            LoopAction::Continue => continue,
            LoopAction::Stop => return,
            LoopAction::Wait => {
                // `idle` was already set by `do_next_iteration` itself, at the
                // point it decided to wait, so there's no gap between that
                // decision and `nudge()` being able to observe it.
                tokio::select! {
                    _ = tokio::time::sleep(shared.options.poll_interval) => {}
                    _ = shared.wake.notified() => {}
                }
                shared.idle.store(false, Ordering::Release);
            }
        }
    }
}

async fn do_next_iteration<Q, D>(
    shared: &Arc<Shared<Q>>,
    tasks: &Arc<TaskRegistry<D>>,
    deps: &Arc<D>,
    contiguous_errors: &mut u32,
) -> LoopAction
where
    Q: JobQueue + 'static,
    D: Send + Sync + 'static,
{
    shared.again.store(false, Ordering::Release);
    shared.idle.store(false, Ordering::Release);
    debug_assert!(
        shared.active_job.lock().unwrap().is_none(),
        "doNext re-entered while a job was already active"
    );

    let flags_to_skip = shared.options.forbidden_flags.resolve().await;

    shared.bus.emit(WorkerEvent::GetJobStart);
    let result = shared
        .queue
        .get_job(&shared.worker_id, shared.options.use_node_time, &flags_to_skip)
        .await;

    match result {
        Err(err) => {
            shared.bus.emit(WorkerEvent::GetJobError {
                message: err.to_string(),
            });

            if !shared.continuous {
                mark_released(shared);
                reject_completion(shared, WorkerError::from(err)).await;
                return LoopAction::Stop;
            }

            *contiguous_errors += 1;
            if *contiguous_errors >= shared.options.max_contiguous_errors {
                let fatal = WorkerError::ContiguousAcquisitionFailures {
                    count: *contiguous_errors,
                    message: err.to_string(),
                };
                mark_released(shared);
                reject_completion(shared, fatal).await;
                return LoopAction::Stop;
            }

            if shared.active.load(Ordering::Acquire) {
                shared.idle.store(true, Ordering::Release);
                LoopAction::Wait
            } else {
                reject_completion(shared, WorkerError::from(err)).await;
                LoopAction::Stop
            }
        }
        Ok(None) => {
            *contiguous_errors = 0;
            shared.bus.emit(WorkerEvent::GetJobEmpty);

            if !shared.continuous {
                mark_released(shared);
                resolve_completion_ok(shared).await;
                return LoopAction::Stop;
            }

            if !shared.active.load(Ordering::Acquire) {
                resolve_completion_ok(shared).await;
                return LoopAction::Stop;
            }

            if shared.again.load(Ordering::Acquire) {
                LoopAction::Continue
            } else {
                shared.idle.store(true, Ordering::Release);
                LoopAction::Wait
            }
        }
        Ok(Some(job)) => {
            *contiguous_errors = 0;
            *shared.active_job.lock().unwrap() = Some(job.clone());
            shared.bus.emit(WorkerEvent::JobStart { job: job.clone() });
            execute_job(shared, tasks, deps, job).await
        }
    }
}

async fn execute_job<Q, D>(shared: &Arc<Shared<Q>>, tasks: &Arc<TaskRegistry<D>>, deps: &Arc<D>, job: Job) -> LoopAction
where
    Q: JobQueue + 'static,
    D: Send + Sync + 'static,
{
    let start = Instant::now();
    let handler = tasks.get(&job.task_identifier);

    let handler_result: anyhow::Result<()> = match handler {
        Some(handler) => {
            let helpers = JobHelpers::new(job.id, &job.task_identifier, job.attempts, job.max_attempts, deps.as_ref());
            handler.run(job.payload.clone(), helpers).await
        }
        None => Err(anyhow::anyhow!("Unsupported task '{}'", job.task_identifier)),
    };

    let duration_ms = start.elapsed().as_millis();
    let fatal = report_outcome(shared, &job, handler_result, duration_ms).await;
    *shared.active_job.lock().unwrap() = None;

    match fatal {
        Some(fatal_err) => {
            shared.bus.emit(WorkerEvent::FatalError {
                message: fatal_err.to_string(),
            });
            tracing::error!(job_id = %job.id, error = %fatal_err, "worker fatal error reporting job outcome, shutting down");
            mark_released(shared);
            reject_completion(shared, fatal_err).await;
            LoopAction::Stop
        }
        None => {
            if shared.active.load(Ordering::Acquire) {
                LoopAction::Continue
            } else {
                resolve_completion_ok(shared).await;
                LoopAction::Stop
            }
        }
    }
}

async fn report_outcome<Q>(
    shared: &Arc<Shared<Q>>,
    job: &Job,
    result: anyhow::Result<()>,
    duration_ms: u128,
) -> Option<WorkerError>
where
    Q: JobQueue + 'static,
{
    match result {
        Ok(()) => {
            shared.bus.emit(WorkerEvent::JobSuccess {
                job: job.clone(),
                duration_ms,
            });
            if !no_log_success() {
                tracing::info!(job_id = %job.id, task = %job.task_identifier, duration_ms, "job succeeded");
            }
            let report = shared.queue.complete_job(&shared.worker_id, job.id).await;
            shared.bus.emit(WorkerEvent::JobComplete {
                job: job.clone(),
                error: None,
            });
            report.err().map(|e| WorkerError::Fatal(e.to_string()))
        }
        Err(handler_err) => {
            let message = derive_message(&handler_err);
            shared.bus.emit(WorkerEvent::JobError {
                job: job.clone(),
                message: message.clone(),
            });
            if job.attempts >= job.max_attempts {
                shared.bus.emit(WorkerEvent::JobFailed {
                    job: job.clone(),
                    message: message.clone(),
                });
            }
            tracing::error!(job_id = %job.id, task = %job.task_identifier, duration_ms, error = %message, "job failed");
            let report = shared.queue.fail_job(&shared.worker_id, job.id, &message).await;
            shared.bus.emit(WorkerEvent::JobComplete {
                job: job.clone(),
                error: Some(message),
            });
            report.err().map(|e| WorkerError::Fatal(e.to_string()))
        }
    }
}

fn derive_message(err: &anyhow::Error) -> String {
    let message = err.to_string();
    if message.is_empty() {
        "Non error or error without message thrown.".to_string()
    } else {
        message
    }
}

fn no_log_success() -> bool {
    std::env::var("NO_LOG_SUCCESS")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

async fn resolve_completion_ok<Q: JobQueue + 'static>(shared: &Arc<Shared<Q>>) {
    wait_for_lease_recovery_idle(shared).await;
    settle(shared, Ok(()));
}

async fn reject_completion<Q: JobQueue + 'static>(shared: &Arc<Shared<Q>>, err: WorkerError) {
    settle(shared, Err(err));
}

fn settle<Q: JobQueue + 'static>(shared: &Arc<Shared<Q>>, outcome: Outcome) {
    if shared
        .settled
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let error = outcome.as_ref().err().map(|e| e.to_string());
        let _ = shared.completion_tx.send(Some(outcome));
        shared.bus.emit(WorkerEvent::Stop { error });
    }
}

async fn wait_for_lease_recovery_idle<Q: JobQueue + 'static>(shared: &Arc<Shared<Q>>) {
    let mut rx = shared.lease_busy_tx.subscribe();
    let _ = rx.wait_for(|busy| !*busy).await;
}

fn mark_released<Q: JobQueue + 'static>(shared: &Arc<Shared<Q>>) {
    if shared.active.swap(false, Ordering::AcqRel) {
        shared.lease_wake.notify_one();
        shared.bus.emit(WorkerEvent::Release);
    }
}

