use std::sync::Arc;

use tokio::sync::broadcast;

use crate::job::Job;

/// Every observable thing a [`crate::Worker`] can do. Subscribers get a
/// `broadcast` receiver rather than a synchronous callback list, so a slow
/// or panicking subscriber can never block or crash the worker loop — the
/// same "at-most-once, subscriber failures never propagate back" guarantee
/// the original design asked for falls out of the channel choice for free.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Create { worker_id: String },
    GetJobStart,
    GetJobEmpty,
    GetJobError { message: String },
    JobStart { job: Job },
    JobSuccess { job: Job, duration_ms: u128 },
    JobError { job: Job, message: String },
    JobFailed { job: Job, message: String },
    JobComplete { job: Job, error: Option<String> },
    FatalError { message: String },
    Release,
    Stop { error: Option<String> },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<WorkerEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WorkerEvent>> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        // No active subscribers is the common case, not an error.
        let _ = self.sender.send(Arc::new(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
