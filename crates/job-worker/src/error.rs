use thiserror::Error;

/// Errors a [`crate::JobQueue`] implementation can return from any of its
/// four operations. Kept deliberately narrow (a message per failure mode)
/// so backing-store crates can wrap whatever driver error they get without
/// leaking driver types across the trait boundary.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("job acquisition failed: {0}")]
    Acquisition(String),

    #[error("job outcome report failed: {0}")]
    Report(String),

    #[error("lease recovery failed: {0}")]
    LeaseRecovery(String),
}

/// Terminal errors that can settle a worker's completion future.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(
        "worker failed {count} times in a row trying to acquire a job, most recent error: {message}"
    )]
    ContiguousAcquisitionFailures { count: u32, message: String },

    #[error("fatal error reporting job outcome, worker is shutting down: {0}")]
    Fatal(String),
}
