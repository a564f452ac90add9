use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::Job;

/// The contract a backing store must satisfy for [`crate::Worker`] to drive
/// its execution loop against it.
///
/// Implementations own everything about how a job is physically stored and
/// locked — `FOR UPDATE SKIP LOCKED`, a Redis `BLMOVE`, whatever fits. The
/// worker only ever calls these four methods.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Lease the next eligible job for `worker_id`, or `None` if the queue is
    /// empty. `flags_to_skip` excludes jobs tagged with any of those flags.
    /// `use_node_time` asks the implementation to use its own view of "now"
    /// (e.g. the database server's clock) rather than the caller's, mirroring
    /// the knob the original job-queue implementation exposed for clock-skewed
    /// deployments.
    async fn get_job(
        &self,
        worker_id: &str,
        use_node_time: bool,
        flags_to_skip: &[String],
    ) -> Result<Option<Job>, QueueError>;

    /// Mark a job permanently done and remove it from the queue.
    async fn complete_job(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError>;

    /// Record a failed attempt. Implementations decide retry scheduling and
    /// dead-lettering; the worker only supplies the failure message.
    async fn fail_job(&self, worker_id: &str, job_id: Uuid, message: &str)
        -> Result<(), QueueError>;

    /// Reclaim jobs whose lease has expired (the worker that held them died
    /// or was killed without reporting back). Returns how many were
    /// reclaimed, purely for logging.
    async fn reset_locked_at(&self) -> Result<u64, QueueError>;
}
