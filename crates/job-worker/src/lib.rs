//! A single-worker execution loop for a database-backed job queue.
//!
//! This crate owns the part of a job-queue worker that has nothing to do
//! with any particular database: leasing a job from a [`JobQueue`],
//! dispatching it to a registered [`TaskHandler`], reporting success or
//! failure back to the queue, and keeping a background lease-recovery task
//! alive for the lifetime of the worker. The SQL behind `get_job`,
//! `complete_job`, `fail_job` and `reset_locked_at` lives in an
//! implementation of [`JobQueue`] (see `job-worker-postgres` for the
//! Postgres one) — this crate only knows their contracts.
//!
//! ```ignore
//! use job_worker::{JobHelpers, TaskHandler, WorkerBuilder, WorkerOptions};
//!
//! struct SendEmail;
//!
//! #[job_worker::async_trait]
//! impl TaskHandler<Deps> for SendEmail {
//!     async fn run(&self, payload: serde_json::Value, helpers: JobHelpers<'_, Deps>) -> anyhow::Result<()> {
//!         helpers.deps().mailer.send(payload).await
//!     }
//! }
//!
//! let worker = WorkerBuilder::new(queue, deps)
//!     .with_task("send_email", SendEmail)
//!     .with_options(WorkerOptions::default())
//!     .build();
//!
//! worker.completion().wait().await?;
//! ```

mod config;
mod error;
mod events;
mod job;
mod lease_recovery;
mod queue;
mod registry;
mod worker;

#[cfg(test)]
mod tests;

pub use config::{FlagsFuture, ForbiddenFlags, WorkerOptions};
pub use error::{QueueError, WorkerError};
pub use events::{EventBus, WorkerEvent};
pub use job::Job;
pub use queue::JobQueue;
pub use registry::{JobHelpers, TaskHandler, TaskRegistry};
pub use worker::{CompletionHandle, Worker, WorkerBuilder};

pub use async_trait::async_trait;
