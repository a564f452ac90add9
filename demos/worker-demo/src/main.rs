//! Wires a [`job_worker::Worker`] against the in-memory test queue so the
//! execution loop can be exercised without a database.

use std::time::Duration;

use job_worker::{JobHelpers, TaskHandler, WorkerBuilder, WorkerOptions};
use job_worker_testing::InMemoryJobQueue;

struct Deps {
    greeting: String,
}

struct SayHello;

#[job_worker::async_trait]
impl TaskHandler<Deps> for SayHello {
    async fn run(&self, payload: serde_json::Value, helpers: JobHelpers<'_, Deps>) -> anyhow::Result<()> {
        let name = payload
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("world");
        tracing::info!(job_id = %helpers.job_id, "{}, {name}!", helpers.deps().greeting);
        Ok(())
    }
}

struct AlwaysFails;

#[job_worker::async_trait]
impl TaskHandler<Deps> for AlwaysFails {
    async fn run(&self, _payload: serde_json::Value, _helpers: JobHelpers<'_, Deps>) -> anyhow::Result<()> {
        anyhow::bail!("this task is a demo of a failing handler")
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let queue = InMemoryJobQueue::new();
    queue.enqueue("say_hello", serde_json::json!({ "name": "Ferris" }), 3);
    queue.enqueue("flaky", serde_json::json!({}), 2);

    let options = WorkerOptions {
        poll_interval: Duration::from_millis(200),
        ..WorkerOptions::default()
    };

    let worker = WorkerBuilder::new(
        queue,
        Deps {
            greeting: "hello".to_string(),
        },
    )
    .with_task("say_hello", SayHello)
    .with_task("flaky", AlwaysFails)
    .with_options(options)
    .continuous(false)
    .build();

    let recorder = job_worker_testing::EventRecorder::attach(&worker);

    match worker.completion().wait().await {
        Ok(()) => tracing::info!("worker drained the queue and stopped cleanly"),
        Err(err) => tracing::error!(error = %err, "worker stopped with an error"),
    }

    for event in recorder.snapshot() {
        tracing::debug!(?event, "observed event");
    }
}
