use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

/// Read-only view of the job currently executing, plus a handle to shared
/// application dependencies, passed to a [`TaskHandler`] exactly once per
/// invocation.
///
/// `D` is whatever a caller's handlers need — a database pool, an HTTP
/// client, feature flags — the same role `EffectContext<Deps>` plays for
/// seesaw effects.
pub struct JobHelpers<'a, D> {
    pub job_id: Uuid,
    pub task_identifier: &'a str,
    pub attempts: i32,
    pub max_attempts: i32,
    deps: &'a D,
}

impl<'a, D> JobHelpers<'a, D> {
    pub(crate) fn new(
        job_id: Uuid,
        task_identifier: &'a str,
        attempts: i32,
        max_attempts: i32,
        deps: &'a D,
    ) -> Self {
        Self {
            job_id,
            task_identifier,
            attempts,
            max_attempts,
            deps,
        }
    }

    pub fn deps(&self) -> &D {
        self.deps
    }
}

/// A single task's business logic. Returning `Err` fails the job (and
/// retries or dead-letters it, per the backing store's policy); returning
/// `Ok(())` completes it.
#[async_trait]
pub trait TaskHandler<D>: Send + Sync {
    async fn run(&self, payload: serde_json::Value, helpers: JobHelpers<'_, D>) -> anyhow::Result<()>;
}

/// Maps task identifiers to the handler that runs them. A job whose
/// `task_identifier` has no registered handler fails with an "unsupported
/// task" error rather than panicking the worker.
pub struct TaskRegistry<D> {
    handlers: HashMap<String, Arc<dyn TaskHandler<D>>>,
}

impl<D> TaskRegistry<D> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, task_identifier: impl Into<String>, handler: impl TaskHandler<D> + 'static) -> Self {
        self.handlers.insert(task_identifier.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, task_identifier: &str) -> Option<Arc<dyn TaskHandler<D>>> {
        self.handlers.get(task_identifier).cloned()
    }
}

impl<D> Default for TaskRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
