use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type FlagsFuture = Pin<Box<dyn Future<Output = Vec<String>> + Send>>;

/// How a worker decides which job flags to exclude from acquisition.
/// Mirrors the shapes the original job runner accepted for this option:
/// nothing, a fixed list, or a callback (sync or async) that computes the
/// list fresh on every poll.
#[derive(Clone)]
pub enum ForbiddenFlags {
    None,
    List(Vec<String>),
    Sync(Arc<dyn Fn() -> Vec<String> + Send + Sync>),
    Async(Arc<dyn Fn() -> FlagsFuture + Send + Sync>),
}

impl ForbiddenFlags {
    pub async fn resolve(&self) -> Vec<String> {
        match self {
            ForbiddenFlags::None => Vec::new(),
            ForbiddenFlags::List(flags) => flags.clone(),
            ForbiddenFlags::Sync(f) => f(),
            ForbiddenFlags::Async(f) => f().await,
        }
    }
}

impl Default for ForbiddenFlags {
    fn default() -> Self {
        ForbiddenFlags::None
    }
}

impl fmt::Debug for ForbiddenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForbiddenFlags::None => write!(f, "ForbiddenFlags::None"),
            ForbiddenFlags::List(flags) => f.debug_tuple("ForbiddenFlags::List").field(flags).finish(),
            ForbiddenFlags::Sync(_) => write!(f, "ForbiddenFlags::Sync(..)"),
            ForbiddenFlags::Async(_) => write!(f, "ForbiddenFlags::Async(..)"),
        }
    }
}

/// Tunables for a [`crate::Worker`]. Defaults match the conventions of the
/// job runner this crate's contract is modeled on: a two second poll
/// interval, ten contiguous acquisition failures before giving up, and an
/// 8-10 minute jittered lease-recovery cadence.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Explicit worker id. If `None`, a random `worker-<18 hex chars>` id is
    /// generated at construction.
    pub worker_id: Option<String>,
    pub poll_interval: Duration,
    pub max_contiguous_errors: u32,
    pub min_reset_locked_interval: Duration,
    pub max_reset_locked_interval: Duration,
    /// Forwarded to [`crate::JobQueue::get_job`] so a backing store can
    /// choose between its own clock and the worker's.
    pub use_node_time: bool,
    pub forbidden_flags: ForbiddenFlags,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: Duration::from_millis(2_000),
            max_contiguous_errors: 10,
            min_reset_locked_interval: Duration::from_millis(8 * 60_000),
            max_reset_locked_interval: Duration::from_millis(10 * 60_000),
            use_node_time: false,
            forbidden_flags: ForbiddenFlags::None,
        }
    }
}

pub(crate) fn random_worker_id() -> String {
    let mut id = String::with_capacity(7 + 18);
    id.push_str("worker-");
    for _ in 0..18 {
        id.push(char::from_digit(fastrand::u32(0..16), 16).expect("0..16 is a valid hex digit"));
    }
    id
}
