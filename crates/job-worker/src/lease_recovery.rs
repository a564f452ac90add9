use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::JobQueue;
use crate::worker::Shared;

fn random_interval(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis().max(lo as u128 + 1) as u64;
    Duration::from_millis(fastrand::u64(lo..hi))
}

/// Background task that periodically reclaims jobs whose lease expired
/// without the worker that held them reporting back (it crashed, was
/// killed, or the process lost its database connection mid-job). Arms at a
/// random point in the first minute so a fleet of workers doesn't all hit
/// the database at once, then re-arms at a jittered interval between
/// `min_reset_locked_interval` and `max_reset_locked_interval`.
///
/// Failures here are logged and never propagate to the worker's completion
/// future — a stuck lease-recovery sweep should not take down an otherwise
/// healthy worker.
pub(crate) async fn run<Q: JobQueue + 'static>(shared: Arc<Shared<Q>>) {
    let initial_delay = Duration::from_millis(fastrand::u64(0..60_000));
    tokio::select! {
        _ = tokio::time::sleep(initial_delay) => {}
        _ = shared.lease_wake.notified() => {}
    }

    loop {
        if !shared.active.load(Ordering::Acquire) {
            return;
        }

        let _ = shared.lease_busy_tx.send(true);
        let result = shared.queue.reset_locked_at().await;
        let _ = shared.lease_busy_tx.send(false);

        match result {
            Ok(reclaimed) => {
                tracing::debug!(reclaimed, "lease recovery reclaimed stalled jobs");
            }
            Err(err) => {
                if shared.active.load(Ordering::Acquire) {
                    tracing::error!(error = %err, "lease recovery failed, will retry after the next interval");
                } else {
                    tracing::error!(error = %err, "lease recovery failed while worker is shutting down, will not retry");
                }
            }
        }

        if !shared.active.load(Ordering::Acquire) {
            return;
        }

        let delay = random_interval(
            shared.options.min_reset_locked_interval,
            shared.options.max_reset_locked_interval,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.lease_wake.notified() => {}
        }
    }
}
