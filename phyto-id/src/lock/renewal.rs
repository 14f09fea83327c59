//! Lock auto-renewal
//!
//! A computation that may outlive its lock TTL holds a `LockRenewal`. A
//! background task extends the lock every `interval` until stopped, so a
//! slow provider cannot cause premature lock loss and a duplicate
//! concurrent computation.

use super::{LockHandle, LockManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Guard that keeps a lock alive while in scope
///
/// Dropping the guard stops renewal; `stop` additionally waits for the
/// background task to finish.
#[derive(Debug)]
pub struct LockRenewal {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LockRenewal {
    /// Start renewing `handle` to `ttl` every `interval`
    ///
    /// Non-renewable handles get an inert guard.
    pub fn start(
        locks: Arc<dyn LockManager>,
        handle: LockHandle,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        if !handle.renewable {
            return Self {
                cancel,
                task: None,
                lost,
            };
        }

        let interval = interval.max(Duration::from_millis(1));
        let task = {
            let cancel = cancel.clone();
            let lost = Arc::clone(&lost);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    match locks.renew(&handle, ttl).await {
                        Ok(true) => debug!(key = %handle.key, ttl = ?ttl, "Lock renewed"),
                        Ok(false) => {
                            warn!(key = %handle.key, "Lock lost before renewal; stopping renewal");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            // Keep trying: the lock may still be alive on the backend
                            warn!(key = %handle.key, error = %e, "Lock renewal failed");
                        }
                    }
                }
            })
        };

        Self {
            cancel,
            task: Some(task),
            lost,
        }
    }

    /// Whether a renewal found the lock already gone
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and wait for the background task
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
