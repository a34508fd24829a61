//! Proactive renewal timer.
//!
//! One timer at a time, held as a task handle so it can be cancelled
//! deterministically. A timer that fires removes itself from the slot
//! before running its callback, so the callback may re-arm.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Pending {
    id: u64,
    handle: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<Pending>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Pending>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct RefreshScheduler {
    slot: Slot,
    next_id: AtomicU64,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer, replacing any pending one. After `delay` the timer
    /// calls `on_fire(refresh_token)` unless it was cancelled first.
    pub fn arm<F, Fut>(&self, refresh_token: String, delay: Duration, on_fire: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(old) = slot.take() {
            debug!(timer = old.id, "Replacing pending renewal timer");
            old.handle.abort();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let own_slot = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = lock(&own_slot);
                if !slot.as_ref().is_some_and(|p| p.id == id) {
                    // Cancelled or replaced while waking up
                    return;
                }
                *slot = None;
            }
            debug!(timer = id, "Renewal timer fired");
            on_fire(refresh_token).await;
        });

        debug!(timer = id, delay_secs = delay.as_secs(), "Renewal timer armed");
        *slot = Some(Pending { id, handle });
    }

    /// Stop the pending timer. No-op when nothing is pending.
    pub fn cancel(&self) {
        if let Some(pending) = lock(&self.slot).take() {
            debug!(timer = pending.id, "Renewal timer cancelled");
            pending.handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
