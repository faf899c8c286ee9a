//! Counting latch for in-flight work.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// An async counting latch: `add` before handing work out, `done` when a
/// unit finishes, `wait` until the count returns to zero.
///
/// Unlike joining task handles, the latch tracks logical units of work, so
/// it also fits items that travel through channels rather than tasks.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicI64,
    drained: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `n` new units of work.
    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks one unit of work as finished.
    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// The number of units currently outstanding.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until the count reaches zero. Returns immediately when nothing
    /// is outstanding.
    pub async fn wait(&self) {
        loop {
            // Register interest before reading the count so a concurrent
            // final `done` cannot slip between the check and the await.
            let drained = self.drained.notified();
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            drained.await;
        }
    }
}
