//! Runtime statistics, maintained lock-free.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A point-in-time snapshot of a runtime's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Requests currently being processed.
    pub running: i64,
    /// Requests that have finished processing.
    pub completed: i64,
    /// Fastest single-request processing time.
    pub min: Duration,
    /// Mean processing time across completed requests.
    pub avg: Duration,
    /// Slowest single-request processing time.
    pub max: Duration,
    /// How long requests waited between submission and pickup.
    pub ingest: IngestStats,
}

/// Queue-wait statistics: the time between a request entering the shared
/// input and a worker picking it up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

pub(crate) struct StatsCell {
    running: AtomicI64,
    completed: AtomicI64,
    min: AtomicI64,
    max: AtomicI64,
    total: AtomicI64,
    ingest_min: AtomicI64,
    ingest_max: AtomicI64,
    ingest_total: AtomicI64,
}

impl StatsCell {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicI64::new(0),
            completed: AtomicI64::new(0),
            // Seeded at MAX so the first sample always lands; reported as
            // zero until then.
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(0),
            total: AtomicI64::new(0),
            ingest_min: AtomicI64::new(i64::MAX),
            ingest_max: AtomicI64::new(0),
            ingest_total: AtomicI64::new(0),
        }
    }

    /// Records a worker picking a request up after `queued` in the input.
    pub(crate) fn record_ingest(&self, queued: Duration) {
        let ns = duration_ns(queued);
        self.running.fetch_add(1, Ordering::AcqRel);
        set_min(&self.ingest_min, ns);
        set_max(&self.ingest_max, ns);
        self.ingest_total.fetch_add(ns, Ordering::AcqRel);
    }

    /// Records a request leaving the executor after `ran` of processing.
    pub(crate) fn record_exit(&self, ran: Duration) {
        let ns = duration_ns(ran);
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::AcqRel);
        set_min(&self.min, ns);
        set_max(&self.max, ns);
        self.total.fetch_add(ns, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        let completed = self.completed.load(Ordering::Acquire);
        let avg = if completed > 0 {
            ns_duration(self.total.load(Ordering::Acquire) / completed)
        } else {
            Duration::ZERO
        };
        let ingest_avg = if completed > 0 {
            ns_duration(self.ingest_total.load(Ordering::Acquire) / completed)
        } else {
            Duration::ZERO
        };
        Stats {
            running: self.running.load(Ordering::Acquire),
            completed,
            min: load_min(&self.min),
            avg,
            max: ns_duration(self.max.load(Ordering::Acquire)),
            ingest: IngestStats {
                min: load_min(&self.ingest_min),
                avg: ingest_avg,
                max: ns_duration(self.ingest_max.load(Ordering::Acquire)),
            },
        }
    }
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn ns_duration(ns: i64) -> Duration {
    Duration::from_nanos(ns.max(0) as u64)
}

fn load_min(cell: &AtomicI64) -> Duration {
    match cell.load(Ordering::Acquire) {
        i64::MAX => Duration::ZERO,
        ns => ns_duration(ns),
    }
}

/// Lowers `current` to `v` if smaller, read-then-try-swap.
fn set_min(current: &AtomicI64, v: i64) {
    loop {
        let c = current.load(Ordering::Acquire);
        if v >= c {
            return;
        }
        if current
            .compare_exchange(c, v, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Raises `current` to `v` if larger, read-then-try-swap.
fn set_max(current: &AtomicI64, v: i64) {
    loop {
        let c = current.load(Ordering::Acquire);
        if v <= c {
            return;
        }
        if current
            .compare_exchange(c, v, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}
