//! # Wait Group
//!
//! A safer join primitive: callers hand [`WaitGroup::go`] a function and
//! the group does all the counter bookkeeping that is so easy to get wrong
//! by hand. On top of plain joining it captures the first error, can cancel
//! a [`CancellationToken`] as soon as anything fails, and can run its jobs
//! through a [`work_pool::Pool`] for concurrency control and worker reuse.
//!
//! A `WaitGroup` is deliberately neither `Clone` nor `Copy`: duplicating a
//! join counter mid-use silently splits it, so the type system simply
//! forbids it.
//!
//! ## Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use wait_group::WaitGroup;
//!
//! # async fn run() {
//! let wg = WaitGroup::new("fetch");
//! let ctx = CancellationToken::new();
//! wg.cancel_on_error(ctx.clone());
//!
//! for i in 0..10 {
//!     wg.go(ctx.clone(), move |ctx| async move {
//!         if ctx.is_cancelled() {
//!             return Err(wait_group::Cancelled.into());
//!         }
//!         println!("task {i}");
//!         Ok(())
//!     })
//!     .await;
//! }
//!
//! if let Err(err) = wg.wait().await {
//!     eprintln!("first failure: {err}");
//! }
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use work_pool::{InFlight, Pool};

/// The error type jobs return.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error a job returns when it stopped because its token was
/// cancelled. The group treats it as secondary: any real error reported by
/// another job takes precedence when [`WaitGroup::wait`] picks its result.
#[derive(Debug, Clone, Copy, Error)]
#[error("job cancelled")]
pub struct Cancelled;

/// The outcome of a [`WaitGroup::wait`] with at least one failed job.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Every failure was a cancellation; no real error was reported.
    #[error("wait group cancelled")]
    Cancelled,

    /// The first real error a job reported. `additional` counts further
    /// real errors that arrived after it.
    #[error("wait group job failed: {source}")]
    Job {
        source: JobError,
        additional: usize,
    },
}

#[derive(Default)]
struct ErrorState {
    /// First real (non-cancellation) error reported by any job.
    first: Mutex<Option<JobError>>,
    /// Real errors reported after the first.
    additional: AtomicUsize,
    /// Whether any job reported a cancellation.
    cancelled: AtomicBool,
    /// Token to cancel on the first real error; cleared once fired.
    cancel: Mutex<Option<CancellationToken>>,
}

impl ErrorState {
    fn record(&self, err: JobError) {
        if err.is::<Cancelled>() {
            self.cancelled.store(true, Ordering::Release);
            return;
        }
        let fire = {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(err);
                true
            } else {
                self.additional.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if fire && let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    fn take_result(&self) -> Result<(), WaitError> {
        if let Some(source) = self.first.lock().take() {
            return Err(WaitError::Job {
                source,
                additional: self.additional.swap(0, Ordering::AcqRel),
            });
        }
        if self.cancelled.swap(false, Ordering::AcqRel) {
            return Err(WaitError::Cancelled);
        }
        Ok(())
    }
}

/// A join primitive that launches jobs and waits for all of them, capturing
/// the first failure along the way.
pub struct WaitGroup {
    name: String,
    inflight: Arc<InFlight>,
    total: AtomicI64,
    errors: Arc<ErrorState>,
    pool: Option<Arc<dyn Pool>>,
    span: Mutex<Option<tracing::Span>>,
}

impl WaitGroup {
    /// Creates a wait group. `name` appears only in telemetry; the empty
    /// string shows up as `unspecified`.
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = "unspecified".to_string();
        }
        Self {
            name,
            inflight: Arc::new(InFlight::new()),
            total: AtomicI64::new(0),
            errors: Arc::new(ErrorState::default()),
            pool: None,
            span: Mutex::new(None),
        }
    }

    /// Creates a wait group whose jobs run through `pool` instead of
    /// unmanaged tasks, giving concurrency control and worker reuse.
    pub fn with_pool(name: impl Into<String>, pool: Arc<dyn Pool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new(name)
        }
    }

    /// Arms cancel-on-error: the first real error any job reports cancels
    /// `token`. The token is cleared after firing (and after every
    /// [`wait`](Self::wait)), so a reused group must be re-armed.
    pub fn cancel_on_error(&self, token: CancellationToken) {
        *self.errors.cancel.lock() = Some(token);
    }

    /// Launches `f(ctx)` as a tracked job. Jobs whose token is already
    /// cancelled at start are skipped without recording an error.
    ///
    /// When the group is pool-backed this waits like the pool's own submit
    /// does; a rejected submission (closed pool) is recorded as a job
    /// error.
    pub async fn go<F, Fut>(&self, ctx: CancellationToken, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.init_span();
        self.inflight.add(1);
        self.total.fetch_add(1, Ordering::Relaxed);

        let inflight = self.inflight.clone();
        let errors = self.errors.clone();
        let run = move |ctx: CancellationToken| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                if !ctx.is_cancelled()
                    && let Err(err) = f(ctx).await
                {
                    errors.record(err);
                }
                inflight.done();
            })
        };

        match &self.pool {
            None => {
                tokio::spawn(run(ctx));
            }
            Some(pool) => {
                if let Err(err) = pool.submit(ctx, Box::new(run)).await {
                    // The job never ran; account for it and surface the
                    // rejection as a job failure.
                    self.inflight.done();
                    self.errors.record(Box::new(err));
                }
            }
        }
    }

    /// The number of jobs currently running.
    pub fn running(&self) -> usize {
        self.inflight.count().max(0) as usize
    }

    /// The number of jobs launched since the last [`wait`](Self::wait).
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed).max(0) as usize
    }

    /// Waits until every launched job has finished, then returns the first
    /// real error captured, a [`WaitError::Cancelled`] if jobs only ever
    /// reported cancellation, or `Ok`. Counters and errors are reset so the
    /// group can be reused; an armed cancel-on-error token is fired and
    /// cleared.
    pub async fn wait(&self) -> Result<(), WaitError> {
        let started = Instant::now();
        self.event_wait_started();

        self.inflight.wait().await;

        if let Some(token) = self.errors.cancel.lock().take() {
            token.cancel();
        }
        let result = self.errors.take_result();

        self.event_wait_finished(started);
        self.total.store(0, Ordering::Relaxed);
        result
    }

    /// One-shot span creation on the first launched job.
    fn init_span(&self) {
        let mut span = self.span.lock();
        if span.is_none() {
            *span = Some(tracing::debug_span!("wait_group", name = %self.name));
        }
    }

    fn event_wait_started(&self) {
        let span = self.span.lock();
        let Some(span) = span.as_ref() else { return };
        tracing::event!(
            parent: span,
            Level::DEBUG,
            total = self.total.load(Ordering::Relaxed),
            pooled = self.pool.is_some(),
            cancel_on_error = self.errors.cancel.lock().is_some(),
            "wait started",
        );
    }

    fn event_wait_finished(&self, started: Instant) {
        let span = self.span.lock();
        let Some(span) = span.as_ref() else { return };
        tracing::event!(
            parent: span,
            Level::DEBUG,
            total = self.total.load(Ordering::Relaxed),
            elapsed_ns = started.elapsed().as_nanos() as u64,
            "wait finished",
        );
    }
}
