//! # Work Pool
//!
//! Worker pools for running jobs with bounded or reused concurrency.
//!
//! Two implementations are provided:
//!
//! - [`pooled::Pool`] — a fixed set of long-lived worker tasks consuming a
//!   shared submission channel. Best for pools that live as long as the
//!   process.
//! - [`limited::Pool`] — a task per submission, hard-capped by a semaphore.
//!   Starts and tears down fast, so it suits short-lived pools.
//!
//! Both speak the same [`Pool`] trait, publish submit/blocked/unblocked
//! tracing events, and register themselves in the process-wide
//! [`registry`] so telemetry exporters can enumerate live pools.
//!
//! ## Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use work_pool::{Pool as _, pooled};
//!
//! # async fn run() -> Result<(), work_pool::PoolError> {
//! let pool = pooled::Pool::new("ingest", 8)?;
//! for i in 0..100 {
//!     pool.submit(
//!         CancellationToken::new(),
//!         Box::new(move |_ctx| Box::pin(async move { println!("job {i}") })),
//!     )
//!     .await?;
//! }
//! pool.wait().await;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod inflight;
pub mod limited;
pub mod pooled;
pub mod registry;

pub use inflight::InFlight;

/// A unit of work for a [`Pool`]. The job receives the cancellation token
/// passed to `submit` and is expected to observe it.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send + 'static>;

/// Errors returned by pool constructors and submission.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool size must be at least 1")]
    Size,

    #[error("pool name `{name}` cannot contain whitespace, hyphens, or digits")]
    InvalidName { name: String },

    #[error("pool `{name}` is closed")]
    Closed { name: String },
}

/// Knobs for a single submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub(crate) non_blocking: bool,
    pub(crate) caller: Option<&'static str>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the job even when the pool is at capacity, outside the pool's
    /// budget, instead of waiting for a slot. Telemetry still counts the
    /// job. This trades the pool's concurrency bound for forward progress.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// Names the submitting function for telemetry. There is no reliable
    /// way to recover a caller's identity at runtime for generic code, so
    /// it is always supplied explicitly.
    pub fn caller(mut self, name: &'static str) -> Self {
        self.caller = Some(name);
        self
    }

    pub(crate) fn caller_name(&self) -> &'static str {
        self.caller.unwrap_or("unknown")
    }
}

/// The minimum surface any worker pool implements.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Submits a job with default options.
    async fn submit(&self, ctx: CancellationToken, job: Job) -> Result<(), PoolError> {
        self.submit_with(ctx, job, SubmitOptions::default()).await
    }

    /// Submits a job to be run.
    async fn submit_with(
        &self,
        ctx: CancellationToken,
        job: Job,
        opts: SubmitOptions,
    ) -> Result<(), PoolError>;

    /// Waits for all submitted jobs to finish. Only call this once no more
    /// `submit` calls are in flight.
    async fn wait(&self);

    /// Waits for outstanding jobs, tears down the workers, and removes the
    /// pool from the registry. Submissions after `close` fail with
    /// [`PoolError::Closed`].
    async fn close(&self);

    /// The pool's configured size.
    fn len(&self) -> usize;

    /// How many jobs are currently queued or executing.
    fn running(&self) -> usize;

    /// The registered name, unique process-wide. Empty for unregistered
    /// pools.
    fn name(&self) -> &str;
}

/// A concurrency-safe collector for errors produced by jobs whose failures
/// should not stop execution.
#[derive(Default)]
pub struct ErrorList {
    errors: parking_lot::Mutex<Vec<Arc<dyn Error + Send + Sync + 'static>>>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error.
    pub fn record<E>(&self, err: E)
    where
        E: Error + Send + Sync + 'static,
    {
        self.errors.lock().push(Arc::new(err));
    }

    /// Records an already-boxed error.
    pub fn record_boxed(&self, err: Box<dyn Error + Send + Sync + 'static>) {
        self.errors.lock().push(Arc::from(err));
    }

    /// The first error recorded, if any.
    pub fn first(&self) -> Option<Arc<dyn Error + Send + Sync + 'static>> {
        self.errors.lock().first().cloned()
    }

    /// All recorded errors, in recording order.
    pub fn all(&self) -> Vec<Arc<dyn Error + Send + Sync + 'static>> {
        self.errors.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Drops all recorded errors.
    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}
