//! Semaphore-capped pool: a task per submission, hard-limited in flight.
//!
//! Every submit spawns its own task but first takes one of `size` permits,
//! so at most `size` jobs run at any moment. Compared to the reused-worker
//! pool this starts and tears down immediately, which makes it the better
//! fit for pools with short lifetimes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::inflight::InFlight;
use crate::{Job, PoolError, SubmitOptions, registry};

/// A pool limited to `size` concurrently running jobs.
pub struct Pool {
    name: String,
    size: usize,
    semaphore: Arc<Semaphore>,
    inflight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Pool {
    /// Creates a pool allowing `size` concurrent jobs.
    ///
    /// Naming and registration follow the same rules as the reused-worker
    /// pool: unique process-wide, suffixed on collision, skipped when
    /// empty, and free of whitespace, hyphens, and digits.
    pub fn new(name: &str, size: usize) -> Result<Arc<Self>, PoolError> {
        if size < 1 {
            return Err(PoolError::Size);
        }
        registry::validate_base_name(name)?;
        let registered = registry::claim(name);

        let pool = Arc::new(Self {
            name: registered.unwrap_or_default(),
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            inflight: Arc::new(InFlight::new()),
            closed: AtomicBool::new(false),
        });
        if !pool.name.is_empty() {
            let dyn_pool: Arc<dyn crate::Pool> = pool.clone();
            let handle: std::sync::Weak<dyn crate::Pool> = Arc::downgrade(&dyn_pool);
            registry::attach(&pool.name, handle);
        }
        Ok(pool)
    }
}

#[async_trait]
impl crate::Pool for Pool {
    async fn submit_with(
        &self,
        ctx: CancellationToken,
        job: Job,
        opts: SubmitOptions,
    ) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed {
                name: self.name.clone(),
            });
        }
        let started = Instant::now();
        let caller = opts.caller_name();

        // Non-blocking submits run outside the permit budget entirely.
        let permit = if opts.non_blocking {
            None
        } else {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => {
                    debug!(
                        pool = %self.name,
                        caller,
                        wait_ns = started.elapsed().as_nanos() as u64,
                        "submit blocking on a permit",
                    );
                    let permit = self
                        .semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| PoolError::Closed {
                            name: self.name.clone(),
                        })?;
                    debug!(
                        pool = %self.name,
                        caller,
                        wait_ns = started.elapsed().as_nanos() as u64,
                        "submit unblocked",
                    );
                    Some(permit)
                }
                Err(TryAcquireError::Closed) => {
                    return Err(PoolError::Closed {
                        name: self.name.clone(),
                    });
                }
            }
        };

        debug!(
            pool = %self.name,
            caller,
            non_blocking = opts.non_blocking,
            submit_latency_ns = started.elapsed().as_nanos() as u64,
            "job submitted",
        );

        self.inflight.add(1);
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            let _permit = permit;
            job(ctx).await;
            inflight.done();
        });
        Ok(())
    }

    async fn wait(&self) {
        self.inflight.wait().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inflight.wait().await;
        self.semaphore.close();
        registry::release(&self.name);
    }

    fn len(&self) -> usize {
        self.size
    }

    fn running(&self) -> usize {
        self.inflight.count().max(0) as usize
    }

    fn name(&self) -> &str {
        &self.name
    }
}
