//! Fixed-size pool of long-lived workers.
//!
//! `size` worker tasks consume a shared, capacity-1 submission channel, so
//! a submit waits once every worker is busy and the single buffered slot is
//! taken. Workers are reused across jobs, which keeps per-job overhead to a
//! channel hop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::inflight::InFlight;
use crate::{Job, PoolError, SubmitOptions, registry};

struct Submission {
    ctx: CancellationToken,
    job: Job,
}

/// A pool of reused worker tasks.
pub struct Pool {
    name: String,
    size: usize,
    tx: Mutex<Option<mpsc::Sender<Submission>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    inflight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Pool {
    /// Creates a pool of `size` workers.
    ///
    /// `name` is registered process-wide for telemetry; collisions are
    /// disambiguated with a numeric suffix, and an empty name skips
    /// registration. Names cannot contain whitespace, hyphens, or digits.
    pub fn new(name: &str, size: usize) -> Result<Arc<Self>, PoolError> {
        if size < 1 {
            return Err(PoolError::Size);
        }
        registry::validate_base_name(name)?;
        let registered = registry::claim(name);

        let (tx, rx) = mpsc::channel::<Submission>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let inflight = Arc::new(InFlight::new());

        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let rx = rx.clone();
            let inflight = inflight.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let submission = { rx.lock().await.recv().await };
                    let Some(Submission { ctx, job }) = submission else {
                        break;
                    };
                    job(ctx).await;
                    inflight.done();
                }
            }));
        }

        let pool = Arc::new(Self {
            name: registered.unwrap_or_default(),
            size,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            inflight,
            closed: AtomicBool::new(false),
        });
        if !pool.name.is_empty() {
            let dyn_pool: Arc<dyn crate::Pool> = pool.clone();
            let handle: std::sync::Weak<dyn crate::Pool> = Arc::downgrade(&dyn_pool);
            registry::attach(&pool.name, handle);
        }
        Ok(pool)
    }

    fn sender(&self) -> Result<mpsc::Sender<Submission>, PoolError> {
        self.tx.lock().clone().ok_or_else(|| PoolError::Closed {
            name: self.name.clone(),
        })
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
        let tx = self.sender()?;
        let started = Instant::now();
        let caller = opts.caller_name();

        self.inflight.add(1);
        let submission = Submission { ctx, job };

        match tx.try_send(submission) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(submission)) => {
                if opts.non_blocking {
                    // All workers busy: run outside the pool's budget
                    // rather than wait for a slot.
                    let inflight = self.inflight.clone();
                    tokio::spawn(async move {
                        (submission.job)(submission.ctx).await;
                        inflight.done();
                    });
                } else {
                    debug!(
                        pool = %self.name,
                        caller,
                        wait_ns = started.elapsed().as_nanos() as u64,
                        "submit blocking on a free worker",
                    );
                    if tx.send(submission).await.is_err() {
                        self.inflight.done();
                        return Err(PoolError::Closed {
                            name: self.name.clone(),
                        });
                    }
                    debug!(
                        pool = %self.name,
                        caller,
                        wait_ns = started.elapsed().as_nanos() as u64,
                        "submit unblocked",
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inflight.done();
                return Err(PoolError::Closed {
                    name: self.name.clone(),
                });
            }
        }

        debug!(
            pool = %self.name,
            caller,
            non_blocking = opts.non_blocking,
            submit_latency_ns = started.elapsed().as_nanos() as u64,
            "job submitted",
        );
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
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
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
