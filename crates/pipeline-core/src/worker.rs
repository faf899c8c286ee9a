//! Stage execution workers.
//!
//! Each pipeline instance runs one worker per stage, and every worker runs
//! the same loop: take a request off the shared input, drive it through
//! stages until it terminates, push it to the shared output. A request is
//! owned by exactly one worker from pickup to output push; the per-stage
//! worker multiplicity exists so *different* requests can occupy different
//! stages at the same time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use mpsc_queue::QueueSender;

use crate::cycle::SeenStages;
use crate::error::PipelineError;
use crate::options::PreProcessor;
use crate::request::Request;
use crate::state_machine::{START, StageTable, StateMachine};
use crate::stats::StatsCell;
use crate::telemetry;

/// One element on the shared input: a request, or one worker's shutdown
/// notice. Shutdown notices are enqueued behind all accepted requests, one
/// per worker, so the input drains fully before any worker exits.
pub(crate) enum Input<T> {
    Req(Request<T>),
    Shutdown,
}

/// The input side shared by every worker of a runtime.
pub(crate) type SharedInput<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<Input<T>>>>;

pub(crate) struct Worker<SM: StateMachine> {
    pub(crate) pipeline: Arc<str>,
    pub(crate) instance: usize,
    pub(crate) sm: Arc<SM>,
    pub(crate) table: Arc<StageTable<SM>>,
    pub(crate) pre_processors: Arc<[PreProcessor<SM::Data>]>,
    pub(crate) dag: bool,
    pub(crate) delay_warning: Option<Duration>,
    pub(crate) stats: Arc<StatsCell>,
    pub(crate) out: QueueSender<Request<SM::Data>>,
}

impl<SM: StateMachine> Worker<SM> {
    pub(crate) async fn run(self, input: SharedInput<SM::Data>) {
        loop {
            // Hold the receiver lock only for the pickup, never while
            // processing, so sibling workers keep draining the input.
            let next = { input.lock().await.recv().await };
            let mut req = match next {
                Some(Input::Req(req)) => req,
                // Each worker consumes exactly one shutdown notice.
                Some(Input::Shutdown) | None => return,
            };

            req.ingested_at = Instant::now();
            let queued = req.ingested_at.duration_since(req.queued_at);
            self.stats.record_ingest(queued);
            telemetry::processing_start(&req.span, queued);

            let req = self.process(req).await;

            self.stats.record_exit(req.ingested_at.elapsed());
            self.push_out(req).await;
        }
    }

    /// Drives one request through stages until it terminates.
    async fn process(&self, mut req: Request<SM::Data>) -> Request<SM::Data> {
        if self.dag {
            req.seen = Some(SeenStages::acquire());
        }

        let mut stage = START;
        'stages: loop {
            if req.ctx.is_cancelled() {
                req.err = Some(PipelineError::Cancelled);
                break;
            }

            if let Some(seen) = req.seen.as_mut()
                && seen.seen(stage)
            {
                let trace = seen.call_trace();
                req.err = Some(PipelineError::Cyclic { trace });
                break;
            }

            for pp in self.pre_processors.iter() {
                req = pp(req);
                if req.err.is_some() {
                    break 'stages;
                }
            }

            let Some(run) = self.table.get(stage) else {
                req.err = Some(PipelineError::UnknownStage { name: stage.name() });
                break;
            };
            req = run(self.sm.as_ref(), req).await;
            if req.err.is_some() {
                break;
            }

            match req.next {
                Some(next) => stage = next,
                None => break,
            }
        }

        if let Some(seen) = req.seen.take() {
            seen.release();
        }
        req
    }

    /// Hands a finished request to the shared output, logging periodically
    /// if the push has to wait past the configured threshold.
    async fn push_out(&self, req: Request<SM::Data>) {
        let Some(threshold) = self.delay_warning else {
            self.out.push(req).await;
            return;
        };

        let started = Instant::now();
        loop {
            match tokio::time::timeout(threshold, self.out.reserve()).await {
                Ok(permit) => {
                    permit.send(req);
                    return;
                }
                Err(_) => warn!(
                    pipeline = %self.pipeline,
                    instance = self.instance,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "output delivery delayed past the warning threshold",
                ),
            }
        }
    }
}
