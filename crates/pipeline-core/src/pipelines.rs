//! The runtime: N pipeline instances over shared input and output, with
//! request groups multiplexing in and demultiplexing back out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Span, error};

use wait_group::WaitGroup;
use work_pool::InFlight;

use crate::demux::Demux;
use crate::error::{ConfigError, PipelineError};
use crate::options::{Options, reset_next};
use crate::order::InOrder;
use crate::request::Request;
use crate::state_machine::{StageTable, StateMachine};
use crate::stats::{Stats, StatsCell};
use crate::telemetry;
use crate::worker::{Input, SharedInput, Worker};

/// A set of parallel pipelines executing one state machine.
///
/// `parallelism` instances each run one worker per stage, all consuming the
/// same input, so up to `parallelism × stages` requests are in flight at
/// once. Producers submit through [`RequestGroup`]s and receive their own
/// requests back on the group's output stream.
pub struct Pipelines<SM: StateMachine> {
    name: Arc<str>,
    in_tx: mpsc::Sender<Input<SM::Data>>,
    sm: Arc<SM>,
    demux: Arc<Demux<u64, Request<SM::Data>>>,
    demux_task: JoinHandle<()>,
    workers: WaitGroup,
    worker_count: usize,
    out_tx: mpsc_queue::QueueSender<Request<SM::Data>>,
    pending: Arc<InFlight>,
    closed: Arc<AtomicBool>,
    stats: Arc<StatsCell>,
    group_ids: AtomicU64,
    ordered: bool,
}

impl<SM: StateMachine> std::fmt::Debug for Pipelines<SM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipelines")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("ordered", &self.ordered)
            .finish_non_exhaustive()
    }
}

impl<SM: StateMachine> Pipelines<SM> {
    /// Creates a runtime named `name` with `parallelism` pipeline
    /// instances executing `sm`.
    ///
    /// Fails when `parallelism` is zero, when the state machine registers
    /// no stages, or when an option carries an invalid value.
    pub async fn new(
        name: impl Into<String>,
        parallelism: usize,
        sm: SM,
        options: Options<SM::Data>,
    ) -> Result<Self, ConfigError> {
        if parallelism < 1 {
            return Err(ConfigError::Parallelism);
        }
        options.validate()?;

        let sm = Arc::new(sm);
        let table = Arc::new(StageTable::build(&*sm)?);
        let workers_per_instance = table.len() + options.sub_stages;

        let name: Arc<str> = Arc::from(name.into());

        let mut pre_processors = Vec::with_capacity(options.pre_processors.len() + 1);
        pre_processors.push(reset_next::<SM::Data>());
        pre_processors.extend(options.pre_processors);
        let pre_processors: Arc<[_]> = pre_processors.into();

        let (in_tx, in_rx) = mpsc::channel(1);
        let input: SharedInput<SM::Data> = Arc::new(tokio::sync::Mutex::new(in_rx));
        let (out_tx, out_rx) = mpsc_queue::bounded(1);

        let demux = {
            let name = name.clone();
            Arc::new(Demux::new(
                |req: &Request<SM::Data>| req.group,
                move |req: Request<SM::Data>| {
                    // Keys are assigned by submit and receivers live until
                    // the group closes, so reaching this is a wiring bug.
                    error!(
                        pipeline = %name,
                        group = req.group,
                        item = req.item,
                        "no receiver registered for request group",
                    );
                },
            ))
        };
        let demux_task = demux.clone().spawn(out_rx);

        let stats = Arc::new(StatsCell::new());
        let workers = WaitGroup::new(format!("{name} workers"));
        for instance in 0..parallelism {
            for _ in 0..workers_per_instance {
                let worker = Worker {
                    pipeline: name.clone(),
                    instance,
                    sm: sm.clone(),
                    table: table.clone(),
                    pre_processors: pre_processors.clone(),
                    dag: options.dag,
                    delay_warning: options.delay_warning,
                    stats: stats.clone(),
                    out: out_tx.clone(),
                };
                let input = input.clone();
                workers
                    .go(CancellationToken::new(), move |_ctx| async move {
                        worker.run(input).await;
                        Ok(())
                    })
                    .await;
            }
        }

        Ok(Self {
            name,
            in_tx,
            sm,
            demux,
            demux_task,
            workers,
            worker_count: parallelism * workers_per_instance,
            out_tx,
            pending: Arc::new(InFlight::new()),
            closed: Arc::new(AtomicBool::new(false)),
            stats,
            group_ids: AtomicU64::new(0),
            ordered: options.ordered,
        })
    }

    /// Creates an unnamed request group. See [`named_request_group`].
    ///
    /// [`named_request_group`]: Self::named_request_group
    pub fn new_request_group(&self) -> RequestGroup<SM::Data> {
        self.named_request_group("")
    }

    /// Creates a request group whose `name` labels its telemetry. Many
    /// groups can feed the same runtime concurrently; each gets exactly
    /// its own requests back.
    pub fn named_request_group(&self, name: impl Into<String>) -> RequestGroup<SM::Data> {
        let id = self.group_ids.fetch_add(1, Ordering::Relaxed) + 1;

        let (group_tx, group_rx) = mpsc::channel(1);
        let (user_tx, user_rx) = mpsc::channel(1);
        self.demux.add_receiver(id, group_tx);

        let pending = Arc::new(InFlight::new());
        spawn_forwarder(
            group_rx,
            user_tx,
            self.ordered,
            pending.clone(),
            self.pending.clone(),
        );

        RequestGroup {
            name: name.into(),
            id,
            pipeline: self.name.clone(),
            in_tx: self.in_tx.clone(),
            closed: self.closed.clone(),
            demux: self.demux.clone(),
            pending,
            runtime_pending: self.pending.clone(),
            items: AtomicU64::new(0),
            started: parking_lot::Mutex::new(None),
            out: Some(user_rx),
        }
    }

    /// A point-in-time snapshot of the runtime's counters.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Shuts the runtime down: closes the input, drains every in-flight
    /// request through to its group, then closes the state machine.
    ///
    /// Close only after all `submit` calls have returned; late submitters
    /// are rejected with [`PipelineError::Closed`]. Consuming `self` makes
    /// a second close unrepresentable. Request groups must be closed (and
    /// their outputs drained) for this to return.
    pub async fn close(self) {
        self.closed.store(true, Ordering::Release);
        // One shutdown notice per worker, queued behind every accepted
        // request: the input drains in order, then the workers exit.
        for _ in 0..self.worker_count {
            if self.in_tx.send(Input::Shutdown).await.is_err() {
                break;
            }
        }
        if let Err(err) = self.workers.wait().await {
            error!(pipeline = %self.name, error = %err, "pipeline worker failed");
        }
        // Workers are gone, so the output is complete; let the demux
        // finish routing what remains.
        self.out_tx.close();
        let _ = self.demux_task.await;
        // Every submitted request has now been handed to its group.
        self.pending.wait().await;
        self.sm.close().await;
    }
}

/// Moves requests from the demux to the group's user-facing stream,
/// re-establishing submission order when requested.
fn spawn_forwarder<T: Send + 'static>(
    mut group_rx: mpsc::Receiver<Request<T>>,
    user_tx: mpsc::Sender<Request<T>>,
    ordered: bool,
    pending: Arc<InFlight>,
    runtime_pending: Arc<InFlight>,
) {
    tokio::spawn(async move {
        let mut reorder = ordered.then(|| InOrder::new(|req: &Request<T>| req.item, user_tx.clone()));
        // Once the consumer drops the output stream, remaining requests
        // are discarded but still accounted for, so group close cannot
        // wedge on an abandoned consumer.
        let mut consumer_gone = false;

        while let Some(req) = group_rx.recv().await {
            telemetry::processing_end(&req.span, req.queued_at.elapsed(), req.err.as_ref());
            pending.done();
            runtime_pending.done();
            if consumer_gone {
                continue;
            }
            let delivered = match reorder.as_mut() {
                Some(reorder) => reorder.push(req).await,
                None => user_tx.send(req).await.is_ok(),
            };
            if !delivered {
                consumer_gone = true;
            }
        }
        // Dropping the sender (and any reassembler) closes the user
        // stream.
    });
}

/// Releases a submission's in-flight slots unless the request was
/// accepted onto the input.
struct SubmitGuard<'a> {
    group: &'a InFlight,
    runtime: &'a InFlight,
    accepted: bool,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if !self.accepted {
            self.group.done();
            self.runtime.done();
        }
    }
}

/// A producer's handle onto a shared runtime.
///
/// All requests submitted through one group come back on this group's
/// output stream — and only here. The consumer **must** drain [`out`] until
/// it closes; an undrained group eventually stalls the whole runtime, by
/// design (backpressure reaches all the way back to `submit`).
///
/// [`out`]: Self::out
pub struct RequestGroup<T> {
    name: String,
    id: u64,
    pipeline: Arc<str>,
    in_tx: mpsc::Sender<Input<T>>,
    closed: Arc<AtomicBool>,
    demux: Arc<Demux<u64, Request<T>>>,
    pending: Arc<InFlight>,
    runtime_pending: Arc<InFlight>,
    items: AtomicU64,
    started: parking_lot::Mutex<Option<(Span, Instant)>>,
    /// The group's output stream. Take it once (`group.out.take()`), drain
    /// it until it closes.
    pub out: Option<mpsc::Receiver<Request<T>>>,
}

impl<T: Send + 'static> RequestGroup<T> {
    /// Submits a request into the runtime.
    ///
    /// Assigns the group id and the next item number, then waits for the
    /// shared input to accept the request. Returns
    /// [`PipelineError::Cancelled`] when the request's token fires first,
    /// and [`PipelineError::Closed`] when the runtime has shut down.
    pub async fn submit(&self, mut req: Request<T>) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        if req.ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let group_span = {
            let mut started = self.started.lock();
            let (span, _) = started.get_or_insert_with(|| {
                let span = telemetry::group_span(&self.pipeline, &self.name, self.id);
                telemetry::group_started(&span);
                (span, Instant::now())
            });
            span.clone()
        };

        req.group = self.id;
        req.item = self.items.fetch_add(1, Ordering::Relaxed);
        req.queued_at = Instant::now();
        req.span = telemetry::request_span(&group_span, req.item);

        // The guard keeps the in-flight accounting honest on every exit
        // path, including this future being dropped while the send waits.
        self.runtime_pending.add(1);
        self.pending.add(1);
        let mut guard = SubmitGuard {
            group: &self.pending,
            runtime: &self.runtime_pending,
            accepted: false,
        };

        let ctx = req.ctx.clone();
        tokio::select! {
            _ = ctx.cancelled() => Err(PipelineError::Cancelled),
            sent = self.in_tx.send(Input::Req(req)) => match sent {
                Ok(()) => {
                    guard.accepted = true;
                    Ok(())
                }
                Err(_) => Err(PipelineError::Closed),
            }
        }
    }

    /// The group's telemetry label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals that this group is done submitting, waits for its in-flight
    /// requests to reach the output side, and detaches from the runtime.
    /// The group's output stream closes once the consumer has drained it.
    pub async fn close(self) {
        self.pending.wait().await;
        if let Some((span, started)) = self.started.lock().as_ref() {
            telemetry::group_finished(span, Some(started.elapsed()));
        }
        // Drops the demux-side sender; the forwarder then closes the user
        // stream.
        self.demux.remove_receiver(&self.id);
    }
}
