//! End-to-end pipeline scenarios: completeness, ordering, isolation,
//! cycle detection, cancellation, backpressure, and stats.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use pipeline_core::{
    BoxFuture, Options, PipelineError, Pipelines, Request, START, StageId, StageRegistry,
    StateMachine, async_trait, test_utils,
};

/// One stage that just terminates: the simplest possible state machine.
struct PassThrough;

#[async_trait]
impl StateMachine for PassThrough {
    type Data = u64;

    async fn start(&self, mut req: Request<u64>) -> Request<u64> {
        req.finish();
        req
    }
}

fn request(data: u64) -> Request<u64> {
    Request::new(CancellationToken::new(), data)
}

/// Drains a group's output into a vector on a separate task.
fn drain<T: Send + 'static>(
    mut out: mpsc::Receiver<Request<T>>,
) -> tokio::task::JoinHandle<Vec<Request<T>>> {
    tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(req) = out.recv().await {
            got.push(req);
        }
        got
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ordered_sequential_integers() {
    test_utils::init_tracing();
    const COUNT: u64 = 100_000;

    let pipelines = Pipelines::new("ordered", 10, PassThrough, Options::new().ordered())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    for i in 0..COUNT {
        group.submit(request(i)).await.unwrap();
    }
    group.close().await;

    let got = consumer.await.unwrap();
    assert_eq!(got.len() as u64, COUNT);
    for (i, req) in got.iter().enumerate() {
        assert!(req.err.is_none(), "request {i} failed: {:?}", req.err);
        assert_eq!(req.data, i as u64, "output out of submission order");
        assert_eq!(req.item(), i as u64);
    }

    pipelines.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn unordered_run_is_complete() {
    const COUNT: u64 = 10_000;

    let pipelines = Pipelines::new("unordered", 8, PassThrough, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    for i in 0..COUNT {
        group.submit(request(i)).await.unwrap();
    }
    group.close().await;

    let mut got: Vec<u64> = consumer.await.unwrap().iter().map(|r| r.data).collect();
    got.sort_unstable();
    let want: Vec<u64> = (0..COUNT).collect();
    assert_eq!(got, want, "every submitted request must come back exactly once");

    pipelines.close().await;
}

// --- ETL-style batches with a validation failure -------------------------

#[derive(Debug, Clone, Default)]
struct Record {
    first: String,
    last: String,
    id: u64,
    birth: Option<Duration>,
}

/// Stand-in for a remote identity service: assigns a birth offset derived
/// from the record id.
#[derive(Default)]
struct IdClient;

impl IdClient {
    async fn call(&self, mut records: Vec<Record>) -> Result<Vec<Record>, std::io::Error> {
        tokio::task::yield_now().await;
        for rec in &mut records {
            rec.birth = Some(Duration::from_secs(rec.id * 86_400));
        }
        Ok(records)
    }
}

struct RecordSm {
    client: IdClient,
}

const VERIFY_ID: StageId = StageId::new("verify_id");

#[async_trait]
impl StateMachine for RecordSm {
    type Data = Vec<Record>;

    async fn start(&self, mut req: Request<Vec<Record>>) -> Request<Vec<Record>> {
        for rec in &mut req.data {
            rec.first = rec.first.trim().to_string();
            rec.last = rec.last.trim().to_string();
            if rec.first.is_empty() {
                req.err = Some(PipelineError::stage("record first name cannot be empty"));
                return req;
            }
            if rec.last.is_empty() {
                req.err = Some(PipelineError::stage("record last name cannot be empty"));
                return req;
            }
        }
        req.route(VERIFY_ID);
        req
    }

    fn stages(&self, reg: &mut StageRegistry<Self>) {
        reg.register(VERIFY_ID, Self::verify_id);
    }
}

impl RecordSm {
    fn verify_id(&self, mut req: Request<Vec<Record>>) -> BoxFuture<'_, Request<Vec<Record>>> {
        Box::pin(async move {
            match self.client.call(std::mem::take(&mut req.data)).await {
                Ok(records) => req.data = records,
                Err(err) => req.err = Some(PipelineError::stage_source(err)),
            }
            req.finish();
            req
        })
    }
}

fn record_batches(batches: u64, error_at: Option<u64>) -> Vec<Vec<Record>> {
    let mut next_id = 0u64;
    (0..batches)
        .map(|batch| {
            (0..10)
                .map(|i| {
                    next_id += 1;
                    let first = if error_at == Some(batch) && i == 0 {
                        String::new()
                    } else {
                        format!(" person{next_id} ")
                    };
                    Record {
                        first,
                        last: format!("family{next_id}"),
                        id: next_id,
                        birth: None,
                    }
                })
                .collect()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn error_at_batch_500() {
    let pipelines = Pipelines::new(
        "etl",
        10,
        RecordSm {
            client: IdClient,
        },
        Options::new(),
    )
    .await
    .unwrap();

    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    for batch in record_batches(1_000, Some(500)) {
        group
            .submit(Request::new(CancellationToken::new(), batch))
            .await
            .unwrap();
    }
    group.close().await;

    let got = consumer.await.unwrap();
    assert_eq!(got.len(), 1_000);
    let failures: Vec<_> = got.iter().filter(|r| r.err.is_some()).collect();
    assert_eq!(failures.len(), 1, "exactly the poisoned batch must fail");
    for req in got.iter().filter(|r| r.err.is_none()) {
        for rec in &req.data {
            assert_eq!(rec.birth, Some(Duration::from_secs(rec.id * 86_400)));
            assert!(!rec.first.starts_with(' '), "names must be trimmed");
        }
    }

    pipelines.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn clean_batches_all_verify() {
    let pipelines = Pipelines::new(
        "etl",
        10,
        RecordSm {
            client: IdClient,
        },
        Options::new(),
    )
    .await
    .unwrap();

    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    for batch in record_batches(1_000, None) {
        group
            .submit(Request::new(CancellationToken::new(), batch))
            .await
            .unwrap();
    }
    group.close().await;

    let got = consumer.await.unwrap();
    assert_eq!(got.len(), 1_000);
    assert!(got.iter().all(|r| r.err.is_none()));

    pipelines.close().await;
}

// --- Cycle detection -----------------------------------------------------

struct ParitySm;

const ROUTE_BACK: StageId = StageId::new("route_back");
const END: StageId = StageId::new("end");

#[async_trait]
impl StateMachine for ParitySm {
    type Data = u64;

    async fn start(&self, mut req: Request<u64>) -> Request<u64> {
        if req.data % 2 == 0 {
            req.route(ROUTE_BACK);
        } else {
            req.route(END);
        }
        req
    }

    fn stages(&self, reg: &mut StageRegistry<Self>) {
        reg.register(ROUTE_BACK, Self::route_back);
        reg.register(END, Self::end);
    }
}

impl ParitySm {
    fn route_back(&self, mut req: Request<u64>) -> BoxFuture<'_, Request<u64>> {
        Box::pin(async move {
            req.route(START);
            req
        })
    }

    fn end(&self, mut req: Request<u64>) -> BoxFuture<'_, Request<u64>> {
        Box::pin(async move {
            req.finish();
            req
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dag_parity_cycles() {
    let pipelines = Pipelines::new("parity", 10, ParitySm, Options::new().dag())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    for i in 0..4 {
        group.submit(request(i)).await.unwrap();
    }
    group.close().await;

    let mut got = consumer.await.unwrap();
    got.sort_by_key(|r| r.data);
    assert_eq!(got.len(), 4);
    for req in &got {
        if req.data % 2 == 0 {
            let err = req.err.as_ref().expect("even requests revisit start");
            assert!(err.is_cyclic(), "got {err}, want a cyclic error");
            assert!(err.to_string().contains("start"), "trace names the loop");
        } else {
            assert!(req.err.is_none(), "odd request failed: {:?}", req.err);
        }
    }

    pipelines.close().await;
}

/// Visits the entry twice, but terminates on the second pass.
struct RevisitSm;

#[derive(Debug, Default)]
struct Revisit {
    second_pass: bool,
}

#[async_trait]
impl StateMachine for RevisitSm {
    type Data = Revisit;

    async fn start(&self, mut req: Request<Revisit>) -> Request<Revisit> {
        if req.data.second_pass {
            req.finish();
        } else {
            req.data.second_pass = true;
            req.route(START);
        }
        req
    }
}

#[tokio::test]
async fn revisit_fails_only_under_dag_mode() {
    // Acyclic mode: the second visit to the entry is an error.
    let strict = Pipelines::new("strict", 2, RevisitSm, Options::new().dag())
        .await
        .unwrap();
    let mut group = strict.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    group
        .submit(Request::new(CancellationToken::new(), Revisit::default()))
        .await
        .unwrap();
    group.close().await;
    let got = consumer.await.unwrap();
    assert!(got[0].err.as_ref().is_some_and(PipelineError::is_cyclic));
    strict.close().await;

    // Without it, the same machine completes cleanly.
    let lax = Pipelines::new("lax", 2, RevisitSm, Options::new())
        .await
        .unwrap();
    let mut group = lax.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    group
        .submit(Request::new(CancellationToken::new(), Revisit::default()))
        .await
        .unwrap();
    group.close().await;
    let got = consumer.await.unwrap();
    assert!(got[0].err.is_none());
    assert!(got[0].data.second_pass);
    lax.close().await;
}

// --- Unknown stage routing ----------------------------------------------

struct LostSm;

#[async_trait]
impl StateMachine for LostSm {
    type Data = u64;

    async fn start(&self, mut req: Request<u64>) -> Request<u64> {
        req.route(StageId::new("nowhere"));
        req
    }
}

#[tokio::test]
async fn routing_to_an_unregistered_stage_fails_the_request() {
    let pipelines = Pipelines::new("lost", 1, LostSm, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    group.submit(request(1)).await.unwrap();
    group.close().await;

    let got = consumer.await.unwrap();
    match got[0].err.as_ref() {
        Some(PipelineError::UnknownStage { name }) => assert_eq!(*name, "nowhere"),
        other => panic!("want UnknownStage, got {other:?}"),
    }
    pipelines.close().await;
}

// --- Cancellation --------------------------------------------------------

#[derive(Debug)]
struct CancelProbe {
    hold_until_cancelled: bool,
    tag: u64,
}

struct CancelSm;

const FINAL: StageId = StageId::new("final");

#[async_trait]
impl StateMachine for CancelSm {
    type Data = CancelProbe;

    async fn start(&self, mut req: Request<CancelProbe>) -> Request<CancelProbe> {
        if req.data.hold_until_cancelled {
            req.ctx.cancelled().await;
        }
        req.route(FINAL);
        req
    }

    fn stages(&self, reg: &mut StageRegistry<Self>) {
        reg.register(FINAL, Self::done);
    }
}

impl CancelSm {
    fn done(&self, mut req: Request<CancelProbe>) -> BoxFuture<'_, Request<CancelProbe>> {
        Box::pin(async move {
            req.finish();
            req
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_one_request_spares_the_rest() {
    let pipelines = Pipelines::new("cancel", 4, CancelSm, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    let doomed = CancellationToken::new();
    group
        .submit(Request::new(
            doomed.clone(),
            CancelProbe {
                hold_until_cancelled: true,
                tag: 0,
            },
        ))
        .await
        .unwrap();
    for tag in 1..5 {
        group
            .submit(Request::new(
                CancellationToken::new(),
                CancelProbe {
                    hold_until_cancelled: false,
                    tag,
                },
            ))
            .await
            .unwrap();
    }
    doomed.cancel();
    group.close().await;

    let got = consumer.await.unwrap();
    assert_eq!(got.len(), 5);
    for req in &got {
        if req.data.tag == 0 {
            assert!(
                matches!(req.err, Some(PipelineError::Cancelled)),
                "cancelled request must carry the cancellation error",
            );
        } else {
            assert!(req.err.is_none(), "request {} failed", req.data.tag);
        }
    }
    pipelines.close().await;
}

#[tokio::test]
async fn submit_rejects_an_already_cancelled_request() {
    let pipelines = Pipelines::new("precancel", 1, PassThrough, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());

    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = group.submit(Request::new(ctx, 1)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    group.close().await;
    assert!(consumer.await.unwrap().is_empty());
    pipelines.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_blocked_submit_releases_it() {
    // Nobody drains, so the runtime's capacity fills and submit blocks;
    // cancelling the blocked request's token must fail just that submit.
    let pipelines = Pipelines::new("wedged", 1, PassThrough, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let mut out = group.out.take().unwrap();

    let group = Arc::new(group);
    let filler = {
        let group = group.clone();
        tokio::spawn(async move {
            let mut accepted = 0u64;
            while timeout(Duration::from_millis(200), group.submit(request(accepted)))
                .await
                .is_ok()
            {
                accepted += 1;
            }
            accepted
        })
    };
    let accepted = filler.await.unwrap();
    assert!(accepted > 0);

    let doomed = CancellationToken::new();
    let blocked = {
        let group = group.clone();
        let doomed = doomed.clone();
        tokio::spawn(async move { group.submit(Request::new(doomed, 999)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "submit must be wedged");
    doomed.cancel();
    let err = timeout(Duration::from_secs(2), blocked)
        .await
        .expect("cancellation must release the blocked submit")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    // Drain and shut down cleanly.
    let consumer = tokio::spawn(async move {
        let mut count = 0u64;
        while out.recv().await.is_some() {
            count += 1;
        }
        count
    });
    let group = Arc::try_unwrap(group).unwrap_or_else(|_| panic!("group still shared"));
    group.close().await;
    assert_eq!(consumer.await.unwrap(), accepted);
    pipelines.close().await;
}

// --- Isolation across groups ---------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_groups_see_only_their_own_requests() {
    let pipelines = Arc::new(
        Pipelines::new("shared", 6, PassThrough, Options::new())
            .await
            .unwrap(),
    );

    let mut producers = Vec::new();
    for lane in 0..4u64 {
        let mut group = pipelines.named_request_group(format!("lane{lane}"));
        let consumer = drain(group.out.take().unwrap());
        producers.push(tokio::spawn(async move {
            let base = lane * 1_000_000;
            for i in 0..2_000 {
                group.submit(request(base + i)).await.unwrap();
            }
            group.close().await;
            let got = consumer.await.unwrap();
            (lane, got)
        }));
    }

    for producer in producers {
        let (lane, got) = producer.await.unwrap();
        let base = lane * 1_000_000;
        assert_eq!(got.len(), 2_000);
        for req in &got {
            assert!(
                (base..base + 2_000).contains(&req.data),
                "group {lane} received foreign request {}",
                req.data,
            );
        }
    }

    match Arc::try_unwrap(pipelines) {
        Ok(pipelines) => pipelines.close().await,
        Err(_) => panic!("all producers finished; no handles may remain"),
    }
}

// --- Drain requirement ---------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undrained_output_stalls_submit_until_drained() {
    let pipelines = Pipelines::new("stall", 1, PassThrough, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let mut out = group.out.take().unwrap();

    let submitted = Arc::new(AtomicUsize::new(0));
    let producer = {
        let submitted = submitted.clone();
        tokio::spawn(async move {
            for i in 0..32 {
                group.submit(request(i)).await.unwrap();
                submitted.fetch_add(1, Ordering::SeqCst);
            }
            group.close().await;
        })
    };

    // Nobody drains: the runtime's internal capacity fills and submission
    // wedges well short of 32.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stalled_at = submitted.load(Ordering::SeqCst);
    assert!(!producer.is_finished(), "submit must stall without a drainer");
    assert!(stalled_at < 32, "stall must happen before all submissions");

    // Draining releases the stall.
    let consumer = tokio::spawn(async move {
        let mut count = 0;
        while out.recv().await.is_some() {
            count += 1;
        }
        count
    });
    timeout(Duration::from_secs(5), producer)
        .await
        .expect("draining must unstick the producer")
        .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap(),
        32
    );

    pipelines.close().await;
}

// --- Per-request sequential execution ------------------------------------

#[derive(Debug)]
struct Guarded {
    entries: Arc<AtomicI32>,
    overlapped: Arc<AtomicBool>,
}

struct GuardSm;

const SECOND: StageId = StageId::new("second");

impl GuardSm {
    async fn probe(req: &Request<Guarded>) {
        if req.data.entries.fetch_add(1, Ordering::SeqCst) != 0 {
            req.data.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        req.data.entries.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateMachine for GuardSm {
    type Data = Guarded;

    async fn start(&self, mut req: Request<Guarded>) -> Request<Guarded> {
        Self::probe(&req).await;
        req.route(SECOND);
        req
    }

    fn stages(&self, reg: &mut StageRegistry<Self>) {
        reg.register(SECOND, Self::second);
    }
}

impl GuardSm {
    fn second(&self, mut req: Request<Guarded>) -> BoxFuture<'_, Request<Guarded>> {
        Box::pin(async move {
            Self::probe(&req).await;
            req.finish();
            req
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn a_request_is_never_in_two_stages_at_once() {
    let pipelines = Pipelines::new("guard", 8, GuardSm, Options::new())
        .await
        .unwrap();
    let overlapped = Arc::new(AtomicBool::new(false));

    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    for _ in 0..2_000 {
        group
            .submit(Request::new(
                CancellationToken::new(),
                Guarded {
                    entries: Arc::new(AtomicI32::new(0)),
                    overlapped: overlapped.clone(),
                },
            ))
            .await
            .unwrap();
    }
    group.close().await;
    consumer.await.unwrap();

    assert!(
        !overlapped.load(Ordering::SeqCst),
        "stage execution within one request must be sequential",
    );
    pipelines.close().await;
}

// --- Stats ----------------------------------------------------------------

struct SleepSm;

#[async_trait]
impl StateMachine for SleepSm {
    type Data = u64;

    async fn start(&self, mut req: Request<u64>) -> Request<u64> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        req.finish();
        req
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_are_consistent_with_the_output() {
    let pipelines = Pipelines::new("stats", 4, SleepSm, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    for i in 0..100 {
        group.submit(request(i)).await.unwrap();
    }
    group.close().await;
    let got = consumer.await.unwrap();

    let stats = pipelines.stats();
    assert_eq!(stats.completed, got.len() as i64);
    assert_eq!(stats.running, 0);
    assert!(stats.min <= stats.avg && stats.avg <= stats.max);
    assert!(stats.min >= Duration::from_millis(1), "stage sleeps 1ms");
    assert!(stats.ingest.min <= stats.ingest.avg && stats.ingest.avg <= stats.ingest.max);

    pipelines.close().await;
}

// --- Ordered output under shuffled completion times -----------------------

struct JitterSm;

#[async_trait]
impl StateMachine for JitterSm {
    type Data = u64;

    async fn start(&self, mut req: Request<u64>) -> Request<u64> {
        let delay = rand::rng().random_range(0..5);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        req.finish();
        req
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ordered_with_random_stage_latency() {
    let pipelines = Pipelines::new("jitter", 8, JitterSm, Options::new().ordered())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    for i in 0..500 {
        group.submit(request(i)).await.unwrap();
    }
    group.close().await;

    let got = consumer.await.unwrap();
    assert_eq!(got.len(), 500);
    for (i, req) in got.iter().enumerate() {
        assert_eq!(
            req.data, i as u64,
            "completion jitter must not leak into ordered output",
        );
    }
    pipelines.close().await;
}

// --- Construction and submission pre-flight -------------------------------

#[tokio::test]
async fn constructor_rejects_bad_configuration() {
    use pipeline_core::ConfigError;

    let err = Pipelines::new("zero", 0, PassThrough, Options::new())
        .await
        .unwrap_err();
    assert_eq!(err, ConfigError::Parallelism);

    let err = Pipelines::new(
        "warn",
        1,
        PassThrough,
        Options::new().delay_warning(Duration::ZERO),
    )
    .await
    .unwrap_err();
    assert_eq!(err, ConfigError::ZeroDelayWarning);
}

#[tokio::test]
async fn submit_after_runtime_close_is_rejected() {
    let pipelines = Pipelines::new("closed", 1, PassThrough, Options::new())
        .await
        .unwrap();
    let mut group = pipelines.new_request_group();
    let consumer = drain(group.out.take().unwrap());
    pipelines.close().await;

    let err = group.submit(request(1)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Closed));

    group.close().await;
    consumer.await.unwrap();
}

#[tokio::test]
async fn delay_warning_pipeline_still_delivers() {
    let pipelines = Pipelines::new(
        "slowpoke",
        1,
        PassThrough,
        Options::new().delay_warning(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    let mut group = pipelines.new_request_group();
    let out = group.out.take().unwrap();

    for i in 0..4 {
        group.submit(request(i)).await.unwrap();
    }
    // Let the warning threshold trip at least once before draining.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let consumer = drain(out);
    group.close().await;
    assert_eq!(consumer.await.unwrap().len(), 4);
    pipelines.close().await;
}
