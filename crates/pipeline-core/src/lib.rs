//! # Pipeline Core
//!
//! A staged, concurrent, parallel pipeline runtime driven by a
//! user-supplied state machine. For a state machine with S stages and a
//! runtime with N parallel instances, N×S workers process requests
//! concurrently — every stage of every instance can be busy at once.
//!
//! Requests enter through a [`RequestGroup`] and come back out on that
//! group's output stream: many independent producers multiplex into one
//! shared runtime and each is demultiplexed its own results, optionally in
//! submission order.
//!
//! ## Sketch
//!
//! ```ignore
//! struct Doubler;
//!
//! #[async_trait]
//! impl StateMachine for Doubler {
//!     type Data = u64;
//!
//!     async fn start(&self, mut req: Request<u64>) -> Request<u64> {
//!         req.data *= 2;
//!         req.finish();
//!         req
//!     }
//! }
//!
//! let pipelines = Pipelines::new("double", 4, Doubler, Options::new()).await?;
//! let mut group = pipelines.new_request_group();
//! let mut out = group.out.take().unwrap();
//!
//! let consumer = tokio::spawn(async move {
//!     let mut results = Vec::new();
//!     while let Some(req) = out.recv().await {
//!         results.push(req.data);
//!     }
//!     results
//! });
//!
//! for i in 0..100 {
//!     group.submit(Request::new(CancellationToken::new(), i)).await?;
//! }
//! group.close().await;
//! let results = consumer.await?;
//! pipelines.close().await;
//! ```
//!
//! Stages beyond `start` are registered by name; a stage picks the next
//! one with [`Request::route`] and leaves the pipeline with
//! [`Request::finish`]. See [`Options`] for cycle detection, ordered
//! output, pre-processors, and delay warnings.
//!
//! The one hard rule: **drain the group's output until it closes**. The
//! runtime is backpressured end to end, so an abandoned output stream
//! eventually stalls `submit` — deliberately.

pub mod demux;
pub mod order;

mod cycle;
mod error;
mod options;
mod pipelines;
mod request;
mod state_machine;
mod stats;
mod telemetry;
mod worker;

pub mod test_utils;

pub use error::{ConfigError, PipelineError, StageError};
pub use options::{Options, PreProcessor};
pub use pipelines::{Pipelines, RequestGroup};
pub use request::Request;
pub use state_machine::{START, StageId, StageRegistry, StateMachine};
pub use stats::{IngestStats, Stats};

// The trait surface users implement against.
pub use async_trait::async_trait;
pub use futures::future::BoxFuture;
