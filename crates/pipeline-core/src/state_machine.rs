//! State machines and stage registration.
//!
//! A pipeline executes a user-supplied state machine: a value with one
//! distinguished entry stage, any number of additional stages, and a close
//! hook. Stages are plain `Request -> Request` transitions; a stage decides
//! where the request goes next by setting its `next` selector.
//!
//! Stage identity is established by explicit registration under a stable
//! name. Function pointers are not a reliable identity source once generic
//! code is monomorphized, so the runtime never tries to derive names from
//! code addresses — the registered name is the identity, used for routing,
//! cycle detection, and telemetry alike.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::ConfigError;
use crate::request::Request;

/// The identifier of the distinguished entry stage. Stages route back here
/// with `req.route(START)` (which trips cycle detection when the acyclic
/// option is on).
pub const START: StageId = StageId::new("start");

/// A stable identifier for a stage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StageId(&'static str);

impl StageId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A state machine whose stages a pipeline drives.
///
/// `start` is the entry point for every request. Additional stages are
/// registered in [`stages`](Self::stages); the number of registered stages
/// (entry included) determines how many workers each pipeline instance
/// runs, so every stage of every in-flight request can make progress
/// concurrently.
///
/// Stages receive the request by value and return it, possibly with `err`
/// or `next` set. The executor owns each request exclusively between
/// stages, so a state machine only needs its own synchronization for state
/// *shared across requests*.
#[async_trait]
pub trait StateMachine: Send + Sync + Sized + 'static {
    /// The data type carried by every request of this pipeline.
    type Data: Send + 'static;

    /// The entry stage.
    async fn start(&self, req: Request<Self::Data>) -> Request<Self::Data>;

    /// Registers every stage other than the entry. The default registers
    /// nothing, which suits single-stage machines.
    fn stages(&self, reg: &mut StageRegistry<Self>) {
        let _ = reg;
    }

    /// Called exactly once when the runtime shuts down, after all requests
    /// have drained.
    async fn close(&self) {}
}

type BoxedStage<SM> = Box<
    dyn for<'a> Fn(
            &'a SM,
            Request<<SM as StateMachine>::Data>,
        ) -> BoxFuture<'a, Request<<SM as StateMachine>::Data>>
        + Send
        + Sync,
>;

/// Collects stage registrations from a state machine.
pub struct StageRegistry<SM: StateMachine> {
    entries: Vec<(StageId, BoxedStage<SM>)>,
}

impl<SM: StateMachine> StageRegistry<SM> {
    /// Registers `stage` under `id`.
    ///
    /// The stage is any function from a borrowed state machine and a
    /// request to a boxed future of the request — most naturally a method
    /// that boxes its body:
    ///
    /// ```ignore
    /// const VERIFY: StageId = StageId::new("verify");
    ///
    /// fn stages(&self, reg: &mut StageRegistry<Self>) {
    ///     reg.register(VERIFY, Self::verify);
    /// }
    ///
    /// fn verify(&self, mut req: Request<Record>) -> BoxFuture<'_, Request<Record>> {
    ///     Box::pin(async move {
    ///         // ... verify req.data ...
    ///         req.finish();
    ///         req
    ///     })
    /// }
    /// ```
    pub fn register<F>(&mut self, id: StageId, stage: F)
    where
        F: for<'a> Fn(&'a SM, Request<SM::Data>) -> BoxFuture<'a, Request<SM::Data>>
            + Send
            + Sync
            + 'static,
    {
        self.entries.push((id, Box::new(stage)));
    }
}

/// The immutable dispatch table built from a state machine's
/// registrations.
pub(crate) struct StageTable<SM: StateMachine> {
    entries: Vec<(StageId, BoxedStage<SM>)>,
}

/// The entry stage as a registrable function item.
fn entry_stage<SM: StateMachine>(
    sm: &SM,
    req: Request<SM::Data>,
) -> BoxFuture<'_, Request<SM::Data>> {
    sm.start(req)
}

impl<SM: StateMachine> std::fmt::Debug for StageTable<SM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTable")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<SM: StateMachine> StageTable<SM> {
    pub(crate) fn build(sm: &SM) -> Result<Self, ConfigError> {
        let mut reg = StageRegistry {
            entries: Vec::new(),
        };
        reg.register(START, entry_stage::<SM>);
        sm.stages(&mut reg);

        let entries = reg.entries;
        if entries.is_empty() {
            return Err(ConfigError::NoStages);
        }
        for (i, (id, _)) in entries.iter().enumerate() {
            if entries[..i].iter().any(|(other, _)| other == id) {
                return Err(ConfigError::DuplicateStage { name: id.name() });
            }
        }
        Ok(Self { entries })
    }

    /// Looks a stage up by id. Linear scan: stage counts are small and the
    /// table is hot enough that the scan beats hashing.
    pub(crate) fn get(&self, id: StageId) -> Option<&BoxedStage<SM>> {
        self.entries
            .iter()
            .find(|(other, _)| *other == id)
            .map(|(_, stage)| stage)
    }

    /// Number of registered stages, entry included.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
