//! The unit of work flowing through a pipeline.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::cycle::SeenStages;
use crate::error::PipelineError;
use crate::state_machine::StageId;

/// A request to be processed by a pipeline.
///
/// Requests are created by the caller, submitted through a request group,
/// mutated only by the stage currently holding them, and handed back on the
/// group's output stream. The runtime assigns the group and item identity
/// at submission; user code never sets those.
#[derive(Debug)]
pub struct Request<T> {
    /// Cancellation scope for this request. Checked by the executor before
    /// every stage.
    pub ctx: CancellationToken,

    /// The data being processed.
    pub data: T,

    /// Set when processing stopped early. Stages set this for
    /// unrecoverable failures; errors about the data itself belong on `T`.
    pub err: Option<PipelineError>,

    /// The stage to run next. Reset before every stage call, so a stage
    /// must either route somewhere or leave the pipeline. `None` exits.
    pub next: Option<StageId>,

    pub(crate) group: u64,
    pub(crate) item: u64,
    pub(crate) queued_at: Instant,
    pub(crate) ingested_at: Instant,
    pub(crate) span: Span,
    pub(crate) seen: Option<SeenStages>,
}

impl<T> Request<T> {
    /// Creates a request scoped to `ctx`.
    pub fn new(ctx: CancellationToken, data: T) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            data,
            err: None,
            next: None,
            group: 0,
            item: 0,
            queued_at: now,
            ingested_at: now,
            span: Span::none(),
            seen: None,
        }
    }

    /// Routes the request to `stage` after the current stage returns.
    pub fn route(&mut self, stage: StageId) {
        self.next = Some(stage);
    }

    /// Marks the current stage as terminal: the request leaves the
    /// pipeline when it returns.
    pub fn finish(&mut self) {
        self.next = None;
    }

    /// The id of the request group this request was submitted through.
    /// Zero before submission.
    pub fn group(&self) -> u64 {
        self.group
    }

    /// The submission sequence number within the group, starting at zero.
    pub fn item(&self) -> u64 {
        self.item
    }

    /// The telemetry span covering this request's processing. Stages can
    /// parent their own events on it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Records a telemetry event on the request span. A no-op when the
    /// span is disabled.
    pub fn event(&self, message: &str) {
        if self.span.is_disabled() {
            return;
        }
        tracing::debug!(parent: &self.span, message, "stage event");
    }
}
