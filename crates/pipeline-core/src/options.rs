//! Behavioral knobs for a pipeline runtime.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::request::Request;

/// A function run before every stage call. Pre-processors host work common
/// to all stages; a pre-processor that sets `err` stops the request.
pub type PreProcessor<T> = Arc<dyn Fn(Request<T>) -> Request<T> + Send + Sync>;

/// Options accepted by the runtime constructor.
///
/// ```ignore
/// let opts = Options::new().dag().delay_warning(Duration::from_secs(5));
/// let pipelines = Pipelines::new("etl", 8, sm, opts).await?;
/// ```
pub struct Options<T> {
    pub(crate) dag: bool,
    pub(crate) ordered: bool,
    pub(crate) delay_warning: Option<Duration>,
    pub(crate) sub_stages: usize,
    pub(crate) pre_processors: Vec<PreProcessor<T>>,
}

impl<T> Default for Options<T> {
    fn default() -> Self {
        Self {
            dag: false,
            ordered: false,
            delay_warning: None,
            sub_stages: 0,
            pre_processors: Vec::new(),
        }
    }
}

impl<T> Options<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats the state machine as a directed acyclic graph: a request
    /// that enters the same stage twice fails with a cyclic error
    /// (detectable via [`PipelineError::is_cyclic`]).
    ///
    /// [`PipelineError::is_cyclic`]: crate::PipelineError::is_cyclic
    pub fn dag(mut self) -> Self {
        self.dag = true;
        self
    }

    /// Releases each group's output in submission order. Finished requests
    /// are held until every earlier one has been released, so a slow
    /// request delays its successors.
    ///
    /// A submission that fails after being sequenced (cancelled while
    /// waiting for the input) leaves a permanent hole in the order, so an
    /// ordered producer that hits a submit error should stop the group.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Logs a warning whenever handing a finished request to the output
    /// takes longer than `threshold`. Useful for spotting which side of a
    /// chained pipeline is stuck. Zero is rejected at construction.
    pub fn delay_warning(mut self, threshold: Duration) -> Self {
        self.delay_warning = Some(threshold);
        self
    }

    /// Declares `count` additional stages living on auxiliary objects, so
    /// worker provisioning accounts for them. The stages themselves still
    /// register through the state machine's registration hook.
    pub fn sub_stages(mut self, count: usize) -> Self {
        self.sub_stages = count;
        self
    }

    /// Appends a pre-processor run before every stage call, after the
    /// built-in one that clears the `next` selector.
    pub fn pre_processor<F>(mut self, pp: F) -> Self
    where
        F: Fn(Request<T>) -> Request<T> + Send + Sync + 'static,
    {
        self.pre_processors.push(Arc::new(pp));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_warning == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroDelayWarning);
        }
        Ok(())
    }
}

/// Always installed first: clears the `next` selector so a stage that
/// forgets to route cannot silently repeat itself forever.
pub(crate) fn reset_next<T>() -> PreProcessor<T> {
    Arc::new(|mut req: Request<T>| {
        req.next = None;
        req
    })
}
