//! Error types for the pipeline runtime.

use thiserror::Error;

/// A boxed error a stage attaches to a request.
///
/// This is for unrecoverable processing failures (a database that cannot be
/// reached, a malformed record that cannot continue). Errors that belong to
/// the *data* should live on the data type itself and flow through the
/// pipeline as ordinary values.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error carried on a request when its processing stops early, and the
/// error returned by submission pre-flight checks.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    /// A stage was entered twice while cycle detection was enabled. The
    /// trace lists the stages visited, in order.
    #[error("cyclic stage execution: {trace}")]
    Cyclic { trace: String },

    /// A stage routed to an identifier nothing was registered under.
    #[error("no stage registered under `{name}`")]
    UnknownStage { name: &'static str },

    /// A stage reported a processing failure.
    #[error("{message}")]
    Stage {
        message: String,
        #[source]
        source: Option<StageError>,
    },

    /// The runtime's input has been closed; no further submissions are
    /// accepted.
    #[error("pipeline input is closed")]
    Closed,
}

impl PipelineError {
    /// A stage failure described by a message alone.
    pub fn stage(message: impl Into<String>) -> Self {
        Self::Stage {
            message: message.into(),
            source: None,
        }
    }

    /// A stage failure wrapping an underlying error.
    pub fn stage_source(err: impl Into<StageError>) -> Self {
        let source = err.into();
        Self::Stage {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// True for errors produced by cycle detection. A cyclic error means a
    /// stage was visited more than once for a single request while the
    /// acyclic option was enabled.
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::Cyclic { .. })
    }
}

/// Errors returned by the runtime constructor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("parallelism must be at least 1")]
    Parallelism,

    #[error("state machine registered no stages")]
    NoStages,

    #[error("stage `{name}` registered twice")]
    DuplicateStage { name: &'static str },

    #[error("delay warning must be greater than zero")]
    ZeroDelayWarning,
}
