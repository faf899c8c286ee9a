//! Thin adaptor over the ambient span capability.
//!
//! All pipeline telemetry funnels through here: a span per request group,
//! a child span per request, and lifecycle events on both. Everything is a
//! no-op when the subscriber is not recording, so an uninstrumented
//! process pays nothing beyond the disabled-span checks.

use std::time::Duration;

use tracing::{Level, Span};

use crate::error::PipelineError;

/// Span covering one request group's lifetime, created on its first
/// submission.
pub(crate) fn group_span(pipeline: &str, group: &str, id: u64) -> Span {
    let group = if group.is_empty() { "unnamed" } else { group };
    tracing::debug_span!("request_group", pipeline, group, id)
}

/// Child span covering one request, created at submission.
pub(crate) fn request_span(parent: &Span, item: u64) -> Span {
    if parent.is_disabled() {
        return Span::none();
    }
    tracing::debug_span!(parent: parent, "request", item)
}

pub(crate) fn group_started(span: &Span) {
    if span.is_disabled() {
        return;
    }
    tracing::event!(parent: span, Level::DEBUG, "first request submitted");
}

pub(crate) fn group_finished(span: &Span, elapsed: Option<Duration>) {
    if span.is_disabled() {
        return;
    }
    let elapsed_ns = elapsed.map(|d| d.as_nanos() as u64).unwrap_or(0);
    tracing::event!(parent: span, Level::DEBUG, elapsed_ns, "request group finished");
}

/// Emitted when a worker picks the request up.
pub(crate) fn processing_start(span: &Span, queue_wait: Duration) {
    if span.is_disabled() {
        return;
    }
    tracing::event!(
        parent: span,
        Level::DEBUG,
        queue_wait_ns = queue_wait.as_nanos() as u64,
        "processing start",
    );
}

/// Emitted when the request reaches its group's forwarder.
pub(crate) fn processing_end(span: &Span, elapsed: Duration, err: Option<&PipelineError>) {
    if span.is_disabled() {
        return;
    }
    match err {
        Some(err) => tracing::event!(
            parent: span,
            Level::DEBUG,
            elapsed_ns = elapsed.as_nanos() as u64,
            error = %err,
            "processing end",
        ),
        None => tracing::event!(
            parent: span,
            Level::DEBUG,
            elapsed_ns = elapsed.as_nanos() as u64,
            "processing end",
        ),
    }
}
