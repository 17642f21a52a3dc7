// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spans and their finished, reportable form.

use std::{
    collections::BTreeMap,
    error::Error,
    fmt::Display,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::trace::{context::SpanContext, reporter::SpanReporter};

/// Tag set on a span whose work failed.
pub const ERROR_TAG: &str = "error";

/// `error` followed by each of its sources, one per line.
#[must_use]
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain.join("\ncaused by: ")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Synchronous nesting: the parent waits for the child.
    ChildOf,
    /// Causal but not nested: the predecessor may have finished long before.
    FollowsFrom,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpanReference {
    pub kind: ReferenceKind,
    pub context: SpanContext,
}

/// A reference as it is reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FinishedReference {
    pub kind: ReferenceKind,
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Unix time in microseconds.
    pub timestamp: u64,
    pub fields: BTreeMap<String, String>,
}

/// A span after `finish`, ready to be reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FinishedSpan {
    pub service: String,
    pub operation: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub references: Vec<FinishedReference>,
    /// Unix time in microseconds.
    pub start: u64,
    /// Microseconds.
    pub duration: u64,
    pub tags: BTreeMap<String, String>,
    pub logs: Vec<LogRecord>,
    pub error: bool,
}

impl FinishedSpan {
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// True when some log record has `event=<name>`.
    #[must_use]
    pub fn has_event(&self, name: &str) -> bool {
        self.logs
            .iter()
            .any(|log| log.fields.get("event").is_some_and(|event| event == name))
    }

    #[must_use]
    pub fn follows_from(&self) -> Option<&FinishedReference> {
        self.references
            .iter()
            .find(|r| r.kind == ReferenceKind::FollowsFrom)
    }
}

struct RecordingSpan {
    service: String,
    operation: String,
    context: SpanContext,
    references: Vec<SpanReference>,
    start: u64,
    started: Instant,
    tags: BTreeMap<String, String>,
    logs: Vec<LogRecord>,
    error: bool,
    reporter: Arc<dyn SpanReporter>,
}

impl RecordingSpan {
    fn into_finished(self) -> FinishedSpan {
        let duration = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        FinishedSpan {
            service: self.service,
            operation: self.operation,
            trace_id: self.context.trace_id_hex(),
            span_id: self.context.span_id_hex(),
            parent_id: self
                .references
                .first()
                .map(|r| r.context.span_id_hex()),
            references: self
                .references
                .iter()
                .map(|r| FinishedReference {
                    kind: r.kind,
                    trace_id: r.context.trace_id_hex(),
                    span_id: r.context.span_id_hex(),
                })
                .collect(),
            start: self.start,
            duration,
            tags: self.tags,
            logs: self.logs,
            error: self.error,
        }
    }
}

/// A unit of traced work.
///
/// A span is reported exactly once: either through [`Span::finish`] or, if it goes out of scope
/// unfinished, when it is dropped. Spans from a disabled tracer record nothing.
pub struct Span {
    inner: Option<RecordingSpan>,
}

impl Span {
    pub(crate) fn recording(
        service: String,
        operation: String,
        context: SpanContext,
        references: Vec<SpanReference>,
        tags: BTreeMap<String, String>,
        reporter: Arc<dyn SpanReporter>,
    ) -> Self {
        Self {
            inner: Some(RecordingSpan {
                service,
                operation,
                context,
                references,
                start: now_micros(),
                started: Instant::now(),
                tags,
                logs: Vec::new(),
                error: false,
                reporter,
            }),
        }
    }

    pub(crate) fn noop() -> Self {
        Self { inner: None }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.is_some()
    }

    /// `None` for a span that is not recording.
    #[must_use]
    pub fn context(&self) -> Option<&SpanContext> {
        self.inner.as_ref().map(|inner| &inner.context)
    }

    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.operation.as_str())
    }

    pub fn set_tag(&mut self, key: &str, value: impl Display) {
        if let Some(inner) = &mut self.inner {
            if key == ERROR_TAG {
                inner.error = value.to_string() == "true";
            }
            inner.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn log_fields<I, K, V>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if let Some(inner) = &mut self.inner {
            inner.logs.push(LogRecord {
                timestamp: now_micros(),
                fields: fields
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            });
        }
    }

    pub fn log_event(&mut self, event: &str) {
        self.log_fields([("event", event)]);
    }

    /// Marks the span errored and logs the error with its source chain as `stack`.
    pub fn log_error(&mut self, error: &(dyn Error + 'static)) {
        if !self.is_recording() {
            return;
        }

        self.set_tag(ERROR_TAG, true);
        self.log_fields([
            ("event".to_string(), "error".to_string()),
            ("message".to_string(), error.to_string()),
            ("error.object".to_string(), format!("{error:?}")),
            ("stack".to_string(), error_chain(error)),
        ]);
    }

    /// Baggage travels with the context to every descendant, local or remote.
    pub fn set_baggage_item(&mut self, key: &str, value: &str) {
        if let Some(inner) = &mut self.inner {
            inner
                .context
                .baggage
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(inner) = self.inner.take() {
            let sampled = inner.context.sampling.is_sampled();
            let reporter = Arc::clone(&inner.reporter);
            if sampled {
                reporter.report(inner.into_finished());
            }
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.end();
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
