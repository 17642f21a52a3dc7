// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace identity carried across the queue.
//!
//! A [`SpanContext`] is everything a remote process needs to resume a trace: the 128-bit trace
//! id, the id of the span that handed the work off, the sampling decision, and whatever
//! propagated tags and baggage travel with the trace.

use std::collections::HashMap;

/// Sampling decision for a trace.
///
/// Priority values follow the usual convention:
/// - `-1`: user reject
/// - `0`: auto reject
/// - `1`: auto keep
/// - `2`: user keep
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Sampling {
    pub priority: Option<i8>,
    /// How the decision was made (e.g. `1` for the constant sampler).
    pub mechanism: Option<u8>,
}

impl Sampling {
    /// A trace with no recorded priority is treated as kept.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.priority.map_or(true, |p| p > 0)
    }
}

/// Identity of a span, in the form that survives serialization into a carrier.
#[derive(Clone, Default, Debug, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct SpanContext {
    /// 128-bit trace identifier shared by every span of the trace.
    pub trace_id: u128,
    pub span_id: u64,
    pub sampling: Sampling,
    /// Where the trace was started, when the caller said so.
    pub origin: Option<String>,
    /// Trace-level tags propagated with the context (`_dd.p.*`).
    pub tags: HashMap<String, String>,
    /// User baggage, propagated verbatim.
    pub baggage: HashMap<String, String>,
    /// Contexts that were present in the carrier but belonged to a different trace.
    pub links: Vec<SpanContext>,
}

impl SpanContext {
    #[must_use]
    pub fn new(trace_id: u128, span_id: u64) -> Self {
        Self {
            trace_id,
            span_id,
            ..Default::default()
        }
    }

    /// Zero ids are reserved and never identify a real span.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.trace_id != 0 && self.span_id != 0
    }

    /// Returns `(high, low)` 64-bit halves of the trace id.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn trace_id_halves(&self) -> (u64, u64) {
        ((self.trace_id >> 64) as u64, self.trace_id as u64)
    }

    /// 32 lowercase hex characters, as used by W3C `traceparent`.
    #[must_use]
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    #[must_use]
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}
