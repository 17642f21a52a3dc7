// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a span into the flat map embedded in a task message, and back.
//!
//! Extraction never fails the caller: a missing, empty or malformed carrier degrades to "no
//! predecessor" and the consumer simply starts a new trace.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::trace::context::SpanContext;
use crate::trace::propagation::{
    style::{default_styles, TracePropagationStyle},
    CompositePropagator, Propagator,
};
use crate::trace::span::Span;

/// Flat string map carried in the `trace` field of a task message.
pub type TraceCarrier = HashMap<String, String>;

pub struct TraceContextCodec {
    propagator: CompositePropagator,
}

impl Default for TraceContextCodec {
    fn default() -> Self {
        Self::new(&default_styles())
    }
}

impl TraceContextCodec {
    #[must_use]
    pub fn new(styles: &[TracePropagationStyle]) -> Self {
        Self {
            propagator: CompositePropagator::new(styles, false, true),
        }
    }

    /// Writes every configured style. An invalid context produces an empty carrier.
    #[must_use]
    pub fn inject(&self, context: &SpanContext) -> TraceCarrier {
        let mut carrier = TraceCarrier::new();
        if let Err(e) = self.propagator.inject(context, &mut carrier) {
            warn!("{e}");
            carrier.clear();
        }
        carrier
    }

    /// `None` for a span that is not recording, or when nothing could be written.
    #[must_use]
    pub fn inject_span(&self, span: &Span) -> Option<TraceCarrier> {
        let carrier = self.inject(span.context()?);
        if carrier.is_empty() {
            None
        } else {
            Some(carrier)
        }
    }

    #[must_use]
    pub fn extract(&self, carrier: Option<&TraceCarrier>) -> Option<SpanContext> {
        let Some(carrier) = carrier else {
            debug!("No trace carrier, starting a new trace");
            return None;
        };
        if carrier.is_empty() {
            debug!("Empty trace carrier, starting a new trace");
            return None;
        }

        let context = self.propagator.extract(carrier);
        if context.is_none() {
            debug!("Unusable trace carrier, starting a new trace");
        }
        context
    }
}
