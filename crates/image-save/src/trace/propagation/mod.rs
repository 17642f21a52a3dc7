// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace context propagation across the task queue.
//!
//! The producer injects its `enqueue` span into a flat string map that rides inside the task
//! message; the consumer extracts it again and starts a span that follows from it.
//!
//! ```text
//! enqueue span ── inject ──▶ {"x-datadog-trace-id": .., "traceparent": .., ..}
//!                                   │  (task message `trace` field)
//!                                   ▼
//! amqp_request span ◀── follows_from ── extract
//! ```

use std::collections::HashMap;

use tracing::debug;

use crate::trace::context::SpanContext;
use carrier::{Extractor, Injector};
use style::TracePropagationStyle;
use text_map_propagator::{BAGGAGE_PREFIX, DATADOG_LAST_PARENT_ID_KEY, TRACESTATE_KEY};

pub mod carrier;
pub mod codec;
pub mod error;
pub mod style;
pub mod text_map_propagator;

/// Reads and writes one carrier format.
pub trait Propagator {
    /// Returns `None` when the carrier holds no usable context for this format.
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext>;

    fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), error::Error>;
}

/// Runs several propagators in a configured order.
///
/// Injection writes every configured format. Extraction either stops at the first format that
/// yields a context (`extract_first`) or reads all of them and resolves:
/// 1. the first context found is the primary one,
/// 2. later contexts with the same trace id contribute `tracestate` and the last parent id,
/// 3. later contexts with a different trace id are kept as `links`.
pub struct CompositePropagator {
    propagators: Vec<(TracePropagationStyle, Box<dyn Propagator + Send + Sync>)>,
    extract_first: bool,
    baggage_enabled: bool,
}

impl Propagator for CompositePropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        if self.extract_first {
            for (_, propagator) in &self.propagators {
                if let Some(mut context) = propagator.extract(carrier) {
                    if self.baggage_enabled {
                        Self::attach_baggage(&mut context, carrier);
                    }
                    return Some(context);
                }
            }
            return None;
        }

        let (contexts, styles) = self.extract_available_contexts(carrier);
        if contexts.is_empty() {
            return None;
        }

        let mut context = Self::resolve_contexts(contexts, &styles);
        if self.baggage_enabled {
            Self::attach_baggage(&mut context, carrier);
        }

        Some(context)
    }

    fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), error::Error> {
        for (_, propagator) in &self.propagators {
            propagator.inject(context, carrier)?;
        }

        if self.baggage_enabled && !self.propagators.is_empty() {
            for (key, value) in &context.baggage {
                carrier.set(&format!("{BAGGAGE_PREFIX}{key}"), value.clone());
            }
        }

        Ok(())
    }
}

impl CompositePropagator {
    /// `None` styles are skipped, so `[None]` gives a propagator that never reads or writes.
    #[must_use]
    pub fn new(styles: &[TracePropagationStyle], extract_first: bool, baggage_enabled: bool) -> Self {
        let mut propagators: Vec<(TracePropagationStyle, Box<dyn Propagator + Send + Sync>)> =
            Vec::new();
        for style in styles {
            if propagators.iter().any(|(s, _)| s == style) {
                continue;
            }
            match style {
                TracePropagationStyle::Datadog => propagators.push((
                    *style,
                    Box::new(text_map_propagator::DatadogHeaderPropagator),
                )),
                TracePropagationStyle::TraceContext => propagators.push((
                    *style,
                    Box::new(text_map_propagator::TraceContextPropagator),
                )),
                TracePropagationStyle::None => {}
            }
        }

        Self {
            propagators,
            extract_first,
            baggage_enabled,
        }
    }

    /// Styles in use, in extraction order.
    #[must_use]
    pub fn styles(&self) -> Vec<TracePropagationStyle> {
        self.propagators.iter().map(|(style, _)| *style).collect()
    }

    fn extract_available_contexts(
        &self,
        carrier: &dyn Extractor,
    ) -> (Vec<SpanContext>, Vec<TracePropagationStyle>) {
        let mut contexts = Vec::<SpanContext>::new();
        let mut styles = Vec::<TracePropagationStyle>::new();

        for (style, propagator) in &self.propagators {
            if let Some(context) = propagator.extract(carrier) {
                contexts.push(context);
                styles.push(*style);
            }
        }

        (contexts, styles)
    }

    fn resolve_contexts(
        mut contexts: Vec<SpanContext>,
        styles: &[TracePropagationStyle],
    ) -> SpanContext {
        let rest = contexts.split_off(1);
        let mut primary_context = contexts.remove(0);
        let datadog_span_id = styles
            .iter()
            .position(|s| *s == TracePropagationStyle::Datadog)
            .and_then(|position| match position {
                0 => Some(primary_context.span_id),
                i => rest.get(i - 1).map(|c| c.span_id),
            });

        for (context, style) in rest.into_iter().zip(styles.iter().skip(1)) {
            if context.is_valid() && context.trace_id != primary_context.trace_id {
                debug!(
                    "Keeping conflicting {style} context for trace {} as a link",
                    context.trace_id_hex()
                );
                primary_context.links.push(context);
            } else if *style == TracePropagationStyle::TraceContext {
                if let Some(tracestate) = context.tags.get(TRACESTATE_KEY) {
                    primary_context
                        .tags
                        .insert(TRACESTATE_KEY.to_string(), tracestate.clone());
                }

                if primary_context.trace_id == context.trace_id
                    && primary_context.span_id != context.span_id
                {
                    if let Some(parent_id) = context.tags.get(DATADOG_LAST_PARENT_ID_KEY) {
                        primary_context
                            .tags
                            .insert(DATADOG_LAST_PARENT_ID_KEY.to_string(), parent_id.clone());
                    } else if let Some(span_id) = datadog_span_id {
                        primary_context.tags.insert(
                            DATADOG_LAST_PARENT_ID_KEY.to_string(),
                            format!("{span_id:016x}"),
                        );
                    }

                    primary_context.span_id = context.span_id;
                }
            }
        }

        primary_context
    }

    /// Copies `ot-baggage-<key>` entries into the context's baggage.
    fn attach_baggage(context: &mut SpanContext, carrier: &dyn Extractor) {
        let baggage: HashMap<String, String> = carrier
            .keys()
            .into_iter()
            .filter_map(|key| {
                let stripped = key.strip_prefix(BAGGAGE_PREFIX)?;
                Some((
                    stripped.to_string(),
                    carrier.get(key).unwrap_or_default().to_string(),
                ))
            })
            .collect();
        context.baggage.extend(baggage);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use duplicate::duplicate_item;

    use super::*;
    use crate::trace::context::Sampling;

    const TRACE_ID: u128 = 0x80f1_98ee_5634_3ba8_64fe_8b2a_57d3_eff7;

    fn all_styles() -> Vec<TracePropagationStyle> {
        vec![
            TracePropagationStyle::Datadog,
            TracePropagationStyle::TraceContext,
        ]
    }

    fn datadog_headers() -> HashMap<String, String> {
        HashMap::from([
            (
                "x-datadog-trace-id".to_string(),
                "13088165645273925489".to_string(),
            ),
            ("x-datadog-parent-id".to_string(), "5678".to_string()),
            ("x-datadog-sampling-priority".to_string(), "1".to_string()),
            ("x-datadog-origin".to_string(), "synthetics".to_string()),
        ])
    }

    fn tracecontext_headers() -> HashMap<String, String> {
        HashMap::from([
            (
                "traceparent".to_string(),
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01".to_string(),
            ),
            (
                "tracestate".to_string(),
                "dd=s:2;o:rum;t.dm:-4,congo=t61rcWkgMz".to_string(),
            ),
        ])
    }

    fn all_headers() -> HashMap<String, String> {
        let mut headers = datadog_headers();
        headers.extend(tracecontext_headers());
        headers
    }

    #[test]
    fn test_new_skips_none_and_duplicates() {
        let propagator = CompositePropagator::new(
            &[
                TracePropagationStyle::None,
                TracePropagationStyle::Datadog,
                TracePropagationStyle::Datadog,
            ],
            false,
            true,
        );

        assert_eq!(propagator.styles(), vec![TracePropagationStyle::Datadog]);
    }

    #[duplicate_item(
        test_name                          styles;
        [test_none_style_extracts_nothing] [vec![TracePropagationStyle::None]];
        [test_no_style_extracts_nothing]   [vec![]];
    )]
    #[test]
    fn test_name() {
        let propagator = CompositePropagator::new(&styles, false, true);
        assert_eq!(propagator.extract(&all_headers()), None);
    }

    #[test]
    fn test_conflicting_trace_id_becomes_link() {
        let propagator = CompositePropagator::new(&all_styles(), false, true);

        let context = propagator.extract(&all_headers()).unwrap();

        assert_eq!(context.trace_id, 13_088_165_645_273_925_489);
        assert_eq!(context.span_id, 5678);
        assert_eq!(context.sampling.priority, Some(1));
        assert_eq!(context.origin, Some("synthetics".to_string()));
        assert_eq!(context.links.len(), 1);
        assert_eq!(context.links[0].trace_id, TRACE_ID);
        assert_eq!(
            context.links[0].tags.get(TRACESTATE_KEY).unwrap(),
            "dd=s:2;o:rum;t.dm:-4,congo=t61rcWkgMz"
        );
    }

    #[test]
    fn test_extract_first_ignores_later_styles() {
        let propagator = CompositePropagator::new(&all_styles(), true, true);

        let context = propagator.extract(&all_headers()).unwrap();

        assert_eq!(context.trace_id, 13_088_165_645_273_925_489);
        assert!(context.links.is_empty());
    }

    #[test]
    fn test_order_matters() {
        let propagator = CompositePropagator::new(
            &[
                TracePropagationStyle::TraceContext,
                TracePropagationStyle::Datadog,
            ],
            false,
            true,
        );

        let context = propagator.extract(&all_headers()).unwrap();

        assert_eq!(context.trace_id, TRACE_ID);
        assert_eq!(context.origin, Some("rum".to_string()));
        assert_eq!(context.links[0].trace_id, 13_088_165_645_273_925_489);
    }

    #[test]
    fn test_matching_trace_ids_merge_tracestate_and_parent() {
        let carrier = HashMap::from([
            (
                "x-datadog-trace-id".to_string(),
                "9291375655657946024".to_string(),
            ),
            ("x-datadog-parent-id".to_string(), "15".to_string()),
            (
                "traceparent".to_string(),
                "00-000000000000000080f198ee56343ba8-000000000000000a-01".to_string(),
            ),
        ]);
        let propagator = CompositePropagator::new(&all_styles(), false, true);

        let context = propagator.extract(&carrier).unwrap();

        assert_eq!(context.trace_id, 9_291_375_655_657_946_024);
        assert_eq!(context.span_id, 10);
        assert_eq!(
            context.tags.get(DATADOG_LAST_PARENT_ID_KEY).unwrap(),
            "000000000000000f"
        );
        assert!(context.links.is_empty());
    }

    #[test]
    fn test_attach_baggage() {
        let mut carrier = datadog_headers();
        carrier.insert("ot-baggage-user-id".to_string(), "12345".to_string());
        let propagator = CompositePropagator::new(&all_styles(), false, true);

        let context = propagator.extract(&carrier).unwrap();

        assert_eq!(context.baggage.get("user-id").unwrap(), "12345");
        assert!(!context.tags.contains_key("user-id"));
    }

    #[test]
    fn test_baggage_disabled() {
        let mut carrier = datadog_headers();
        carrier.insert("ot-baggage-user-id".to_string(), "12345".to_string());
        let propagator = CompositePropagator::new(&all_styles(), false, false);

        let context = propagator.extract(&carrier).unwrap();

        assert!(context.baggage.is_empty());
    }

    #[test]
    fn test_inject_writes_every_style_and_baggage() {
        let context = SpanContext {
            trace_id: TRACE_ID,
            span_id: 42,
            sampling: Sampling {
                priority: Some(1),
                mechanism: None,
            },
            baggage: HashMap::from([("tenant".to_string(), "acme".to_string())]),
            ..Default::default()
        };
        let propagator = CompositePropagator::new(&all_styles(), false, true);

        let mut carrier = HashMap::new();
        propagator.inject(&context, &mut carrier).unwrap();

        assert!(carrier.contains_key("x-datadog-trace-id"));
        assert!(carrier.contains_key("traceparent"));
        assert_eq!(carrier["ot-baggage-tenant"], "acme");

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id, TRACE_ID);
        assert_eq!(extracted.span_id, 42);
        assert_eq!(extracted.baggage, context.baggage);
        assert!(extracted.links.is_empty());
    }
}
