// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Explicitly constructed tracer handed to the producer and consumer.

use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use crate::trace::{
    context::{Sampling, SpanContext},
    reporter::SpanReporter,
    span::{FinishedSpan, ReferenceKind, Span, SpanReference},
};

/// `_sampling_priority_v1` style mechanism for a fixed decision.
const SAMPLING_MECHANISM_CONST: u8 = 1;

/// Fixed sampling decision applied to new traces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sampler {
    #[default]
    AlwaysSample,
    NeverSample,
}

impl Sampler {
    fn sampling(self) -> Sampling {
        let priority = match self {
            Sampler::AlwaysSample => 1,
            Sampler::NeverSample => 0,
        };
        Sampling {
            priority: Some(priority),
            mechanism: Some(SAMPLING_MECHANISM_CONST),
        }
    }

    fn param(self) -> bool {
        self == Sampler::AlwaysSample
    }
}

#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct TracerConfig {
    pub service_name: String,
    /// A disabled tracer hands out spans that record nothing and inject no carrier.
    pub enabled: bool,
    pub sampler: Sampler,
    /// Added to every span this tracer starts.
    pub global_tags: BTreeMap<String, String>,
}

impl TracerConfig {
    #[must_use]
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            enabled: true,
            sampler: Sampler::AlwaysSample,
            global_tags: BTreeMap::new(),
        }
    }
}

struct DiscardReporter;

impl SpanReporter for DiscardReporter {
    fn report(&self, _span: FinishedSpan) {}
}

pub struct Tracer {
    config: TracerConfig,
    reporter: Arc<dyn SpanReporter>,
}

impl Tracer {
    #[must_use]
    pub fn new(config: TracerConfig, reporter: Arc<dyn SpanReporter>) -> Self {
        Self { config, reporter }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: TracerConfig {
                enabled: false,
                ..TracerConfig::new("disabled")
            },
            reporter: Arc::new(DiscardReporter),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn span(&self, operation: &str) -> SpanBuilder<'_> {
        SpanBuilder {
            tracer: self,
            operation: operation.to_string(),
            references: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

#[must_use = "a span is only created by `start`"]
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    operation: String,
    references: Vec<SpanReference>,
    tags: BTreeMap<String, String>,
}

impl SpanBuilder<'_> {
    pub fn child_of(self, parent: &SpanContext) -> Self {
        self.reference(ReferenceKind::ChildOf, Some(parent))
    }

    /// A `None` predecessor leaves the span as the root of a new trace.
    pub fn follows_from(self, predecessor: Option<&SpanContext>) -> Self {
        self.reference(ReferenceKind::FollowsFrom, predecessor)
    }

    pub fn with_tag(mut self, key: &str, value: impl Display) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    fn reference(mut self, kind: ReferenceKind, context: Option<&SpanContext>) -> Self {
        if let Some(context) = context.filter(|c| c.is_valid()) {
            self.references.push(SpanReference {
                kind,
                context: context.clone(),
            });
        }
        self
    }

    pub fn start(self) -> Span {
        let tracer = self.tracer;
        if !tracer.config.enabled {
            return Span::noop();
        }

        let span_id = fastrand::u64(1..);
        let mut tags = tracer.config.global_tags.clone();

        let context = match self.references.first() {
            Some(predecessor) => SpanContext {
                trace_id: predecessor.context.trace_id,
                span_id,
                sampling: match predecessor.context.sampling.priority {
                    Some(_) => predecessor.context.sampling,
                    None => tracer.config.sampler.sampling(),
                },
                origin: predecessor.context.origin.clone(),
                tags: predecessor.context.tags.clone(),
                baggage: predecessor.context.baggage.clone(),
                links: Vec::new(),
            },
            None => {
                tags.insert("sampler.type".to_string(), "const".to_string());
                tags.insert(
                    "sampler.param".to_string(),
                    tracer.config.sampler.param().to_string(),
                );
                SpanContext {
                    trace_id: fastrand::u128(1..),
                    span_id,
                    sampling: tracer.config.sampler.sampling(),
                    ..Default::default()
                }
            }
        };
        tags.extend(self.tags);

        Span::recording(
            tracer.config.service_name.clone(),
            self.operation,
            context,
            self.references,
            tags,
            Arc::clone(&tracer.reporter),
        )
    }
}
