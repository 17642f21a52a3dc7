// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed tracing for the task hand-off.
//!
//! There is no process-wide tracer: the binaries build a [`tracer::Tracer`] and pass it to the
//! producer or consumer, which lets tests swap in an [`reporter::InMemoryReporter`].

pub mod context;
pub mod propagation;
pub mod reporter;
pub mod span;
pub mod tracer;

pub use context::{Sampling, SpanContext};
pub use propagation::codec::{TraceCarrier, TraceContextCodec};
pub use span::{FinishedSpan, ReferenceKind, Span};
pub use tracer::{Sampler, Tracer, TracerConfig};
