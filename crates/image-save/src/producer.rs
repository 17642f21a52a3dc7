// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accepts "save this image" requests and turns them into queued tasks.
//!
//! Each submission opens a `request` span and a child `enqueue` span. The enqueue span's context
//! is embedded in the task message so the consumer can continue the trace.
//!
//! The caller's response does not depend on whether the task was queued unless the producer is
//! configured with [`ResponseMapping::ReportFailure`]; a publish failure is always visible in the
//! logs and on the enqueue span.

use std::{fmt, str::FromStr, sync::Arc};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    queue::{OutboundMessage, QueueConnector, QueueError, TaskQueue},
    task::{TaskMessage, TaskMessageError},
    trace::{
        propagation::style::{default_styles, TracePropagationStyle},
        Span, SpanContext, TraceContextCodec, Tracer,
    },
};

/// How a publish failure shows up in the caller's response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMapping {
    /// `200 Image <locator> saved`, queued or not.
    #[default]
    AlwaysOk,
    /// `503` when the task could not be queued.
    ReportFailure,
}

impl FromStr for ResponseMapping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always-ok" => Ok(ResponseMapping::AlwaysOk),
            "report-failure" => Ok(ResponseMapping::ReportFailure),
            other => Err(format!(
                "unknown response mapping {other:?}, expected always-ok or report-failure"
            )),
        }
    }
}

impl fmt::Display for ResponseMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMapping::AlwaysOk => write!(f, "always-ok"),
            ResponseMapping::ReportFailure => write!(f, "report-failure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct ProducerConfig {
    pub queue: String,
    /// Embed the enqueue span's context in each task.
    pub tracing_enabled: bool,
    pub response_mapping: ResponseMapping,
    pub propagation_styles: Vec<TracePropagationStyle>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            tracing_enabled: true,
            response_mapping: ResponseMapping::AlwaysOk,
            propagation_styles: default_styles(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRequest {
    pub method: String,
    pub path: String,
    pub resource_locator: String,
}

/// The task is in the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Queued {
    pub queue: String,
    /// A trace carrier was embedded.
    pub traced: bool,
}

#[derive(Error, Debug)]
pub enum PublishFailed {
    #[error(transparent)]
    Encode(#[from] TaskMessageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug)]
pub struct SubmitResponse {
    pub status: u16,
    pub body: String,
    pub outcome: Result<Queued, PublishFailed>,
}

pub struct Producer {
    config: ProducerConfig,
    connector: Arc<dyn QueueConnector>,
    tracer: Arc<Tracer>,
    codec: TraceContextCodec,
    /// Opened on first use, dropped after a failure so the next request reconnects.
    connection: Mutex<Option<Arc<dyn TaskQueue>>>,
}

impl Producer {
    #[must_use]
    pub fn new(
        config: ProducerConfig,
        connector: Arc<dyn QueueConnector>,
        tracer: Arc<Tracer>,
    ) -> Self {
        let codec = TraceContextCodec::new(&config.propagation_styles);
        Self {
            config,
            connector,
            tracer,
            codec,
            connection: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// The request span is finished once the response is built, before the receiver writes it.
    pub async fn submit(&self, request: &SubmitRequest) -> SubmitResponse {
        let mut span = self
            .tracer
            .span("request")
            .with_tag("span.kind", "producer")
            .with_tag("http.method", &request.method)
            .with_tag("http.url", &request.path)
            .start();

        let outcome = self
            .enqueue(&request.resource_locator, span.context())
            .await;
        let (status, body) = self.respond(&request.resource_locator, &outcome);

        span.set_tag("http.status_code", status);
        if status >= 500 {
            span.set_tag("error", true);
        }
        span.finish();

        SubmitResponse {
            status,
            body,
            outcome,
        }
    }

    /// Publishes one task. The enqueue span is a child of `parent` when one is given.
    pub async fn enqueue(
        &self,
        resource_locator: &str,
        parent: Option<&SpanContext>,
    ) -> Result<Queued, PublishFailed> {
        let mut builder = self
            .tracer
            .span("enqueue")
            .with_tag("span.kind", "producer")
            .with_tag("message_bus.destination", &self.config.queue)
            .with_tag("image.url", resource_locator);
        if let Some(parent) = parent {
            builder = builder.child_of(parent);
        }
        let mut span = builder.start();

        let result = self.publish(resource_locator, &span).await;
        match &result {
            Ok(queued) => {
                info!(
                    "Queued task for {resource_locator} on {} (traced: {})",
                    queued.queue, queued.traced
                );
            }
            Err(e) => {
                error!("Failed to queue task for {resource_locator}: {e}");
                span.log_error(e);
            }
        }
        span.finish();

        result
    }

    async fn publish(&self, resource_locator: &str, span: &Span) -> Result<Queued, PublishFailed> {
        let trace = if self.config.tracing_enabled {
            self.codec.inject_span(span)
        } else {
            None
        };
        let traced = trace.is_some();
        let payload = TaskMessage::new(resource_locator, trace).to_bytes()?;

        let queue = self.queue().await?;
        if let Err(e) = declare_and_publish(queue.as_ref(), &self.config.queue, payload).await {
            forget_connection(&mut *self.connection.lock().await, &queue);
            return Err(e.into());
        }

        Ok(Queued {
            queue: self.config.queue.clone(),
            traced,
        })
    }

    async fn queue(&self) -> Result<Arc<dyn TaskQueue>, QueueError> {
        let mut connection = self.connection.lock().await;
        if let Some(queue) = connection.as_ref() {
            return Ok(Arc::clone(queue));
        }

        let queue = self.connector.connect().await?;
        *connection = Some(Arc::clone(&queue));
        Ok(queue)
    }

    fn respond(
        &self,
        resource_locator: &str,
        outcome: &Result<Queued, PublishFailed>,
    ) -> (u16, String) {
        match (outcome, self.config.response_mapping) {
            (Err(_), ResponseMapping::ReportFailure) => (
                503,
                format!("Image {resource_locator} could not be queued"),
            ),
            _ => (200, format!("Image {resource_locator} saved")),
        }
    }
}

/// Clears `slot` only if it still holds `failed`; another request may already have cached a
/// fresh connection.
fn forget_connection(slot: &mut Option<Arc<dyn TaskQueue>>, failed: &Arc<dyn TaskQueue>) {
    if slot.as_ref().is_some_and(|cached| Arc::ptr_eq(cached, failed)) {
        debug!("Dropping queue connection after failure");
        *slot = None;
    }
}

async fn declare_and_publish(
    queue: &dyn TaskQueue,
    name: &str,
    payload: Vec<u8>,
) -> Result<(), QueueError> {
    queue.declare_durable(name).await?;
    queue.publish(name, OutboundMessage::json(payload)).await
}
