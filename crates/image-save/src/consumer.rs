// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pulls tasks off the queue one at a time and downloads the requested image.
//!
//! Each delivery is handled in its own `amqp_request` span, which follows from the producer's
//! enqueue span when the task carries a trace carrier. Every delivery is disposed of exactly once
//! according to the configured [`AckPolicy`].

use std::{fmt, str::FromStr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    fetcher::{FetchError, ResourceFetcher, StoredResource},
    queue::{Delivery, OutboundMessage, QueueError, Subscription, TaskQueue},
    task::{TaskMessage, TaskMessageError},
    trace::{
        propagation::style::{default_styles, TracePropagationStyle},
        span::error_chain,
        Span, TraceContextCodec, Tracer,
    },
};

/// Un-acked deliveries a consumer holds at once.
pub const PREFETCH: u16 = 1;

const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// What happens to a delivery whose task failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack regardless of outcome. A failed task is dropped after one attempt.
    #[default]
    AlwaysAck,
    /// Copy failed tasks to `<queue>.dead-letter`, then ack.
    DeadLetterOnFailure,
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always-ack" => Ok(AckPolicy::AlwaysAck),
            "dead-letter" => Ok(AckPolicy::DeadLetterOnFailure),
            other => Err(format!(
                "unknown ack policy {other:?}, expected always-ack or dead-letter"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct ConsumerConfig {
    pub queue: String,
    pub ack_policy: AckPolicy,
    pub propagation_styles: Vec<TracePropagationStyle>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            ack_policy: AckPolicy::AlwaysAck,
            propagation_styles: default_styles(),
        }
    }
}

impl ConsumerConfig {
    #[must_use]
    pub fn dead_letter_queue(&self) -> String {
        format!("{}{DEAD_LETTER_SUFFIX}", self.queue)
    }
}

/// Lifecycle of a single delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Delivered,
    TraceExtracted,
    Fetching,
    Succeeded,
    Failed,
    /// The payload is not a task message.
    Rejected,
    Acknowledged,
    Finished,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Saved(StoredResource),
    FetchFailed(FetchError),
    Rejected(TaskMessageError),
}

impl TaskOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Saved(_))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Copied to the dead-letter queue, then acked.
    DeadLettered,
    AckFailed(QueueError),
}

#[derive(Debug)]
pub struct TaskReport {
    /// `None` when the payload could not be decoded.
    pub image_url: Option<String>,
    pub outcome: TaskOutcome,
    pub disposition: Disposition,
    pub states: Vec<TaskState>,
}

struct Lifecycle {
    delivery_tag: u64,
    states: Vec<TaskState>,
}

impl Lifecycle {
    fn new(delivery_tag: u64) -> Self {
        let mut lifecycle = Self {
            delivery_tag,
            states: Vec::new(),
        };
        lifecycle.enter(TaskState::Delivered);
        lifecycle
    }

    fn enter(&mut self, state: TaskState) {
        debug!("Task {}: {state}", self.delivery_tag);
        self.states.push(state);
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Consumer {
    config: ConsumerConfig,
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn ResourceFetcher>,
    tracer: Arc<Tracer>,
    codec: TraceContextCodec,
}

impl Consumer {
    #[must_use]
    pub fn new(
        config: ConsumerConfig,
        queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn ResourceFetcher>,
        tracer: Arc<Tracer>,
    ) -> Self {
        let codec = TraceContextCodec::new(&config.propagation_styles);
        Self {
            config,
            queue,
            fetcher,
            tracer,
            codec,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Declares the task queue (and the dead-letter queue when used) and subscribes to it with
    /// [`PREFETCH`].
    pub async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        self.queue.declare_durable(&self.config.queue).await?;
        if self.config.ack_policy == AckPolicy::DeadLetterOnFailure {
            self.queue
                .declare_durable(&self.config.dead_letter_queue())
                .await?;
        }
        self.queue.subscribe(&self.config.queue, PREFETCH).await
    }

    /// Handles deliveries one after another until `cancel` fires or the subscription ends.
    /// A task in progress is completed before returning. Returns the number of tasks handled.
    pub async fn run(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: CancellationToken,
    ) -> usize {
        let mut handled = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Consumer cancelled after {handled} tasks");
                    break;
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                    handled += 1;
                }
                Some(Err(e)) => {
                    error!("Subscription to {} failed: {e}", self.config.queue);
                    break;
                }
                None => {
                    info!("Subscription to {} closed", self.config.queue);
                    break;
                }
            }
        }
        handled
    }

    pub async fn handle(&self, delivery: Delivery) -> TaskReport {
        let mut lifecycle = Lifecycle::new(delivery.delivery_tag);

        let task = match TaskMessage::from_bytes(&delivery.payload) {
            Ok(task) => task,
            Err(e) => return self.reject(delivery, lifecycle, e).await,
        };

        let predecessor = self.codec.extract(task.trace.as_ref());
        lifecycle.enter(TaskState::TraceExtracted);

        let mut span = self
            .tracer
            .span("amqp_request")
            .follows_from(predecessor.as_ref())
            .with_tag("span.kind", "consumer")
            .with_tag("message_bus.destination", &self.config.queue)
            .with_tag("image.url", &task.image_url)
            .with_tag("amqp.redelivered", delivery.redelivered)
            .start();

        lifecycle.enter(TaskState::Fetching);
        let outcome = match self.fetcher.fetch(&task.image_url).await {
            Ok(stored) => {
                lifecycle.enter(TaskState::Succeeded);
                info!("Saved {} to {}", task.image_url, stored.path.display());
                span.log_fields([
                    ("event".to_string(), "file_saved".to_string()),
                    ("path".to_string(), stored.path.display().to_string()),
                    ("bytes".to_string(), stored.bytes.to_string()),
                ]);
                TaskOutcome::Saved(stored)
            }
            Err(e) => {
                lifecycle.enter(TaskState::Failed);
                error!(
                    error.object = ?e,
                    stack = ?error_chain(&e),
                    "Failed to save {}: {e}",
                    task.image_url
                );
                span.log_error(&e);
                TaskOutcome::FetchFailed(e)
            }
        };

        let disposition = self
            .dispose(delivery, &outcome, &mut span, &mut lifecycle)
            .await;
        self.finish(span, &mut lifecycle);

        TaskReport {
            image_url: Some(task.image_url),
            outcome,
            disposition,
            states: lifecycle.states,
        }
    }

    async fn reject(
        &self,
        delivery: Delivery,
        mut lifecycle: Lifecycle,
        e: TaskMessageError,
    ) -> TaskReport {
        lifecycle.enter(TaskState::Rejected);
        error!(
            error.object = ?e,
            stack = ?error_chain(&e),
            "Discarding undecodable task {}: {e}",
            delivery.delivery_tag
        );

        let mut span = self
            .tracer
            .span("amqp_request")
            .with_tag("span.kind", "consumer")
            .with_tag("message_bus.destination", &self.config.queue)
            .with_tag("amqp.redelivered", delivery.redelivered)
            .start();
        span.log_error(&e);

        let outcome = TaskOutcome::Rejected(e);
        let disposition = self
            .dispose(delivery, &outcome, &mut span, &mut lifecycle)
            .await;
        self.finish(span, &mut lifecycle);

        TaskReport {
            image_url: None,
            outcome,
            disposition,
            states: lifecycle.states,
        }
    }

    async fn dispose(
        &self,
        delivery: Delivery,
        outcome: &TaskOutcome,
        span: &mut Span,
        lifecycle: &mut Lifecycle,
    ) -> Disposition {
        let dead_lettered = if !outcome.is_success()
            && self.config.ack_policy == AckPolicy::DeadLetterOnFailure
        {
            self.dead_letter(&delivery.payload, span).await
        } else {
            false
        };

        let delivery_tag = delivery.delivery_tag;
        match delivery.ack().await {
            Ok(()) => {
                lifecycle.enter(TaskState::Acknowledged);
                if dead_lettered {
                    Disposition::DeadLettered
                } else {
                    Disposition::Acked
                }
            }
            Err(e) => {
                error!("Failed to acknowledge task {delivery_tag}: {e}");
                span.set_tag("amqp.ack_failed", true);
                Disposition::AckFailed(e)
            }
        }
    }

    /// True when the payload reached the dead-letter queue.
    async fn dead_letter(&self, payload: &[u8], span: &mut Span) -> bool {
        let dead_letter_queue = self.config.dead_letter_queue();
        match self
            .queue
            .publish(&dead_letter_queue, OutboundMessage::json(payload.to_vec()))
            .await
        {
            Ok(()) => {
                warn!("Moved failed task to {dead_letter_queue}");
                span.set_tag("amqp.dead_lettered", true);
                true
            }
            Err(e) => {
                error!("Failed to dead-letter task, dropping it: {e}");
                false
            }
        }
    }

    fn finish(&self, mut span: Span, lifecycle: &mut Lifecycle) {
        span.log_event("request_end");
        span.finish();
        lifecycle.enter(TaskState::Finished);
    }
}
