// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, named, at-least-once task queue.
//!
//! The producer and consumer only see these traits. [`amqp`] talks to a real broker;
//! [`memory`] is an in-process broker with the same delivery semantics.
//!
//! A [`Delivery`] is acknowledged by consuming it, so a delivery can be acked at most once.
//! Dropping it un-acked hands it back to the broker for redelivery.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::task::CONTENT_TYPE;

pub mod amqp;
pub mod memory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum QueueError {
    #[error("Failed to connect to queue broker: {0}")]
    Connection(String),
    #[error("Failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },
    #[error("Failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },
    #[error("Failed to subscribe to queue {queue}: {reason}")]
    Subscribe { queue: String, reason: String },
    #[error("Failed to acknowledge delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },
    #[error("Queue connection closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: String,
    /// Survives a broker restart.
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            content_type: CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl OutboundMessage {
    /// Persistent JSON message.
    #[must_use]
    pub fn json(payload: Vec<u8>) -> Self {
        Self {
            payload,
            options: PublishOptions::default(),
        }
    }
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;
}

pub struct Delivery {
    pub payload: Vec<u8>,
    /// The broker already handed this message out once.
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        payload: Vec<u8>,
        redelivered: bool,
        delivery_tag: u64,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            payload,
            redelivered,
            delivery_tag,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits until the prefetch window has room and a message is available. `None` once the
    /// subscription is closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Idempotent.
    async fn declare_durable(&self, queue: &str) -> Result<(), QueueError>;

    /// Returns once the broker has taken responsibility for the message.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), QueueError>;

    /// Manual acknowledgment, at most `prefetch` un-acked deliveries at a time.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, QueueError>;
}

#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_publish_options_are_persistent_json() {
        let message = OutboundMessage::json(b"{}".to_vec());
        assert_eq!(message.options.content_type, "application/json");
        assert!(message.options.persistent);
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::Publish {
            queue: "tasks".to_string(),
            reason: "channel closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to publish to queue tasks: channel closed"
        );
    }
}
