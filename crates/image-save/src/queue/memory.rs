// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process broker with AMQP-like delivery semantics.
//!
//! - FIFO per queue.
//! - At-least-once: a delivery dropped without `ack` goes back to the head of its queue and is
//!   marked redelivered.
//! - A subscriber never holds more than `prefetch` un-acked deliveries.
//!
//! The broker can be taken offline to simulate an unreachable server, and records the counters
//! tests need to check acknowledgment and prefetch behavior.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::queue::{
    Acker, Delivery, OutboundMessage, PublishOptions, QueueConnector, QueueError, Subscription,
    TaskQueue,
};

/// A message sitting in a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub options: PublishOptions,
    pub redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    offline: AtomicBool,
    shut_down: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    next_delivery_tag: AtomicU64,
    unacked: AtomicUsize,
    max_unacked: AtomicUsize,
    acked: AtomicUsize,
}

impl BrokerState {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), QueueError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }

    fn requeue_front(&self, queue: &str, message: QueuedMessage) {
        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();
        state.messages.push_front(message);
        state.notify.notify_one();
    }
}

/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offline brokers refuse connections, declares and publishes.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Ends every subscription; `next_delivery` returns `None` from now on.
    pub fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
        for state in self.state.queues().values() {
            state.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn acked(&self) -> usize {
        self.state.acked.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.state.unacked.load(Ordering::SeqCst)
    }

    /// Highest number of un-acked deliveries outstanding at any instant.
    #[must_use]
    pub fn max_unacked(&self) -> usize {
        self.state.max_unacked.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_declared(&self, queue: &str) -> bool {
        self.state.queues().contains_key(queue)
    }

    /// Messages waiting in `queue`, head first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state
            .queues()
            .get(queue)
            .map(|state| state.messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>, QueueError> {
        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(QueueError::Connection("connection refused".to_string()));
        }
        self.state.check_online()?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl TaskQueue for MemoryBroker {
    async fn declare_durable(&self, queue: &str) -> Result<(), QueueError> {
        self.state.check_online().map_err(|e| QueueError::Declare {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
        self.state.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
        self.state.check_online().map_err(|e| QueueError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        let mut queues = self.state.queues();
        let state = queues.get_mut(queue).ok_or_else(|| QueueError::Publish {
            queue: queue.to_string(),
            reason: "queue not declared".to_string(),
        })?;
        state.messages.push_back(QueuedMessage {
            payload: message.payload,
            options: message.options,
            redelivered: false,
        });
        state.notify.notify_one();
        debug!("Published message to {queue}");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, QueueError> {
        self.state.check_online().map_err(|e| QueueError::Subscribe {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        let notify = {
            let mut queues = self.state.queues();
            let state = queues.get_mut(queue).ok_or_else(|| QueueError::Subscribe {
                queue: queue.to_string(),
                reason: "queue not declared".to_string(),
            })?;
            Arc::clone(&state.notify)
        };

        // prefetch 0 means unbounded, as in AMQP
        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };

        Ok(Box::new(MemorySubscription {
            queue: queue.to_string(),
            state: Arc::clone(&self.state),
            notify,
            window: Arc::new(Semaphore::new(permits)),
        }))
    }
}

struct MemorySubscription {
    queue: String,
    state: Arc<BrokerState>,
    notify: Arc<Notify>,
    window: Arc<Semaphore>,
}

impl MemorySubscription {
    fn pop(&self) -> Option<QueuedMessage> {
        self.state
            .queues()
            .get_mut(&self.queue)
            .and_then(|state| state.messages.pop_front())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
        let permit = match Arc::clone(&self.window).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Some(Err(QueueError::Closed)),
        };

        loop {
            let notified = self.notify.notified();
            if self.state.shut_down.load(Ordering::SeqCst) {
                return None;
            }

            if let Some(message) = self.pop() {
                let delivery_tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let unacked = self.state.unacked.fetch_add(1, Ordering::SeqCst) + 1;
                self.state.max_unacked.fetch_max(unacked, Ordering::SeqCst);

                let payload = message.payload.clone();
                let redelivered = message.redelivered;
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    state: Arc::clone(&self.state),
                    message: Some(message),
                    _permit: permit,
                };
                return Some(Ok(Delivery::new(
                    payload,
                    redelivered,
                    delivery_tag,
                    Box::new(acker),
                )));
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    queue: String,
    state: Arc<BrokerState>,
    /// `None` once acknowledged.
    message: Option<QueuedMessage>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<(), QueueError> {
        if self.message.take().is_some() {
            self.state.unacked.fetch_sub(1, Ordering::SeqCst);
            self.state.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            debug!("Delivery dropped without ack, requeueing on {}", self.queue);
            self.state.unacked.fetch_sub(1, Ordering::SeqCst);
            message.redelivered = true;
            self.state.requeue_front(&self.queue, message);
        }
    }
}
