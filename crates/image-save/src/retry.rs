// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded exponential backoff for reaching the queue broker at startup.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::queue::{QueueConnector, QueueError, TaskQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): doubles each time, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Connects, retrying with backoff. Returns the last error once attempts are exhausted.
pub async fn connect_with_backoff(
    connector: &dyn QueueConnector,
    policy: RetryPolicy,
) -> Result<Arc<dyn TaskQueue>, QueueError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connector.connect().await {
            Ok(queue) => {
                if attempt > 1 {
                    info!("Connected to queue broker after {attempt} attempts");
                }
                return Ok(queue);
            }
            Err(e) if attempt >= max_attempts => {
                warn!("Giving up on queue broker after {attempt} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Queue broker not ready (attempt {attempt}/{max_attempts}): {e}, retrying in {} ms",
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);

        let result = connect_with_backoff(&broker, fast_policy(5)).await;

        assert!(result.is_ok());
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);

        let result = connect_with_backoff(&broker, fast_policy(3)).await;

        assert!(matches!(result, Err(QueueError::Connection(_))));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let broker = MemoryBroker::new();

        assert!(connect_with_backoff(&broker, fast_policy(0)).await.is_ok());
    }
}
