// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use image_save::{
    consumer::{AckPolicy, Consumer, ConsumerConfig, TaskReport},
    fetcher::{FetchError, HttpFetcher, ResourceFetcher, StoredResource},
    producer::{Producer, ProducerConfig, SubmitRequest},
    queue::{memory::MemoryBroker, QueueConnector, Subscription},
    trace::{reporter::InMemoryReporter, Tracer, TracerConfig},
};
use tempfile::TempDir;

pub const RECEIVER_SERVICE: &str = "image-save.receiver";
pub const PROCESSOR_SERVICE: &str = "image-save.processor";

/// A producer and a consumer sharing one in-memory broker, each with its own tracer.
pub struct Pipeline {
    pub broker: MemoryBroker,
    pub producer: Producer,
    pub consumer: Consumer,
    pub producer_spans: InMemoryReporter,
    pub consumer_spans: InMemoryReporter,
    pub download_dir: TempDir,
}

impl Pipeline {
    pub async fn new(producer_config: ProducerConfig, ack_policy: AckPolicy) -> Self {
        let download_dir = tempfile::tempdir().expect("Failed to create download dir");
        let fetcher = HttpFetcher::new(reqwest::Client::new(), download_dir.path());
        Self::with_fetcher(producer_config, ack_policy, Arc::new(fetcher), download_dir).await
    }

    pub async fn with_fetcher(
        producer_config: ProducerConfig,
        ack_policy: AckPolicy,
        fetcher: Arc<dyn ResourceFetcher>,
        download_dir: TempDir,
    ) -> Self {
        let broker = MemoryBroker::new();
        let producer_spans = InMemoryReporter::new();
        let consumer_spans = InMemoryReporter::new();

        let producer = Producer::new(
            producer_config.clone(),
            Arc::new(broker.clone()),
            Arc::new(Tracer::new(
                TracerConfig::new(RECEIVER_SERVICE),
                Arc::new(producer_spans.clone()),
            )),
        );
        let consumer = Consumer::new(
            ConsumerConfig {
                queue: producer_config.queue,
                ack_policy,
                propagation_styles: producer_config.propagation_styles,
            },
            broker.connect().await.expect("Failed to connect to broker"),
            fetcher,
            Arc::new(Tracer::new(
                TracerConfig::new(PROCESSOR_SERVICE),
                Arc::new(consumer_spans.clone()),
            )),
        );

        Pipeline {
            broker,
            producer,
            consumer,
            producer_spans,
            consumer_spans,
            download_dir,
        }
    }

    pub async fn subscribe(&self) -> Box<dyn Subscription> {
        self.consumer
            .subscribe()
            .await
            .expect("Failed to subscribe")
    }

    /// Pulls and handles exactly one delivery.
    pub async fn process_one(&self, subscription: &mut Box<dyn Subscription>) -> TaskReport {
        let delivery = tokio::time::timeout(Duration::from_secs(5), subscription.next_delivery())
            .await
            .expect("Timed out waiting for a delivery")
            .expect("Subscription closed")
            .expect("Delivery failed");
        self.consumer.handle(delivery).await
    }
}

pub fn submit_request(locator: &str) -> SubmitRequest {
    SubmitRequest {
        method: "GET".to_string(),
        path: format!("/?imageUrl={locator}"),
        resource_locator: locator.to_string(),
    }
}

/// Records how many fetches overlap.
#[derive(Default)]
pub struct SlowFetcher {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fetched: AtomicUsize,
}

#[async_trait]
impl ResourceFetcher for SlowFetcher {
    async fn fetch(&self, locator: &str) -> Result<StoredResource, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(StoredResource {
            path: locator.into(),
            bytes: 0,
        })
    }
}
