// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships log events to a remote listener.
//!
//! [`LogShipperLayer`] turns each event into a [`LogRecord`] and hands it to a bounded channel
//! without blocking. [`LogShipperFlusher`] drains the channel and POSTs newline-delimited JSON
//! batches. Shipping failures are logged locally and never affect the process.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field::Field, Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

const LISTENER_PORT: u16 = 8071;

/// Events from these targets are not shipped: the shipper's own logs and the HTTP stack it
/// ships with.
const SKIPPED_TARGETS: [&str; 5] = [module_path!(), "reqwest", "hyper", "h2", "rustls"];

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct LogShipperConfig {
    /// `<listener>:8071/?token=<token>&type=<service>`
    pub endpoint: String,
    pub service: String,
    pub flush_interval: Duration,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
}

impl LogShipperConfig {
    #[must_use]
    pub fn new(listener_uri: &str, token: &str, service: &str) -> Self {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .append_pair("type", service)
            .finish();
        Self {
            endpoint: format!(
                "{}:{LISTENER_PORT}/?{query}",
                listener_uri.trim_end_matches('/')
            ),
            service: service.to_string(),
            flush_interval: Duration::from_secs(5),
            buffer_size: 4096,
            batch_size: 250,
            max_retries: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub level: String,
    pub target: String,
    pub service: String,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl tracing::field::Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

pub struct LogShipperLayer {
    service: String,
    tx: Sender<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl LogShipperLayer {
    /// The flusher must be started for records to leave the process.
    #[must_use]
    pub fn new(config: LogShipperConfig, client: reqwest::Client) -> (Self, LogShipperFlusher) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let layer = Self {
            service: config.service.clone(),
            tx,
            dropped: Arc::clone(&dropped),
        };
        let flusher = LogShipperFlusher {
            config,
            client,
            rx,
            pending: Vec::new(),
            dropped,
        };
        (layer, flusher)
    }
}

impl<S> Layer<S> for LogShipperLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if SKIPPED_TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
        {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            timestamp: now_millis(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            service: self.service.clone(),
            message: visitor.message,
            fields: visitor.fields,
        };

        // logging from inside a layer would recurse, so a full buffer is only counted
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct LogShipperFlusher {
    config: LogShipperConfig,
    client: reqwest::Client,
    rx: Receiver<LogRecord>,
    pending: Vec<LogRecord>,
    dropped: Arc<AtomicU64>,
}

impl LogShipperFlusher {
    /// Runs until cancelled or the layer is gone, then ships what is left.
    pub async fn start(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.flush().await,
                received = self.rx.recv() => match received {
                    Some(record) => {
                        self.pending.push(record);
                        if self.pending.len() >= self.config.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Some(record) = self.rx.recv().await {
            self.pending.push(record);
        }
        self.flush().await;
    }

    pub async fn flush(&mut self) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            error!("Log Shipper | Buffer full, dropped {dropped} log records");
        }

        let batch_size = self.config.batch_size.max(1);
        while !self.pending.is_empty() {
            let take = self.pending.len().min(batch_size);
            let batch: Vec<LogRecord> = self.pending.drain(..take).collect();
            self.send(&batch).await;
        }
    }

    async fn send(&self, batch: &[LogRecord]) {
        let body = match encode_batch(batch) {
            Ok(body) => body,
            Err(e) => {
                error!("Log Shipper | Failed to encode {} records: {e}", batch.len());
                return;
            }
        };
        let max_retries = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(&self.config.endpoint)
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(r) if r.status().is_success() => {
                    debug!("Log Shipper | Shipped {} records", batch.len());
                    return;
                }
                Ok(r) => {
                    error!(
                        "Log Shipper | Listener responded {} (attempt {attempts})",
                        r.status()
                    );
                }
                Err(e) => {
                    error!("Log Shipper | Network error (attempt {attempts}): {e:?}");
                }
            }

            if attempts >= max_retries {
                error!(
                    "Log Shipper | Dropping {} records after {attempts} attempts",
                    batch.len()
                );
                return;
            }

            let backoff_ms = 100 * (2_u64.pow(attempts - 1));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

/// One JSON object per line.
fn encode_batch(batch: &[LogRecord]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for record in batch {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
