// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where finished spans go.
//!
//! [`CollectorReporter`] never blocks the span that is finishing: spans are pushed onto a bounded
//! channel and a [`CollectorFlusher`] task batches them to the trace collector.
//!
//! Each batch is one JSON POST of [`FinishedSpan`] records, so the collector endpoint has to
//! accept this schema (it is not Jaeger Thrift or OTLP):
//!
//! ```json
//! {"spans": [{"service": "image-save.processor", "operation": "amqp_request",
//!             "trace_id": "<32 hex>", "span_id": "<16 hex>",
//!             "references": [{"kind": "follows_from", "trace_id": "..", "span_id": ".."}],
//!             "start": 0, "duration": 0, "tags": {}, "logs": [], "error": false}]}
//! ```

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::trace::span::FinishedSpan;

pub trait SpanReporter: Send + Sync {
    /// Must not block.
    fn report(&self, span: FinishedSpan);
}

/// Keeps every reported span in memory.
#[derive(Clone, Default)]
pub struct InMemoryReporter {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl InMemoryReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First reported span with this operation name.
    #[must_use]
    pub fn find(&self, operation: &str) -> Option<FinishedSpan> {
        self.spans()
            .into_iter()
            .find(|span| span.operation == operation)
    }

    pub fn clear(&self) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl SpanReporter for InMemoryReporter {
    fn report(&self, span: FinishedSpan) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span);
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub endpoint: String,
    pub flush_interval: Duration,
    /// Spans buffered before new ones are dropped.
    pub buffer_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Also write every reported span to the process log at debug level.
    pub log_spans: bool,
}

impl CollectorConfig {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            flush_interval: Duration::from_secs(3),
            buffer_size: 1024,
            batch_size: 100,
            max_retries: 3,
            log_spans: true,
        }
    }
}

pub struct CollectorReporter {
    tx: Sender<FinishedSpan>,
    log_spans: bool,
}

impl CollectorReporter {
    /// The flusher must be started for spans to leave the process.
    #[must_use]
    pub fn new(config: CollectorConfig, client: reqwest::Client) -> (Self, CollectorFlusher) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let reporter = Self {
            tx,
            log_spans: config.log_spans,
        };
        let flusher = CollectorFlusher {
            config,
            client,
            rx,
            pending: Vec::new(),
        };
        (reporter, flusher)
    }
}

impl SpanReporter for CollectorReporter {
    fn report(&self, span: FinishedSpan) {
        if self.log_spans {
            debug!(
                "Reporting span {} {}:{} ({} us)",
                span.operation, span.trace_id, span.span_id, span.duration
            );
        }
        match self.tx.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(span)) => {
                warn!("Span buffer full, dropping span {}", span.operation);
            }
            Err(TrySendError::Closed(span)) => {
                warn!("Span flusher stopped, dropping span {}", span.operation);
            }
        }
    }
}

pub struct CollectorFlusher {
    config: CollectorConfig,
    client: reqwest::Client,
    rx: Receiver<FinishedSpan>,
    pending: Vec<FinishedSpan>,
}

impl CollectorFlusher {
    /// Flushes every interval, and whenever a full batch is waiting, until cancelled or every
    /// reporter is gone. Buffered spans are flushed before returning.
    pub async fn start(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.flush().await,
                received = self.rx.recv() => match received {
                    Some(span) => {
                        self.pending.push(span);
                        if self.pending.len() >= self.config.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Some(span) = self.rx.recv().await {
            self.pending.push(span);
        }
        self.flush().await;
    }

    /// Sends everything pending. A batch that still fails after retries is dropped.
    pub async fn flush(&mut self) {
        let batch_size = self.config.batch_size.max(1);
        while !self.pending.is_empty() {
            let take = self.pending.len().min(batch_size);
            let batch: Vec<FinishedSpan> = self.pending.drain(..take).collect();
            self.send(&batch).await;
        }
    }

    async fn send(&self, batch: &[FinishedSpan]) {
        let body = json!({ "spans": batch });
        let max_retries = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let time = std::time::Instant::now();
            let response = self
                .client
                .post(&self.config.endpoint)
                .json(&body)
                .send()
                .await;
            let elapsed = time.elapsed();

            match response {
                Ok(r) if r.status().is_success() => {
                    debug!(
                        "Trace Flusher | Sent {} spans in {} ms",
                        batch.len(),
                        elapsed.as_millis()
                    );
                    return;
                }
                Ok(r) => {
                    let status = r.status();
                    error!("Trace Flusher | Collector responded {status} (attempt {attempts})");
                }
                Err(e) => {
                    error!("Trace Flusher | Network error (attempt {attempts}): {e:?}");
                }
            }

            if attempts >= max_retries {
                error!(
                    "Trace Flusher | Dropping {} spans after {attempts} attempts",
                    batch.len()
                );
                return;
            }

            let backoff_ms = 100 * (2_u64.pow(attempts - 1));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}
