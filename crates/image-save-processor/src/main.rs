// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use image_save::{
    config::{Config, Role},
    consumer::Consumer,
    fetcher::HttpFetcher,
    http_utils::build_client,
    log_shipper::LogShipperLayer,
    logger,
    queue::amqp::AmqpConnector,
    retry::connect_with_backoff,
    trace::{reporter::CollectorReporter, Tracer},
};

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() {
    let config = match Config::from_env(Role::Processor) {
        Ok(c) => c,
        Err(e) => {
            let _ = logger::init("info", None);
            error!("Error creating config on image-save processor startup: {e}");
            return;
        }
    };

    let client = match build_client(config.proxy_url.as_deref(), HTTP_CLIENT_TIMEOUT) {
        Ok(client) => client,
        Err(e) => {
            let _ = logger::init(&config.env_filter(), None);
            error!("Error creating http client: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let shipper = config.log_shipper_config().map(|shipper_config| {
        let (layer, flusher) = LogShipperLayer::new(shipper_config, client.clone());
        background.push(tokio::spawn(flusher.start(cancel.clone())));
        layer
    });
    if let Err(e) = logger::init(&config.env_filter(), shipper) {
        eprintln!("Error initializing logging: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let tracer = if config.tracing_enabled {
        let (reporter, flusher) =
            CollectorReporter::new(config.collector_config(), client.clone());
        background.push(tokio::spawn(flusher.start(cancel.clone())));
        Tracer::new(config.tracer_config(), Arc::new(reporter))
    } else {
        info!("Tracing disabled");
        Tracer::disabled()
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
    });

    run(&config, client, tracer, cancel.clone()).await;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
}

async fn run(
    config: &Config,
    client: reqwest::Client,
    tracer: Tracer,
    cancel: CancellationToken,
) {
    let connector = AmqpConnector::new(&config.amqp_url);
    let queue = tokio::select! {
        () = cancel.cancelled() => return,
        queue = connect_with_backoff(&connector, config.retry_policy()) => match queue {
            Ok(queue) => queue,
            Err(e) => {
                error!("Unable to reach the queue broker, shutting down: {e}");
                return;
            }
        },
    };

    let consumer = Consumer::new(
        config.consumer_config(),
        queue,
        Arc::new(HttpFetcher::new(client, config.download_dir.clone())),
        Arc::new(tracer),
    );
    let subscription = match consumer.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Unable to subscribe to {}: {e}", config.queue);
            return;
        }
    };

    info!(
        "Processor consuming {} into {}",
        config.queue,
        config.download_dir.display()
    );
    let handled = consumer.run(subscription, cancel).await;
    info!("Processor stopped after {handled} tasks");
}
