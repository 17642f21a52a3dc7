// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use image_save::{
    config::{Config, Role},
    http_utils::build_client,
    log_shipper::LogShipperLayer,
    logger,
    producer::Producer,
    queue::amqp::AmqpConnector,
    receiver::Receiver,
    trace::{reporter::CollectorReporter, Tracer},
};

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let config = match Config::from_env(Role::Receiver) {
        Ok(c) => c,
        Err(e) => {
            let _ = logger::init("info", None);
            error!("Error creating config on image-save receiver startup: {e}");
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
        let (reporter, flusher) = CollectorReporter::new(config.collector_config(), client);
        background.push(tokio::spawn(flusher.start(cancel.clone())));
        Tracer::new(config.tracer_config(), Arc::new(reporter))
    } else {
        info!("Tracing disabled");
        Tracer::disabled()
    };

    let producer = Arc::new(Producer::new(
        config.producer_config(),
        Arc::new(AmqpConnector::new(&config.amqp_url)),
        Arc::new(tracer),
    ));

    let listener = match TcpListener::bind(config.receiver_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.receiver_addr());
            return;
        }
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

    if let Err(e) = Receiver::new(producer).serve(listener, cancel.clone()).await {
        error!("Receiver stopped: {e}");
    }

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
}
