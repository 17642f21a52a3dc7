// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound HTTP for the producer process.

use std::{io, sync::Arc};

use hyper::{http, service::service_fn, Method, Request, Response, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    http_utils::{create_text_response, log_and_create_http_response, HttpResponse},
    producer::{Producer, SubmitRequest},
};

pub const SUBMIT_ENDPOINT_PATH: &str = "/";
pub const INFO_ENDPOINT_PATH: &str = "/info";
pub const IMAGE_URL_PARAM: &str = "imageUrl";

pub struct Receiver {
    producer: Arc<Producer>,
}

impl Receiver {
    #[must_use]
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }

    /// Serves requests on `listener` until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let producer = Arc::clone(&self.producer);
        let service = service_fn(move |req| {
            // called for each http request
            let producer = Arc::clone(&producer);
            async move { Receiver::endpoint_handler(&producer, req).await }
        });

        match listener.local_addr() {
            Ok(addr) => info!("Receiver listening on {addr}"),
            Err(e) => debug!("Receiver listening on an unknown address: {e}"),
        }
        Self::serve_tcp(listener, service, cancel).await
    }

    async fn serve_tcp<S>(
        listener: TcpListener,
        service: S,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        S: hyper::service::Service<
                Request<hyper::body::Incoming>,
                Response = HttpResponse,
            > + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                () = cancel.cancelled() => {
                    info!("Receiver shutting down");
                    joinset.shutdown().await;
                    return Ok(());
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    pub async fn endpoint_handler<B>(
        producer: &Producer,
        req: Request<B>,
    ) -> http::Result<HttpResponse> {
        let (parts, _) = req.into_parts();
        match (&parts.method, parts.uri.path()) {
            (&Method::GET, SUBMIT_ENDPOINT_PATH) => Self::submit_handler(producer, &parts).await,
            (_, SUBMIT_ENDPOINT_PATH) => log_and_create_http_response(
                &format!("Method {} not allowed", parts.method),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            (_, INFO_ENDPOINT_PATH) => Self::info_handler(producer),
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn submit_handler(
        producer: &Producer,
        req: &http::request::Parts,
    ) -> http::Result<HttpResponse> {
        let Some(resource_locator) = image_url_param(req.uri.query()) else {
            return log_and_create_http_response(
                &format!("Missing {IMAGE_URL_PARAM} query parameter"),
                StatusCode::BAD_REQUEST,
            );
        };

        let request = SubmitRequest {
            method: req.method.to_string(),
            path: req.uri.to_string(),
            resource_locator,
        };
        let response = producer.submit(&request).await;
        let status =
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        create_text_response(response.body, status)
    }

    fn info_handler(producer: &Producer) -> http::Result<HttpResponse> {
        let config = producer.config();
        let styles: Vec<String> = config
            .propagation_styles
            .iter()
            .map(ToString::to_string)
            .collect();
        let response_json = json!(
            {
                "endpoints": [
                    SUBMIT_ENDPOINT_PATH,
                    INFO_ENDPOINT_PATH
                ],
                "config": {
                    "queue": config.queue,
                    "tracing_enabled": config.tracing_enabled,
                    "response_mapping": config.response_mapping.to_string(),
                    "propagation_styles": styles
                }
            }
        );
        Response::builder()
            .status(200)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(response_json.to_string().into())
    }
}

/// First non-empty `imageUrl` value, percent-decoded.
fn image_url_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, value)| *key == IMAGE_URL_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use duplicate::duplicate_item;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        producer::ProducerConfig,
        queue::memory::MemoryBroker,
        task::TaskMessage,
        trace::{reporter::InMemoryReporter, Tracer, TracerConfig},
    };

    fn producer() -> (Producer, MemoryBroker) {
        let broker = MemoryBroker::new();
        let tracer = Tracer::new(
            TracerConfig::new("image-save.receiver"),
            Arc::new(InMemoryReporter::new()),
        );
        (
            Producer::new(
                ProducerConfig::default(),
                Arc::new(broker.clone()),
                Arc::new(tracer),
            ),
            broker,
        )
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[duplicate_item(
        test_name              query                                           expected;
        [test_param_plain]     [Some("imageUrl=http://example.com/a.png")]     [Some("http://example.com/a.png")];
        [test_param_encoded]   [Some("imageUrl=http%3A%2F%2Fexample.com%2Fa%20b.png")] [Some("http://example.com/a b.png")];
        [test_param_other]     [Some("x=1&imageUrl=u")]                        [Some("u")];
        [test_param_empty]     [Some("imageUrl=")]                             [None];
        [test_param_missing]   [Some("url=u")]                                 [None];
        [test_param_no_query]  [None]                                          [None];
    )]
    #[test]
    fn test_name() {
        assert_eq!(image_url_param(query).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_submit_returns_plain_text() {
        let (producer, broker) = producer();

        let response = Receiver::endpoint_handler(
            &producer,
            get("/?imageUrl=http%3A%2F%2Fexample.com%2Fa.png"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            "Image http://example.com/a.png saved"
        );
        let messages = broker.messages("tasks");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            TaskMessage::from_bytes(&messages[0].payload)
                .unwrap()
                .image_url,
            "http://example.com/a.png"
        );
    }

    #[tokio::test]
    async fn test_missing_image_url_is_bad_request() {
        let (producer, broker) = producer();

        let response = Receiver::endpoint_handler(&producer, get("/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_string(response).await,
            "{\"message\":\"Missing imageUrl query parameter\"}"
        );
        assert!(broker.messages("tasks").is_empty());
    }

    #[tokio::test]
    async fn test_info_endpoint() {
        let (producer, _broker) = producer();

        let response = Receiver::endpoint_handler(&producer, get("/info"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["endpoints"], json!(["/", "/info"]));
        assert_eq!(json["config"]["queue"], "tasks");
        assert_eq!(json["config"]["tracing_enabled"], true);
        assert_eq!(json["config"]["response_mapping"], "always-ok");
        assert_eq!(
            json["config"]["propagation_styles"],
            json!(["datadog", "tracecontext"])
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (producer, _broker) = producer();

        let response = Receiver::endpoint_handler(&producer, get("/favicon.ico"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_is_not_allowed() {
        let (producer, broker) = producer();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/?imageUrl=u")
            .body(())
            .unwrap();

        let response = Receiver::endpoint_handler(&producer, request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(broker.messages("tasks").is_empty());
    }
}
