// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock image host: serves a fixed set of paths and 404s everything else.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct MockImageServer {
    pub addr: SocketAddr,
    pub requested_paths: Arc<Mutex<Vec<String>>>,
}

impl MockImageServer {
    /// Start the server on a random port, serving `images` (path -> body)
    pub async fn start(images: &[(&str, &[u8])]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let images: Arc<HashMap<String, Vec<u8>>> = Arc::new(
            images
                .iter()
                .map(|(path, body)| ((*path).to_string(), body.to_vec()))
                .collect(),
        );
        let requested_paths = Arc::new(Mutex::new(Vec::new()));
        let paths_clone = requested_paths.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let io = TokioIo::new(stream);
                let images = images.clone();
                let paths = paths_clone.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let images = images.clone();
                        let paths = paths.clone();
                        async move {
                            let path = req.uri().path().to_string();
                            paths.lock().unwrap().push(path.clone());

                            let response = match images.get(&path) {
                                Some(body) => Response::builder()
                                    .status(StatusCode::OK)
                                    .header("Content-Type", "image/png")
                                    .body(Full::new(Bytes::from(body.clone()))),
                                None => Response::builder()
                                    .status(StatusCode::NOT_FOUND)
                                    .body(Full::new(Bytes::new())),
                            };
                            Ok::<_, hyper::http::Error>(response.unwrap())
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockImageServer {
            addr,
            requested_paths,
        }
    }

    /// Absolute URL for `path` on this server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    #[allow(dead_code)]
    pub fn requested_paths(&self) -> Vec<String> {
        self.requested_paths.lock().unwrap().clone()
    }
}
