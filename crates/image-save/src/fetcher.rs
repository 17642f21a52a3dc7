// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downloads a remote resource into the local download directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

const FALLBACK_FILE_NAME: &str = "download";

#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum FetchError {
    #[error("Invalid resource locator {locator}: {source}")]
    InvalidLocator {
        locator: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Unsupported scheme {scheme} in {locator}")]
    UnsupportedScheme { locator: String, scheme: String },
    #[error("Fetching {locator} returned status {status}")]
    Status { locator: String, status: u16 },
    #[error("Fetching {locator} failed: {source}")]
    Transport {
        locator: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Writing {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResource {
    pub path: PathBuf,
    pub bytes: u64,
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<StoredResource, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
        }
    }

    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }
}

/// Last non-empty path segment, or `download` when the URL has none.
#[must_use]
pub fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .filter(|name| *name != "." && *name != "..")
        .map_or_else(|| FALLBACK_FILE_NAME.to_string(), str::to_string)
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<StoredResource, FetchError> {
        let url = Url::parse(locator).map_err(|source| FetchError::InvalidLocator {
            locator: locator.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme {
                locator: locator.to_string(),
                scheme: url.scheme().to_string(),
            });
        }

        let transport = |source| FetchError::Transport {
            locator: locator.to_string(),
            source,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        let path = self.download_dir.join(file_name_for(&url));
        tokio::fs::write(&path, &body)
            .await
            .map_err(|source| FetchError::Write {
                path: path.display().to_string(),
                source,
            })?;

        debug!("Saved {} bytes from {locator} to {}", body.len(), path.display());
        Ok(StoredResource {
            path,
            bytes: body.len() as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use duplicate::duplicate_item;

    use super::*;

    #[duplicate_item(
        test_name                   locator                                  expected;
        [test_name_last_segment]    ["http://example.com/images/a.png"]      ["a.png"];
        [test_name_trailing_slash]  ["http://example.com/images/"]           ["images"];
        [test_name_root]            ["http://example.com/"]                  ["download"];
        [test_name_query_ignored]   ["http://example.com/b.jpg?size=large"]  ["b.jpg"];
        [test_name_encoded]         ["http://example.com/my%20pic.gif"]      ["my%20pic.gif"];
    )]
    #[test]
    fn test_name() {
        assert_eq!(file_name_for(&Url::parse(locator).unwrap()), expected);
    }

    #[tokio::test]
    async fn test_fetch_saves_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a.png")
            .with_status(200)
            .with_body("png-bytes")
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(reqwest::Client::new(), dir.path());

        let stored = fetcher
            .fetch(&format!("{}/a.png", server.url()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(stored.path, dir.path().join("a.png"));
        assert_eq!(stored.bytes, 9);
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_fetch_not_found_writes_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.png")
            .with_status(404)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(reqwest::Client::new(), dir.path());

        let err = fetcher
            .fetch(&format!("{}/missing.png", server.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert!(!dir.path().join("missing.png").exists());
    }

    #[tokio::test]
    async fn test_fetch_invalid_locator() {
        let fetcher = HttpFetcher::new(reqwest::Client::new(), ".");

        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidLocator { .. }));

        let err = fetcher.fetch("ftp://example.com/a.png").await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme { .. }));
    }

    #[tokio::test]
    async fn test_fetch_unwritable_dir() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a.png")
            .with_status(200)
            .with_body("x")
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(reqwest::Client::new(), dir.path().join("missing-dir"));

        let err = fetcher
            .fetch(&format!("{}/a.png", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Write { .. }));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let fetcher = HttpFetcher::new(reqwest::Client::new(), ".");

        let err = fetcher
            .fetch("http://127.0.0.1:9/a.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
    }
}
