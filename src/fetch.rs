//! Publisher transport.
//!
//! [`Fetcher`] is the capability the sync engine consumes: one method for
//! raw byte streams (snapshot and delta files) and one for the parsed
//! notification file. [`HttpFetcher`] is the production implementation on
//! top of [`reqwest`], with a hard per-request timeout and bounded retry.
//! Tests substitute their own `Fetcher` serving canned bytes.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::MirrorConfig;
use crate::notification::NotificationFile;
use crate::retry::{retry, RetryConfig};

/// A readable body as handed out by [`Fetcher::get`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Capability that produces publisher bytes for a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stream the body at `url`.
    async fn get(&self, url: &str) -> Result<ByteStream, FetchError>;

    /// Download and parse a notification file.
    async fn get_notification(&self, url: &str) -> Result<NotificationFile, FetchError>;
}

/// HTTPS fetcher with timeout and bounded retry.
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpFetcher {
    pub fn new(config: &MirrorConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            retry: RetryConfig::transfer_with_retries(config.fetch_retries),
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        retry("fetch", &self.retry, || async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| FetchError::Http {
                    url: url.to_string(),
                    source: e,
                })?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(resp)
        })
        .await
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<ByteStream, FetchError> {
        let resp = self.send(url).await?;
        debug!(url, length = ?resp.content_length(), "download started");
        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn get_notification(&self, url: &str) -> Result<NotificationFile, FetchError> {
        let resp = self.send(url).await?;
        let notification =
            resp.json::<NotificationFile>()
                .await
                .map_err(|e| FetchError::Json {
                    url: url.to_string(),
                    source: e,
                })?;
        debug!(
            source = %notification.source,
            version = notification.version,
            "notification downloaded"
        );
        Ok(notification)
    }
}
