use std::time::Duration;

use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use thiserror::Error;
use tracing::{info, warn};

use crate::common::parsers::{self, Server};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("source returned an html page")]
    HtmlBody,
}

/// Fetches subscription bodies and turns them into parsed servers. One
/// failing source never aborts the others.
pub struct SubscriptionFetcher {
    client: reqwest::Client,
}

impl SubscriptionFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        SubscriptionFetcher { client }
    }

    /// Fetches every source concurrently and returns the servers found, in
    /// source order. Per-source failures are logged and skipped.
    pub async fn fetch_servers(&self, urls: &[String]) -> Vec<Server> {
        let bodies: Vec<Option<Vec<Server>>> = stream::iter(urls.to_vec())
            .map(|url| -> BoxFuture<'_, Option<Vec<Server>>> {
                Box::pin(async move {
                    match self.fetch_source(&url).await {
                        Ok(servers) => {
                            info!(%url, count = servers.len(), "fetched subscription source");
                            Some(servers)
                        }
                        Err(err) => {
                            warn!(%url, %err, "skipping subscription source");
                            None
                        }
                    }
                })
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        bodies.into_iter().flatten().flatten().collect()
    }

    async fn fetch_source(&self, url: &str) -> Result<Vec<Server>, FetchError> {
        let body = match self.fetch_body(url).await {
            Ok(body) => body,
            // One retry on transient failures only.
            Err(err) if is_transient(&err) => self.fetch_body(url).await?,
            Err(err) => return Err(err),
        };

        if body.trim_start().starts_with('<') {
            return Err(FetchError::HtmlBody);
        }

        let decoded = parsers::decode_subscription_body(&body);
        Ok(parsers::parse_payload(&decoded))
    }

    async fn fetch_body(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(response.text().await?)
    }
}

impl Default for SubscriptionFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn is_transient(err: &FetchError) -> bool {
    match err {
        FetchError::Status(status) => status.is_server_error(),
        FetchError::Request(err) => err.is_timeout() || err.is_connect(),
        FetchError::HtmlBody => false,
    }
}
