//! HTTP transport to the sync server
//!
//! The trait seam keeps the engines testable without a live server; the
//! SSE stream is parsed with `eventsource-stream` over the raw byte
//! stream.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;

use crate::error::{Error, Result};
use crate::protocol::{PushRequest, PushResponse, PullResponse, SnapshotResponse, SyncEvent};
use crate::util::is_http_url;

/// Per-request timeout for push/pull/snapshot. The SSE connection is
/// deliberately left without one.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the sync wire contract
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;
    async fn pull(&self, since: i64, limit: i64) -> Result<PullResponse>;
    async fn snapshot(&self) -> Result<SnapshotResponse>;
}

/// A live stream of server sync events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SyncEvent>> + Send>>;

/// Source of server-sent sync events
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<EventStream>;
}

/// reqwest-based transport against the server's `/sync` endpoints
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
}

impl HttpTransport {
    /// Creates a transport with an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim();
        if !is_http_url(base_url) {
            return Err(Error::InvalidInput(
                "sync base URL must include http:// or https://".to_string(),
            ));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        })
    }

    /// Returns the base URL this transport was configured with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), compact(&body));
        if status.is_client_error() {
            Err(Error::Protocol(message))
        } else {
            Err(Error::Transport(message))
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn pull(&self, since: i64, limit: i64) -> Result<PullResponse> {
        let response = self
            .client
            .get(format!("{}/sync/pull", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .query(&[("since", since), ("limit", limit)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn snapshot(&self) -> Result<SnapshotResponse> {
        let response = self
            .client
            .get(format!("{}/sync/snapshot", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl EventSource for HttpTransport {
    async fn connect(&self) -> Result<EventStream> {
        let response = self
            .client
            .get(format!("{}/sync/events", self.base_url))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let events = response.bytes_stream().eventsource().filter_map(|item| async {
            match item {
                Ok(event) => match event.event.as_str() {
                    "sync" => Some(
                        serde_json::from_str::<SyncEvent>(&event.data)
                            .map_err(|e| Error::Protocol(format!("bad sync event: {e}"))),
                    ),
                    "ping" => Some(Ok(SyncEvent::ping())),
                    // Comments and unknown event types are skipped.
                    _ => None,
                },
                Err(e) => Some(Err(Error::Transport(format!("SSE stream error: {e}")))),
            }
        });

        Ok(Box::pin(events))
    }
}

/// Truncate response bodies for error messages.
fn compact(value: &str) -> String {
    value.trim().chars().take(180).collect()
}
