//! Transport-neutral messaging surface
//!
//! The broker talks to users only through [`MessagingGateway`] and pulls
//! remote images through [`AssetFetcher`], so the whole conversation flow can
//! be driven by in-memory fakes in tests.

use crate::config::ASSET_TIMEOUT_SECS;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Opaque conversation identifier
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ConversationId(pub i64);

/// Opaque sender identifier
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ParticipantId(pub i64);

/// Kind of conversation a message arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// One-to-one chat with the broker
    Direct,
    /// Shared group chat
    Group,
}

/// Reference to one inbound message, used for reactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    /// Conversation holding the message
    pub conversation: ConversationId,
    /// Transport-specific message id
    pub message_id: i32,
}

/// Text message received from a participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Conversation the message arrived in
    pub conversation: ConversationId,
    /// Sender
    pub participant: ParticipantId,
    /// Sender display name, empty when unknown
    pub participant_name: String,
    /// Direct or group
    pub channel: Channel,
    /// Message text
    pub text: String,
    /// Handle for reactions
    pub message_ref: MessageRef,
}

/// Document to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDocument {
    /// File content
    pub bytes: Vec<u8>,
    /// Filename shown to the recipient
    pub file_name: String,
    /// MIME type
    pub mime_type: String,
}

/// Progress markers attached to the triggering message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Query received, search running
    Searching,
    /// Selection accepted, details being fetched
    Working,
    /// Artifact download running
    Downloading,
    /// Delivery started
    Done,
    /// The request could not be served
    Failed,
}

/// Errors raised by the transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport rejected or failed the call
    #[error("transport call failed: {0}")]
    Api(String),
    /// The remote asset could not be fetched
    #[error("asset unavailable: {0}")]
    Asset(String),
}

/// Outbound side of the messaging transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send a text message, formatted as transport HTML
    async fn send_text(&self, conversation: ConversationId, text: String) -> Result<(), TransportError>;
    /// Send an image with a caption
    async fn send_image_with_caption(
        &self,
        conversation: ConversationId,
        image: Vec<u8>,
        caption: String,
    ) -> Result<(), TransportError>;
    /// Send a document
    async fn send_document(
        &self,
        conversation: ConversationId,
        document: OutboundDocument,
    ) -> Result<(), TransportError>;
    /// Attach a progress reaction to a message
    async fn send_reaction(&self, message: MessageRef, reaction: Reaction) -> Result<(), TransportError>;
    /// Block a participant at the transport level
    async fn block_participant(&self, participant: ParticipantId) -> Result<(), TransportError>;
}

/// Fetches remote images (icons, welcome banner)
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download the asset at `url`
    async fn fetch(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError>;
}

/// HTTP asset fetcher with an in-memory cache
///
/// Icons repeat across searches, so successful fetches are kept for an hour.
#[derive(Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl HttpAssetFetcher {
    /// Create a fetcher holding at most `max_capacity` assets
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(ASSET_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(_) => reqwest::Client::new(),
        };
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(3600))
            .build();
        Self { client, cache }
    }

    async fn download(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Asset(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Asset(format!("{url} returned {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Asset(e.to_string()))?;
        if bytes.is_empty() {
            return Err(TransportError::Asset(format!("{url} returned an empty body")));
        }
        Ok(Arc::new(bytes.to_vec()))
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError> {
        if let Some(hit) = self.cache.get(url).await {
            debug!(url = %url, "Asset cache hit");
            return Ok(hit);
        }

        let bytes = self.download(url).await?;
        self.cache.insert(url.to_string(), bytes.clone()).await;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_asset_fetch_is_cached() -> Result<(), TransportError> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/icon.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpAssetFetcher::new(16);
        let url = format!("{}/icon.png", server.uri());
        let first = fetcher.fetch(&url).await?;
        let second = fetcher.fetch(&url).await?;
        assert_eq!(first.len(), 4);
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[tokio::test]
    async fn test_asset_failures_are_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = HttpAssetFetcher::new(16);
        let url = format!("{}/missing.png", server.uri());
        assert!(fetcher.fetch(&url).await.is_err());
        assert!(fetcher.fetch(&url).await.is_err());
    }
}
