//! Testing helpers: recording fakes for the broker's collaborators.
//!
//! Unlike the mockall automocks, these fakes keep a transcript of every call
//! so scenario tests can assert on the whole conversation.

use crate::acquire::{AcquiredArtifact, ArtifactSource, SourceError};
use crate::catalog::{CatalogError, CatalogHit, CatalogProvider};
use crate::gateway::{
    AssetFetcher, ConversationId, MessageRef, MessagingGateway, OutboundDocument, ParticipantId,
    Reaction, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One outbound call observed by [`FakeGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// `send_text`
    Text(ConversationId, String),
    /// `send_image_with_caption` (image bytes omitted)
    Image(ConversationId, String),
    /// `send_document`
    Document(ConversationId, OutboundDocument),
    /// `send_reaction`
    Reaction(MessageRef, Reaction),
    /// `block_participant`
    Block(ParticipantId),
}

/// Gateway that records every call; succeeds unless built to reject uploads
#[derive(Default)]
pub struct FakeGateway {
    log: Mutex<Vec<Sent>>,
    reject_documents: bool,
}

impl FakeGateway {
    /// Gateway whose `send_document` always fails; nothing is recorded for it
    pub fn rejecting_documents() -> Self {
        Self {
            reject_documents: true,
            ..Self::default()
        }
    }

    /// Full transcript
    pub fn sent(&self) -> Vec<Sent> {
        self.log.lock().expect("gateway log poisoned").clone()
    }

    /// Texts and image captions, in order
    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(_, text) | Sent::Image(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Documents, in order
    pub fn documents(&self) -> Vec<OutboundDocument> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Document(_, doc) => Some(doc),
                _ => None,
            })
            .collect()
    }

    /// Reactions, in order
    pub fn reactions(&self) -> Vec<Reaction> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reaction(_, reaction) => Some(reaction),
                _ => None,
            })
            .collect()
    }

    /// Number of block calls
    pub fn blocks(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::Block(_)))
            .count()
    }

    /// Number of texts containing `needle`
    pub fn count_texts(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }

    fn push(&self, sent: Sent) {
        self.log.lock().expect("gateway log poisoned").push(sent);
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send_text(&self, conversation: ConversationId, text: String) -> Result<(), TransportError> {
        self.push(Sent::Text(conversation, text));
        Ok(())
    }

    async fn send_image_with_caption(
        &self,
        conversation: ConversationId,
        _image: Vec<u8>,
        caption: String,
    ) -> Result<(), TransportError> {
        self.push(Sent::Image(conversation, caption));
        Ok(())
    }

    async fn send_document(
        &self,
        conversation: ConversationId,
        document: OutboundDocument,
    ) -> Result<(), TransportError> {
        if self.reject_documents {
            return Err(TransportError::Api(format!("upload of {} rejected", document.file_name)));
        }
        self.push(Sent::Document(conversation, document));
        Ok(())
    }

    async fn send_reaction(&self, message: MessageRef, reaction: Reaction) -> Result<(), TransportError> {
        self.push(Sent::Reaction(message, reaction));
        Ok(())
    }

    async fn block_participant(&self, participant: ParticipantId) -> Result<(), TransportError> {
        self.push(Sent::Block(participant));
        Ok(())
    }
}

/// Artifact source returning a canned result
pub struct FakeSource {
    name: &'static str,
    result: Option<AcquiredArtifact>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl FakeSource {
    /// Source that always succeeds with `artifact`
    pub fn ok(name: &'static str, artifact: AcquiredArtifact) -> Self {
        Self {
            name,
            result: Some(artifact),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Source that always fails
    pub fn failing(name: &'static str) -> Self {
        Self {
            name,
            result: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Source that succeeds only after the returned gate is notified
    pub fn gated(name: &'static str, artifact: AcquiredArtifact) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let source = Self {
            gate: Some(gate.clone()),
            ..Self::ok(name, artifact)
        };
        (source, gate)
    }

    /// Number of fetches so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self, catalog_id: &str) -> Result<AcquiredArtifact, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result
            .clone()
            .ok_or_else(|| SourceError::Request(format!("{} unavailable for {catalog_id}", self.name)))
    }
}

/// Catalog with fixed search hits and lookup entries
#[derive(Default)]
pub struct FakeCatalog {
    hits: Vec<CatalogHit>,
    by_id: HashMap<String, CatalogHit>,
    unavailable: bool,
    searches: AtomicUsize,
    lookups: AtomicUsize,
}

impl FakeCatalog {
    /// Catalog answering every search with `hits`; each hit with an id is also found by lookup
    pub fn with_hits(hits: Vec<CatalogHit>) -> Self {
        let by_id = hits
            .iter()
            .filter_map(|hit| hit.resolved_id().map(|id| (id, hit.clone())))
            .collect();
        Self {
            hits,
            by_id,
            ..Self::default()
        }
    }

    /// Catalog failing every call
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Number of ranked searches so far
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    /// Number of exact lookups so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogProvider for FakeCatalog {
    async fn search_by_term(&self, _term: &str, limit: usize) -> Result<Vec<CatalogHit>, CatalogError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(CatalogError::Unavailable("fake outage".to_string()));
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<CatalogHit, CatalogError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(CatalogError::Unavailable("fake outage".to_string()));
        }
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }
}

/// Asset fetcher that fails every fetch, forcing text-only cards
pub struct NoAssets;

#[async_trait]
impl AssetFetcher for NoAssets {
    async fn fetch(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError> {
        Err(TransportError::Asset(format!("{url} not reachable in tests")))
    }
}

/// Catalog hit with the fields the broker relies on
pub fn hit(title: &str, app_id: &str) -> CatalogHit {
    CatalogHit {
        title: title.to_string(),
        app_id: (!app_id.is_empty()).then(|| app_id.to_string()),
        developer: Some(format!("{title} Inc.")),
        score: Some(4.5),
        ..CatalogHit::default()
    }
}
