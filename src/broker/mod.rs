//! Conversation broker: one state machine for direct and group chats
//!
//! Direct chats run the interactive flow (search, numbered list, selection);
//! groups run the single-shot flow where the best match is delivered at once.
//! Both share admission, the acquisition pipeline and the error boundary.


use crate::acquire::{AcquireError, AcquiredArtifact, Acquirer};
use crate::bundle::{self, ExtractedBundle};
use crate::catalog::{resolve_query, AppDetails, CatalogError, CatalogProvider, SearchResult};
use crate::config::{
    get_session_idle_ttl, get_session_max_capacity, Settings, LABEL_PREVIEW_CHARS,
    SEARCH_RESULT_LIMIT,
};
use crate::delivery::{busy_text, notices, selection_reprompt, usage_text, DeliveryCoordinator};
use crate::gateway::{
    AssetFetcher, Channel, ConversationId, InboundMessage, MessagingGateway, Reaction,
    TransportError,
};
use crate::guard::{AbuseGuard, BlockReason, Decision, RateLimits};
use crate::session::{
    ConversationKey, ConversationSession, SessionHandle, SessionState, SessionStore,
};
use crate::storage::{DownloadRecord, Store};
use crate::utils::{format_mib, truncate_str};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tracing::{debug, error, info, instrument, warn};

/// Failures that end one message's handling
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Catalog search or lookup failed
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(#[from] CatalogError),
    /// Both acquisition tiers failed
    #[error("acquisition failed: {0}")]
    AcquisitionFailed(#[from] AcquireError),
    /// Bundle splitting could not run at all
    #[error("bundle parse failed: {0}")]
    BundleParseFailed(String),
    /// A file transfer failed
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}

/// Conversation shape, chosen by channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Search, pick from a numbered list, then deliver
    Interactive,
    /// Deliver the top match of every query
    SingleShot,
}

impl FlowMode {
    /// Flow used for a channel
    #[must_use]
    pub const fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Direct => Self::Interactive,
            Channel::Group => Self::SingleShot,
        }
    }

    /// Whether the user picks from a result list before acquisition
    #[must_use]
    pub const fn requires_selection(self) -> bool {
        matches!(self, Self::Interactive)
    }
}

/// Parsed reply at the selection prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// `0`: drop the results and search again
    Restart,
    /// 1-based index into the stored results
    Pick(usize),
    /// Outside `1..=N`, re-prompt
    Invalid,
    /// Nothing stored to pick from
    Expired,
}

/// Interpret `text` against a result list of `count` entries
#[must_use]
pub fn parse_selection(text: &str, count: usize) -> Selection {
    let index = match text.trim().parse::<i64>() {
        Ok(0) => return Selection::Restart,
        Ok(n) => usize::try_from(n).ok().filter(|i| (1..=count).contains(i)),
        Err(_) => None,
    };

    match index {
        Some(i) => Selection::Pick(i),
        None if count == 0 => Selection::Expired,
        None => Selection::Invalid,
    }
}

const fn block_notice(reason: BlockReason) -> Option<&'static str> {
    match reason {
        BlockReason::Blacklisted => Some(notices::BLACKLISTED),
        BlockReason::SpamEscalation => Some(notices::AUTO_BANNED),
        BlockReason::GroupsOnly => Some(notices::GROUPS_ONLY),
        BlockReason::Silenced => None,
    }
}

/// External collaborators of the broker
#[derive(Clone)]
pub struct Services {
    /// Outbound transport
    pub gateway: Arc<dyn MessagingGateway>,
    /// Image fetcher for icons and the welcome banner
    pub assets: Arc<dyn AssetFetcher>,
    /// Catalog provider
    pub catalog: Arc<dyn CatalogProvider>,
    /// Two-tier acquirer
    pub acquirer: Acquirer,
    /// Persistent store
    pub store: Arc<dyn Store>,
}

/// Behavioural knobs of the broker
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Reject direct chats
    pub groups_only: bool,
    /// Chat receiving new-user announcements
    pub owner_chat: Option<ConversationId>,
    /// Banner sent with the welcome text
    pub welcome_image_url: Option<String>,
    /// Words restarting the interactive flow
    pub greeting_keywords: HashSet<String>,
    /// Words answered with usage in groups
    pub help_keywords: HashSet<String>,
    /// Admission limits
    pub limits: RateLimits,
    /// Maximum number of results listed for a query
    pub search_limit: usize,
    /// Idle time after which a session is forgotten
    pub session_idle_ttl: Duration,
    /// Maximum number of live sessions
    pub session_capacity: u64,
}

impl BrokerOptions {
    /// Options from loaded settings and environment tunables
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            groups_only: settings.groups_only,
            owner_chat: settings.owner_chat_id.map(ConversationId),
            welcome_image_url: settings.welcome_image_url.clone(),
            greeting_keywords: settings.greeting_keywords(),
            help_keywords: settings.help_keywords(),
            limits: RateLimits::from_env(),
            search_limit: SEARCH_RESULT_LIMIT,
            session_idle_ttl: get_session_idle_ttl(),
            session_capacity: get_session_max_capacity(),
        }
    }
}

/// Conversation orchestration engine
///
/// Owns the session store and the abuse guard; every inbound message goes
/// through [`Broker::handle`].
pub struct Broker {
    sessions: SessionStore,
    guard: AbuseGuard,
    catalog: Arc<dyn CatalogProvider>,
    acquirer: Acquirer,
    store: Arc<dyn Store>,
    delivery: DeliveryCoordinator,
    greeting_keywords: HashSet<String>,
    help_keywords: HashSet<String>,
    search_limit: usize,
}

impl Broker {
    /// Wire a broker from its collaborators
    #[must_use]
    pub fn new(services: Services, options: BrokerOptions) -> Self {
        let guard = AbuseGuard::new(
            services.store.clone(),
            services.gateway.clone(),
            options.limits,
            options.groups_only,
        )
        .with_owner_chat(options.owner_chat);
        let delivery =
            DeliveryCoordinator::new(services.gateway, services.assets, options.welcome_image_url);

        Self {
            sessions: SessionStore::new(options.session_idle_ttl, options.session_capacity),
            guard,
            catalog: services.catalog,
            acquirer: services.acquirer,
            store: services.store,
            delivery,
            greeting_keywords: options.greeting_keywords,
            help_keywords: options.help_keywords,
            search_limit: options.search_limit.max(1),
        }
    }

    /// Handle one inbound text message.
    ///
    /// Never fails: errors are caught here, the session is made searchable
    /// again and at most one notice is sent.
    #[instrument(skip_all, fields(conversation = message.conversation.0, user_id = message.participant.0))]
    pub async fn handle(&self, message: InboundMessage) {
        if message.text.trim().is_empty() {
            return;
        }

        let key = ConversationKey::for_message(
            message.channel,
            message.conversation,
            message.participant,
        );
        let session = self.sessions.get_or_create(key).await;

        if let Err(e) = self.dispatch(&message, &session).await {
            self.recover(&message, &session, e).await;
        }
    }

    async fn dispatch(
        &self,
        message: &InboundMessage,
        session: &Arc<SessionHandle>,
    ) -> Result<(), PipelineError> {
        let mut state = session.state.lock().await;
        let conversation = message.conversation;

        match self.guard.admit(message, &mut state.rate).await {
            Decision::Admit => {}
            Decision::Throttle => {
                drop(state);
                debug!("Message throttled");
                self.delivery.notify(conversation, notices::SLOW_DOWN).await;
                return Ok(());
            }
            Decision::Block(reason) => {
                drop(state);
                info!(?reason, "Message blocked");
                if let Some(notice) = block_notice(reason) {
                    self.delivery.notify(conversation, notice).await;
                }
                return Ok(());
            }
        }

        if FlowMode::for_channel(message.channel).requires_selection() {
            self.interactive(message, session, state).await
        } else {
            self.single_shot(message, session, state).await
        }
    }

    fn is_keyword(keywords: &HashSet<String>, text: &str) -> bool {
        keywords.contains(&text.trim().to_lowercase())
    }

    async fn interactive(
        &self,
        message: &InboundMessage,
        session: &Arc<SessionHandle>,
        mut state: MutexGuard<'_, ConversationSession>,
    ) -> Result<(), PipelineError> {
        if state.state == SessionState::Idle || Self::is_keyword(&self.greeting_keywords, &message.text) {
            state.reset_to_search();
            drop(state);
            self.delivery.welcome(message.conversation).await;
            return Ok(());
        }

        let current = state.state;
        match current {
            SessionState::WaitingForSelection => self.select(message, session, state).await,
            SessionState::Idle | SessionState::WaitingForSearch => {
                self.list_results(message, state).await
            }
        }
    }

    async fn list_results(
        &self,
        message: &InboundMessage,
        mut state: MutexGuard<'_, ConversationSession>,
    ) -> Result<(), PipelineError> {
        let results = self.search(message, self.search_limit).await?;
        if results.is_empty() {
            drop(state);
            self.delivery
                .notify(message.conversation, notices::NO_MATCHES)
                .await;
            return Ok(());
        }

        debug!(count = results.len(), "Stored search results");
        state.present(results.clone());
        drop(state);
        self.delivery
            .search_results(message.conversation, &results)
            .await;
        Ok(())
    }

    async fn select(
        &self,
        message: &InboundMessage,
        session: &Arc<SessionHandle>,
        mut state: MutexGuard<'_, ConversationSession>,
    ) -> Result<(), PipelineError> {
        let conversation = message.conversation;
        if let Some(label) = session.in_flight.current() {
            drop(state);
            self.delivery
                .notify(conversation, busy_text(Some(&label)))
                .await;
            return Ok(());
        }

        let count = state.results.len();
        let picked = match parse_selection(&message.text, count) {
            Selection::Restart => {
                state.reset_to_search();
                drop(state);
                self.delivery.notify(conversation, notices::SEARCH_AGAIN).await;
                return Ok(());
            }
            Selection::Expired => {
                state.reset_to_search();
                drop(state);
                self.delivery
                    .notify(conversation, notices::RESULTS_EXPIRED)
                    .await;
                return Ok(());
            }
            Selection::Invalid => {
                drop(state);
                self.delivery
                    .notify(conversation, selection_reprompt(count))
                    .await;
                return Ok(());
            }
            Selection::Pick(index) => state.results.get(index - 1).cloned(),
        };

        let Some(picked) = picked.filter(|hit| !hit.catalog_id.is_empty()) else {
            drop(state);
            self.delivery.notify(conversation, notices::UNRESOLVED_ID).await;
            return Ok(());
        };

        let Some(in_flight) = session.in_flight.try_begin(picked.title.clone()) else {
            drop(state);
            self.delivery.notify(conversation, busy_text(None)).await;
            return Ok(());
        };
        let listing = state.listing();
        drop(state);

        info!(catalog_id = %picked.catalog_id, title = %picked.title, "Selection accepted");
        let outcome = self.pipeline(message, &picked).await;
        drop(in_flight);

        // A list presented while this selection ran stays selectable
        session.state.lock().await.finish_listing(listing);
        if let Err(e) = outcome {
            self.report(message, e).await;
        }
        Ok(())
    }

    async fn single_shot(
        &self,
        message: &InboundMessage,
        session: &Arc<SessionHandle>,
        mut state: MutexGuard<'_, ConversationSession>,
    ) -> Result<(), PipelineError> {
        let conversation = message.conversation;
        state.state = SessionState::WaitingForSearch;

        if Self::is_keyword(&self.help_keywords, &message.text)
            || Self::is_keyword(&self.greeting_keywords, &message.text)
        {
            drop(state);
            self.delivery.notify(conversation, usage_text()).await;
            return Ok(());
        }

        let label = truncate_str(message.text.trim(), LABEL_PREVIEW_CHARS);
        let Some(_in_flight) = session.in_flight.try_begin(label) else {
            drop(state);
            let running = session.in_flight.current();
            self.delivery
                .notify(conversation, busy_text(running.as_deref()))
                .await;
            return Ok(());
        };
        drop(state);

        let Some(top) = self.search(message, 1).await?.into_iter().next() else {
            self.delivery.notify(conversation, notices::NO_MATCHES).await;
            return Ok(());
        };
        if top.catalog_id.is_empty() {
            self.delivery.notify(conversation, notices::UNRESOLVED_ID).await;
            return Ok(());
        }

        self.pipeline(message, &top).await
    }

    async fn search(
        &self,
        message: &InboundMessage,
        limit: usize,
    ) -> Result<Vec<SearchResult>, PipelineError> {
        self.delivery
            .react(message.message_ref, Reaction::Searching)
            .await;
        Ok(resolve_query(self.catalog.as_ref(), &message.text, limit).await?)
    }

    /// Details, acquisition, logging and delivery for one resolved entry
    #[instrument(skip_all, fields(catalog_id = %picked.catalog_id))]
    async fn pipeline(
        &self,
        message: &InboundMessage,
        picked: &SearchResult,
    ) -> Result<(), PipelineError> {
        let conversation = message.conversation;
        self.delivery
            .react(message.message_ref, Reaction::Working)
            .await;

        let hit = self.catalog.get_by_id(&picked.catalog_id).await?;
        let details = AppDetails::from_hit(hit, &picked.catalog_id);
        self.delivery.details(conversation, &details).await;

        self.delivery
            .react(message.message_ref, Reaction::Downloading)
            .await;
        let artifact = self
            .acquirer
            .acquire(&details.catalog_id, &details.title)
            .await?;
        self.delivery
            .react(message.message_ref, Reaction::Done)
            .await;

        info!(
            file_name = %artifact.file_name,
            size = %format_mib(artifact.size),
            "Delivering artifact"
        );
        self.record_download(message, &details, &artifact).await;
        self.deliver(conversation, &details, artifact).await
    }

    async fn record_download(
        &self,
        message: &InboundMessage,
        details: &AppDetails,
        artifact: &AcquiredArtifact,
    ) {
        let record = DownloadRecord {
            user_id: message.participant.0,
            app_id: details.catalog_id.clone(),
            app_name: details.title.clone(),
            file_type: artifact.file_type(),
            file_size: artifact.size,
        };
        if let Err(e) = self.store.log_download(record).await {
            warn!(error = %e, "Failed to log download");
        }
    }

    async fn deliver(
        &self,
        conversation: ConversationId,
        details: &AppDetails,
        artifact: AcquiredArtifact,
    ) -> Result<(), PipelineError> {
        if !bundle::is_bundle(&artifact.file_name) {
            self.delivery.deliver_single(conversation, artifact).await?;
            return Ok(());
        }

        let artifact = Arc::new(artifact);
        let title = details.title.clone();
        let split = Self::split_off_thread(&artifact, move |bytes| bundle::split(bytes, &title)).await;
        let artifact = Arc::try_unwrap(artifact).unwrap_or_else(|shared| (*shared).clone());

        match split {
            Ok(extracted) if extracted.is_deliverable() => {
                debug!(auxiliary = extracted.auxiliary.len(), "Delivering split bundle");
                self.delivery
                    .deliver_split(conversation, extracted, &details.catalog_id)
                    .await?;
            }
            Ok(_) => {
                self.delivery
                    .deliver_raw_bundle(conversation, artifact)
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, "Bundle split failed, delivering raw archive");
                self.delivery
                    .deliver_unparsed_bundle(conversation, artifact)
                    .await?;
            }
        }
        Ok(())
    }

    /// Run `split` on the blocking pool; the artifact stays readable by the
    /// caller whether the split fails or panics
    async fn split_off_thread<F>(
        artifact: &Arc<AcquiredArtifact>,
        split: F,
    ) -> Result<ExtractedBundle, PipelineError>
    where
        F: FnOnce(&[u8]) -> Result<ExtractedBundle, bundle::BundleError> + Send + 'static,
    {
        let shared = Arc::clone(artifact);
        match tokio::task::spawn_blocking(move || split(&shared.bytes)).await {
            Ok(result) => result.map_err(|e| PipelineError::BundleParseFailed(e.to_string())),
            Err(e) => Err(PipelineError::BundleParseFailed(e.to_string())),
        }
    }

    async fn recover(&self, message: &InboundMessage, session: &SessionHandle, error: PipelineError) {
        session.state.lock().await.reset_to_search();
        self.report(message, error).await;
    }

    /// Log a failed run and send at most one notice for it
    async fn report(&self, message: &InboundMessage, error: PipelineError) {
        let conversation = message.conversation;

        match &error {
            PipelineError::TransportFailure(e) => {
                warn!(error = %e, "Delivery failed");
                return;
            }
            PipelineError::CatalogUnavailable(e) => {
                warn!(error = %e, "Catalog request failed");
                self.delivery
                    .notify(conversation, notices::CATALOG_UNAVAILABLE)
                    .await;
            }
            PipelineError::AcquisitionFailed(e) => {
                warn!(error = %e, "No artifact available");
                self.delivery
                    .notify(conversation, notices::ACQUISITION_FAILED)
                    .await;
            }
            PipelineError::BundleParseFailed(e) => {
                error!(error = %e, "Bundle handling failed");
                self.delivery
                    .notify(conversation, notices::GENERIC_FAILURE)
                    .await;
            }
        }
        self.delivery
            .react(message.message_ref, Reaction::Failed)
            .await;
    }
}
