//! Abuse guard: blacklist, burst throttling and groups-only topology
//!
//! Authoritative abuse state (spam score, blacklist) lives in the [`Store`];
//! the only process-local state is the set of identities already blocked for
//! writing to a groups-only deployment directly.

use crate::config::{get_burst_ceiling, get_quiet_interval, get_spam_score_threshold};
use crate::gateway::{Channel, ConversationId, InboundMessage, MessagingGateway, ParticipantId};
use crate::session::RateWindow;
use crate::storage::Store;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const GROUPS_ONLY_REASON: &str = "direct message to groups-only deployment";
const SPAM_REASON: &str = "automatic ban: repeated flooding";

/// Why a message was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Identity is on the persistent blacklist
    Blacklisted,
    /// Spam score crossed the threshold on this message
    SpamEscalation,
    /// First direct message to a groups-only deployment
    GroupsOnly,
    /// Identity was already blocked in this process; stay silent
    Silenced,
}

/// Outcome of the guard for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Process the message
    Admit,
    /// Too many messages in a burst; drop this one
    Throttle,
    /// Drop this and, depending on the reason, future messages
    Block(BlockReason),
}

/// Rate-limiting and escalation parameters
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Gap that resets the burst counter
    pub quiet_interval: Duration,
    /// Burst size tolerated before throttling
    pub burst_ceiling: u32,
    /// Spam score at which an identity is blacklisted
    pub spam_threshold: u32,
}

impl RateLimits {
    /// Limits from the environment, falling back to the built-in defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            quiet_interval: get_quiet_interval(),
            burst_ceiling: get_burst_ceiling(),
            spam_threshold: get_spam_score_threshold(),
        }
    }
}

/// Per-message admission control
pub struct AbuseGuard {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessagingGateway>,
    limits: RateLimits,
    groups_only: bool,
    owner_chat: Option<ConversationId>,
    blocked_direct: Mutex<HashSet<ParticipantId>>,
}

impl AbuseGuard {
    /// Create a guard
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessagingGateway>,
        limits: RateLimits,
        groups_only: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            limits,
            groups_only,
            owner_chat: None,
            blocked_direct: Mutex::new(HashSet::new()),
        }
    }

    /// Announce first-time users to this conversation
    #[must_use]
    pub fn with_owner_chat(mut self, owner_chat: Option<ConversationId>) -> Self {
        self.owner_chat = owner_chat;
        self
    }

    /// Decide whether `message` may be processed.
    ///
    /// `rate` is the session's window; the caller holds the session lock.
    /// Admitted messages refresh the user's activity record in the background.
    pub async fn admit(&self, message: &InboundMessage, rate: &mut RateWindow) -> Decision {
        if self.groups_only && message.channel == Channel::Direct {
            return Decision::Block(self.reject_direct(message.participant).await);
        }

        let identity = message.participant.0;
        match self.store.is_blacklisted(identity).await {
            Ok(true) => return Decision::Block(BlockReason::Blacklisted),
            Ok(false) => {}
            Err(e) => warn!(user_id = identity, error = %e, "Blacklist check failed, admitting"),
        }

        let limits = self.limits;
        if !rate.register(Instant::now(), limits.quiet_interval, limits.burst_ceiling) {
            return self.escalate(message).await;
        }

        let activity = self.activity_task(message);
        tokio::spawn(activity);
        Decision::Admit
    }

    async fn reject_direct(&self, participant: ParticipantId) -> BlockReason {
        if !self.blocked_direct.lock().await.insert(participant) {
            return BlockReason::Silenced;
        }

        info!(user_id = participant.0, "Blocking direct contact on groups-only deployment");
        if let Err(e) = self.gateway.block_participant(participant).await {
            warn!(user_id = participant.0, error = %e, "Transport block failed");
        }
        if let Err(e) = self
            .store
            .record_block_reason(participant.0, GROUPS_ONLY_REASON.to_string())
            .await
        {
            warn!(user_id = participant.0, error = %e, "Failed to persist block reason");
        }
        BlockReason::GroupsOnly
    }

    async fn escalate(&self, message: &InboundMessage) -> Decision {
        if message.channel != Channel::Direct {
            return Decision::Throttle;
        }

        let identity = message.participant.0;
        let score = match self.store.increment_spam_score(identity).await {
            Ok(score) => score,
            Err(e) => {
                warn!(user_id = identity, error = %e, "Spam score update failed");
                return Decision::Throttle;
            }
        };

        if score < self.limits.spam_threshold {
            return Decision::Throttle;
        }

        warn!(user_id = identity, score, "Spam threshold reached, blacklisting");
        if let Err(e) = self
            .store
            .add_to_blacklist(identity, SPAM_REASON.to_string())
            .await
        {
            warn!(user_id = identity, error = %e, "Failed to blacklist");
        }
        Decision::Block(BlockReason::SpamEscalation)
    }

    /// Background activity update, announcing first contact to the owner
    fn activity_task(&self, message: &InboundMessage) -> impl std::future::Future<Output = ()> + Send + 'static {
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let owner_chat = self.owner_chat;
        let identity = message.participant.0;
        let name = message.participant_name.clone();

        async move {
            match store.touch_user(identity, name.clone()).await {
                Ok(true) => {
                    info!(user_id = identity, "New user");
                    if let Some(owner) = owner_chat {
                        let notice = crate::delivery::new_user_announcement(&name, identity);
                        if let Err(e) = gateway.send_text(owner, notice).await {
                            warn!(error = %e, "Failed to announce new user");
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(user_id = identity, error = %e, "Failed to record activity"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MessageRef, MockMessagingGateway};
    use crate::storage::{MemoryStore, MockStore, StoreError};

    fn limits() -> RateLimits {
        RateLimits {
            quiet_interval: Duration::from_secs(60),
            burst_ceiling: 3,
            spam_threshold: 2,
        }
    }

    fn message(channel: Channel, participant: i64) -> InboundMessage {
        InboundMessage {
            conversation: ConversationId(participant),
            participant: ParticipantId(participant),
            participant_name: "Omar".to_string(),
            channel,
            text: "hello".to_string(),
            message_ref: MessageRef {
                conversation: ConversationId(participant),
                message_id: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_blacklisted_identity_is_blocked() -> Result<(), StoreError> {
        let store = Arc::new(MemoryStore::new());
        store.add_to_blacklist(7, "manual".to_string()).await?;
        let guard = AbuseGuard::new(store, Arc::new(MockMessagingGateway::new()), limits(), false);

        let mut rate = RateWindow::default();
        assert_eq!(
            guard.admit(&message(Channel::Direct, 7), &mut rate).await,
            Decision::Block(BlockReason::Blacklisted)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_direct_flood_escalates_to_blacklist() -> Result<(), StoreError> {
        let store = Arc::new(MemoryStore::new());
        let guard = AbuseGuard::new(store.clone(), Arc::new(MockMessagingGateway::new()), limits(), false);
        let msg = message(Channel::Direct, 11);
        let mut rate = RateWindow::default();

        for _ in 0..3 {
            assert_eq!(guard.admit(&msg, &mut rate).await, Decision::Admit);
        }
        assert_eq!(guard.admit(&msg, &mut rate).await, Decision::Throttle);
        assert_eq!(
            guard.admit(&msg, &mut rate).await,
            Decision::Block(BlockReason::SpamEscalation)
        );
        assert!(store.is_blacklisted(11).await?);

        // A fresh window does not help once blacklisted
        let mut fresh = RateWindow::default();
        assert_eq!(
            guard.admit(&msg, &mut fresh).await,
            Decision::Block(BlockReason::Blacklisted)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_group_flood_only_throttles() -> Result<(), StoreError> {
        let store = Arc::new(MemoryStore::new());
        let guard = AbuseGuard::new(store.clone(), Arc::new(MockMessagingGateway::new()), limits(), false);
        let msg = message(Channel::Group, 12);
        let mut rate = RateWindow::default();

        let decisions: Vec<Decision> = {
            let mut out = Vec::new();
            for _ in 0..8 {
                out.push(guard.admit(&msg, &mut rate).await);
            }
            out
        };
        assert!(decisions[3..].iter().all(|d| *d == Decision::Throttle));
        assert!(!store.is_blacklisted(12).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_groups_only_blocks_direct_once() {
        let store = Arc::new(MemoryStore::new());
        let mut gateway = MockMessagingGateway::new();
        gateway
            .expect_block_participant()
            .times(1)
            .returning(|_| Ok(()));
        let guard = AbuseGuard::new(store.clone(), Arc::new(gateway), limits(), true);
        let msg = message(Channel::Direct, 21);
        let mut rate = RateWindow::default();

        assert_eq!(
            guard.admit(&msg, &mut rate).await,
            Decision::Block(BlockReason::GroupsOnly)
        );
        assert_eq!(
            guard.admit(&msg, &mut rate).await,
            Decision::Block(BlockReason::Silenced)
        );
        assert_eq!(store.block_reason(21).await.as_deref(), Some(GROUPS_ONLY_REASON));

        // Group traffic is still served
        assert_eq!(
            guard.admit(&message(Channel::Group, 21), &mut RateWindow::default()).await,
            Decision::Admit
        );
    }

    #[tokio::test]
    async fn test_blacklist_lookup_failure_admits() {
        let mut store = MockStore::new();
        store
            .expect_is_blacklisted()
            .returning(|_| Err(StoreError::Config("down".to_string())));
        store.expect_touch_user().returning(|_, _| Ok(false));
        let guard = AbuseGuard::new(Arc::new(store), Arc::new(MockMessagingGateway::new()), limits(), false);

        let mut rate = RateWindow::default();
        assert_eq!(
            guard.admit(&message(Channel::Direct, 5), &mut rate).await,
            Decision::Admit
        );
    }

    #[tokio::test]
    async fn test_first_contact_is_announced_to_owner() {
        let store = Arc::new(MemoryStore::new());
        let mut gateway = MockMessagingGateway::new();
        gateway
            .expect_send_text()
            .withf(|chat, text| *chat == ConversationId(999) && text.contains("31"))
            .times(1)
            .returning(|_, _| Ok(()));
        let guard = AbuseGuard::new(store, Arc::new(gateway), limits(), false)
            .with_owner_chat(Some(ConversationId(999)));

        let msg = message(Channel::Direct, 31);
        guard.activity_task(&msg).await;
        guard.activity_task(&msg).await;
    }
}
