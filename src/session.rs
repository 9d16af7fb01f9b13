//! Per-conversation session state
//!
//! Sessions are advisory and memory-resident: they live in a TTL cache,
//! are created lazily on first contact and silently forgotten when idle.

use crate::catalog::SearchResult;
use crate::gateway::{Channel, ConversationId, ParticipantId};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Identifies one session: the conversation, plus the sender inside groups
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ConversationKey {
    /// Conversation the message arrived in
    pub conversation: ConversationId,
    /// Sender, only set for group conversations
    pub participant: Option<ParticipantId>,
}

impl ConversationKey {
    /// Key for a message from `participant` in `conversation` over `channel`
    #[must_use]
    pub const fn for_message(
        channel: Channel,
        conversation: ConversationId,
        participant: ParticipantId,
    ) -> Self {
        match channel {
            Channel::Direct => Self {
                conversation,
                participant: None,
            },
            Channel::Group => Self {
                conversation,
                participant: Some(participant),
            },
        }
    }
}

/// Where a conversation currently is in its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No message handled yet
    #[default]
    Idle,
    /// Next message is a catalog query
    WaitingForSearch,
    /// Next message is a numeric pick from the stored results
    WaitingForSelection,
}

/// Sliding burst counter used for rate limiting
#[derive(Debug, Clone, Copy, Default)]
pub struct RateWindow {
    last_admitted: Option<Instant>,
    burst: u32,
}

impl RateWindow {
    /// Register a message arriving at `now`.
    ///
    /// Messages closer than `quiet` to the last admitted one grow the burst
    /// counter; once it exceeds `ceiling` the message is throttled (returns
    /// `false`) and the window is left untouched. A gap of at least `quiet`
    /// resets the counter.
    pub fn register(&mut self, now: Instant, quiet: Duration, ceiling: u32) -> bool {
        if let Some(last) = self.last_admitted {
            if now.saturating_duration_since(last) >= quiet {
                self.burst = 0;
            }
        }

        self.burst = self.burst.saturating_add(1);
        if self.burst > ceiling {
            return false;
        }
        self.last_admitted = Some(now);
        true
    }

    /// Current burst counter
    #[must_use]
    pub const fn burst(&self) -> u32 {
        self.burst
    }
}

/// Mutable state of one conversation
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    /// Current flow state
    pub state: SessionState,
    /// Results of the last search, indexed 1..=N; empty outside selection
    pub results: Vec<SearchResult>,
    /// Rate-limiting window
    pub rate: RateWindow,
    listing: u64,
}

impl ConversationSession {
    /// Drop stored results and go back to accepting queries
    pub fn reset_to_search(&mut self) {
        self.state = SessionState::WaitingForSearch;
        self.results.clear();
    }

    /// Store a fresh result list and wait for a pick from it
    pub fn present(&mut self, results: Vec<SearchResult>) {
        self.results = results;
        self.state = SessionState::WaitingForSelection;
        self.listing = self.listing.wrapping_add(1);
    }

    /// Counter identifying the result list currently presented
    #[must_use]
    pub const fn listing(&self) -> u64 {
        self.listing
    }

    /// Return to search after a selection made from `listing` ran, unless a
    /// newer list was presented meanwhile
    pub fn finish_listing(&mut self, listing: u64) {
        if self.listing == listing {
            self.reset_to_search();
        }
    }
}

/// Slots with a running acquisition, by key
///
/// Outlives cache eviction, so a session re-created for a key still sees the
/// acquisition started through its evicted predecessor.
#[derive(Default)]
struct ActiveSlots {
    slots: Mutex<HashMap<ConversationKey, Arc<InFlightSlot>>>,
}

impl std::fmt::Debug for ActiveSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSlots")
            .field("running", &self.lock().len())
            .finish()
    }
}

impl ActiveSlots {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, Arc<InFlightSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// At-most-one acquisition marker with try-lock semantics
#[derive(Debug, Default)]
pub struct InFlightSlot {
    label: Mutex<Option<String>>,
    registration: Option<(ConversationKey, Arc<ActiveSlots>)>,
}

impl InFlightSlot {
    fn registered(key: ConversationKey, active: Arc<ActiveSlots>) -> Self {
        Self {
            label: Mutex::default(),
            registration: Some((key, active)),
        }
    }

    /// Claim the slot, failing fast when an acquisition is already running
    /// for this slot or, for store-created slots, for the same key
    #[must_use]
    pub fn try_begin(self: &Arc<Self>, label: impl Into<String>) -> Option<InFlightGuard> {
        let mut current = self.label.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return None;
        }
        if let Some((key, active)) = &self.registration {
            let mut slots = active.lock();
            if slots.contains_key(key) {
                return None;
            }
            slots.insert(*key, self.clone());
        }
        *current = Some(label.into());
        Some(InFlightGuard { slot: self.clone() })
    }

    /// Label of the running acquisition, if any
    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Releases the in-flight slot when dropped, including on error paths
#[derive(Debug)]
pub struct InFlightGuard {
    slot: Arc<InFlightSlot>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut current = self.slot.label.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((key, active)) = &self.slot.registration {
            let mut slots = active.lock();
            if slots.get(key).is_some_and(|held| Arc::ptr_eq(held, &self.slot)) {
                slots.remove(key);
            }
        }
        *current = None;
    }
}

/// Shared handle to one session
///
/// `state` serializes handling for a key; `in_flight` is checked without
/// waiting so a second request is rejected instead of queued.
#[derive(Debug, Default)]
pub struct SessionHandle {
    /// Session state, locked for the duration of one message's handling
    pub state: tokio::sync::Mutex<ConversationSession>,
    /// Acquisition marker
    pub in_flight: Arc<InFlightSlot>,
}

/// Bounded, idle-evicting store of sessions
#[derive(Clone)]
pub struct SessionStore {
    cache: Cache<ConversationKey, Arc<SessionHandle>>,
    active: Arc<ActiveSlots>,
}

impl SessionStore {
    /// Create a store evicting sessions idle for longer than `idle_ttl`
    ///
    /// # Examples
    ///
    /// ```
    /// use apk_courier::session::SessionStore;
    /// use std::time::Duration;
    ///
    /// let store = SessionStore::new(Duration::from_secs(3600), 10_000);
    /// ```
    #[must_use]
    pub fn new(idle_ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_idle(idle_ttl)
            .build();
        Self {
            cache,
            active: Arc::default(),
        }
    }

    /// Get the session for `key`, creating it on first contact
    ///
    /// A re-created session adopts the in-flight slot of an acquisition still
    /// running for `key`.
    pub async fn get_or_create(&self, key: ConversationKey) -> Arc<SessionHandle> {
        let active = self.active.clone();
        self.cache
            .get_with(key, async move {
                let running = active.lock().get(&key).cloned();
                let in_flight =
                    running.unwrap_or_else(|| Arc::new(InFlightSlot::registered(key, active)));
                Arc::new(SessionHandle {
                    state: tokio::sync::Mutex::default(),
                    in_flight,
                })
            })
            .await
    }

    /// Number of live sessions
    ///
    /// Useful for monitoring and health checks.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
