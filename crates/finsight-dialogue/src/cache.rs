use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, instrument};

use finsight_store::StoreGateway;

use crate::error::{DialogueError, Result};
use crate::store::{ConversationStore, Turn, MAX_TURNS};

/// In-memory map of session id → conversation store with TTL eviction.
///
/// On a miss the store is rehydrated from the session's last messages, so
/// eviction only costs a bounded read. Mutation happens under the
/// dispatcher's per-session advisory lock; readers take snapshots.
pub struct SessionCache {
    gateway: Arc<StoreGateway>,
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

struct Entry {
    store: ConversationStore,
    last_touched: Instant,
}

impl SessionCache {
    pub fn new(gateway: Arc<StoreGateway>, ttl: Duration) -> Self {
        Self {
            gateway,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Resolve (or create) the session and make sure its conversation store
    /// is cached. Returns the session id.
    ///
    /// With no id, a fresh session is created and starts empty. With an id,
    /// the session must exist; a cold cache hydrates from the last
    /// [`MAX_TURNS`] message pairs.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, session_id: Option<&str>, user_id: &str) -> Result<String> {
        match session_id {
            None => {
                let session = self.gateway.create_session(user_id, None)?;
                self.entries.insert(
                    session.id.clone(),
                    Entry {
                        store: ConversationStore::new(),
                        last_touched: Instant::now(),
                    },
                );
                debug!(session_id = %session.id, "new session created");
                Ok(session.id)
            }
            Some(id) => {
                if self.gateway.get_session(id)?.is_none() {
                    return Err(DialogueError::SessionNotFound { id: id.to_string() });
                }
                if let Some(mut entry) = self.entries.get_mut(id) {
                    entry.last_touched = Instant::now();
                    return Ok(id.to_string());
                }
                // Cold cache: hydrate a bounded window. Two messages per
                // turn, so read twice the turn cap.
                let messages = self.gateway.list_session_messages(id, MAX_TURNS * 2)?;
                let store = ConversationStore::from_messages(&messages);
                debug!(session_id = %id, turns = store.len(), "session hydrated");
                self.entries.insert(
                    id.to_string(),
                    Entry {
                        store,
                        last_touched: Instant::now(),
                    },
                );
                Ok(id.to_string())
            }
        }
    }

    /// Snapshot of the cached store, or `None` when not cached (no hydrate).
    pub fn get(&self, session_id: &str) -> Option<ConversationStore> {
        let mut entry = self.entries.get_mut(session_id)?;
        entry.last_touched = Instant::now();
        Some(entry.store.clone())
    }

    /// Record a routed user turn in memory. The dispatcher has already
    /// appended the durable chat message through the store gateway, so a
    /// later rehydration reproduces this turn.
    pub fn add_turn(&self, session_id: &str, turn: Turn) {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.store.add_turn(turn);
            entry.last_touched = Instant::now();
        }
    }

    /// Attach the completed analysis summary to the session's latest turn.
    pub fn complete_turn(&self, session_id: &str, summary: &str) {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.store.complete_last_turn(summary);
            entry.last_touched = Instant::now();
        }
    }

    /// Evict entries idle past the TTL. Returns how many were dropped.
    pub fn sweep_idle(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.last_touched.elapsed() < ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "idle conversation stores evicted");
        }
        evicted
    }

    pub fn cached_sessions(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::types::{ChatMessage, MessageStatus, QueryType, Role};
    use finsight_store::gateway::MessageUpdate;

    fn cache() -> (Arc<StoreGateway>, SessionCache) {
        let gateway = Arc::new(StoreGateway::in_memory().unwrap());
        let cache = SessionCache::new(gateway.clone(), Duration::from_secs(900));
        (gateway, cache)
    }

    #[test]
    fn creates_session_when_none_supplied() {
        let (gateway, cache) = cache();
        let id = cache.get_or_create(None, "trader1").unwrap();
        assert!(gateway.get_session(&id).unwrap().is_some());
        assert!(cache.get(&id).unwrap().is_empty());
    }

    #[test]
    fn unknown_session_id_is_an_error() {
        let (_gateway, cache) = cache();
        let err = cache.get_or_create(Some("nope"), "trader1").unwrap_err();
        assert!(matches!(err, DialogueError::SessionNotFound { .. }));
    }

    #[test]
    fn turn_added_in_memory_survives_eviction_via_rehydration() {
        let (gateway, cache) = cache();
        let id = cache.get_or_create(None, "trader1").unwrap();

        // The durable message the dispatcher would have written.
        let mut msg = ChatMessage::new(&id, Role::User, "What is AAPL volatility?");
        msg.query_type = Some(QueryType::Complete);
        gateway.create_message(&msg).unwrap();
        gateway
            .update_message_status(&msg.id, MessageStatus::Pending, MessageUpdate {
                expanded_question: Some("What is AAPL volatility?".into()),
                ..Default::default()
            })
            .unwrap();

        cache.add_turn(&id, Turn {
            user_query: "What is AAPL volatility?".into(),
            expanded_query: "What is AAPL volatility?".into(),
            query_type: QueryType::Complete,
            analysis_summary: None,
        });
        assert_eq!(cache.get(&id).unwrap().len(), 1);

        // Drop the in-memory projection; a fresh cache rebuilds it from
        // the durable messages.
        let fresh = SessionCache::new(gateway, Duration::from_secs(900));
        fresh.get_or_create(Some(&id), "trader1").unwrap();
        let store = fresh.get(&id).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.last_turn().unwrap().user_query, "What is AAPL volatility?");
    }

    #[test]
    fn sweep_only_evicts_idle_entries() {
        let (gateway, cache) = cache();
        let id = cache.get_or_create(None, "trader1").unwrap();
        assert_eq!(cache.sweep_idle(), 0, "fresh entry stays");
        assert_eq!(cache.cached_sessions(), 1);
        assert!(cache.get(&id).is_some());

        // A zero-TTL cache treats every entry as idle.
        let zero_ttl = SessionCache::new(gateway, Duration::from_secs(0));
        zero_ttl.get_or_create(Some(&id), "trader1").unwrap();
        assert_eq!(zero_ttl.sweep_idle(), 1);
        assert!(zero_ttl.get(&id).is_none(), "get never rehydrates");
    }
}
