//! Conversation turns and the bounded session store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum number of sessions kept in memory.
pub const DEFAULT_MAX_SESSIONS: usize = 50;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The question side.
    User,
    /// The model's answer.
    Assistant,
}

/// One turn of a conversation.
///
/// Serializes to the `{"role": ..., "content": ...}` shape the Messages API
/// expects, so a session's history can be sent upstream as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// A snapshot of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    turns: Vec<Turn>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            turns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Turns in chronological order.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Consume the snapshot, keeping only the turns.
    #[must_use]
    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Thread-safe, capacity-bounded store of conversation sessions.
///
/// Eviction is by insertion order: when a `put` pushes the store over
/// capacity, the session that was inserted first is dropped, regardless of
/// how recently it was read or extended. Cloning the store shares the same
/// underlying map.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<SessionStoreInner>>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct SessionStoreInner {
    sessions: HashMap<String, Session>,
    /// Session ids, oldest insertion first.
    order: VecDeque<String>,
}

impl SessionStoreInner {
    fn evict_over(&mut self, capacity: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.sessions.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.sessions.remove(&oldest).is_some() {
                evicted.push(oldest);
            }
        }
        evicted
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    /// Create a store holding at most `capacity` sessions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionStoreInner::default())),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a snapshot of a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().sessions.get(id).cloned()
    }

    /// Append `turns` to the session `id`, creating it if unknown.
    ///
    /// Capacity is enforced in the same critical section; the ids of any
    /// evicted sessions are returned.
    pub fn put(&self, id: &str, turns: Vec<Turn>) -> Vec<String> {
        let mut guard = self.lock();
        if let Some(session) = guard.sessions.get_mut(id) {
            session.turns.extend(turns);
        } else {
            let mut session = Session::new(id.to_string());
            session.turns = turns;
            guard.sessions.insert(id.to_string(), session);
            guard.order.push_back(id.to_string());
        }

        let evicted = guard.evict_over(self.capacity);
        drop(guard);

        if !evicted.is_empty() {
            tracing::debug!(
                name: "session.evicted",
                evicted = ?evicted,
                capacity = self.capacity,
                "Evicted sessions over capacity"
            );
        }
        evicted
    }

    /// Drop oldest-inserted sessions until the store is within capacity.
    pub fn evict_if_over_capacity(&self) -> Vec<String> {
        self.lock().evict_over(self.capacity)
    }

    /// Get the number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_creates_then_appends() {
        let store = SessionStore::new(4);

        store.put("s1", vec![Turn::user("q1"), Turn::assistant("a1")]);
        store.put("s1", vec![Turn::user("q2"), Turn::assistant("a2")]);

        let session = store.get("s1").unwrap();
        let contents: Vec<&str> = session.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
        assert_eq!(session.turns()[2].role, TurnRole::User);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_session_metadata() {
        let store = SessionStore::new(4);
        assert_eq!(store.capacity(), 4);

        let before = Utc::now();
        store.put("s1", vec![Turn::user("q1"), Turn::assistant("a1")]);
        let first = store.get("s1").unwrap();
        assert_eq!(first.id(), "s1");
        assert_eq!(first.turn_count(), 2);
        assert!(first.created_at() >= before);

        store.put("s1", vec![Turn::user("q2")]);
        let second = store.get("s1").unwrap();
        assert_eq!(second.turn_count(), 3);
        assert_eq!(second.created_at(), first.created_at());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let store = SessionStore::new(3);
        for i in 0..20 {
            store.put(&format!("s{i}"), vec![Turn::user("q")]);
            assert!(store.len() <= 3);
        }
        assert_eq!(store.len(), 3);
        assert!(store.get("s19").is_some());
        assert!(store.get("s16").is_none());
    }

    #[test]
    fn test_oldest_inserted_is_evicted_first() {
        let store = SessionStore::new(2);
        store.put("first", vec![Turn::user("1")]);
        store.put("second", vec![Turn::user("2")]);

        // Extending "first" does not move it to the back of the queue.
        store.put("first", vec![Turn::assistant("1b")]);
        let _ = store.get("first");

        let evicted = store.put("third", vec![Turn::user("3")]);
        assert_eq!(evicted, vec!["first".to_string()]);
        assert!(store.get("second").is_some());
        assert!(store.get("third").is_some());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let store = SessionStore::new(0);
        store.put("s", vec![Turn::user("q")]);
        assert!(store.is_empty());
        assert!(store.evict_if_over_capacity().is_empty());
    }

    #[test]
    fn test_concurrent_puts_stay_bounded() {
        let store = SessionStore::new(10);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.put(&format!("t{t}-{i}"), vec![Turn::user("q")]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_turn_wire_shape() {
        let json = serde_json::to_value(Turn::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }
}
