//! USSD session state with explicit expiry
//!
//! Sessions expire when `last_activity_at + ttl` has passed. Expiry is
//! checked on read and swept in bulk by [`SessionStore::purge_expired`]; no
//! per-session timers are kept.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::LedgerResult;
use crate::models::PhoneNumber;

pub const MAIN_MENU: &str = "MAIN_MENU";

/// Default idle lifetime of a session
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UssdSession {
    pub session_id: String,
    pub phone: PhoneNumber,
    state: String,
    data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UssdSession {
    pub fn new(session_id: impl Into<String>, phone: PhoneNumber) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            phone,
            state: MAIN_MENU.to_string(),
            data: HashMap::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
        self.touch();
    }

    pub fn data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
        self.touch();
    }

    /// Back to the main menu with no collected input
    pub fn reset(&mut self) {
        self.state = MAIN_MENU.to_string();
        self.data.clear();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.last_activity_at + ttl
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(ttl)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the live session, or a fresh one at the main menu. Either way
    /// its activity time is refreshed.
    async fn get_or_create(&self, session_id: &str, phone: &PhoneNumber)
        -> LedgerResult<UssdSession>;

    async fn get(&self, session_id: &str) -> LedgerResult<Option<UssdSession>>;

    async fn save(&self, session: UssdSession) -> LedgerResult<()>;

    async fn remove(&self, session_id: &str) -> LedgerResult<bool>;

    /// Drops expired sessions, returning how many went
    async fn purge_expired(&self) -> LedgerResult<usize>;
}

/// Session store held in process memory
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, UssdSession>>>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn active_sessions(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired(self.ttl, now))
            .count()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(
        &self,
        session_id: &str,
        phone: &PhoneNumber,
    ) -> LedgerResult<UssdSession> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let live = sessions
            .get(session_id)
            .filter(|s| !s.is_expired(self.ttl, now))
            .cloned();

        let session = match live {
            Some(mut session) => {
                session.touch();
                session
            }
            None => {
                tracing::debug!(session_id = %session_id, phone = %phone, "Starting USSD session");
                UssdSession::new(session_id, phone.clone())
            }
        };

        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> LedgerResult<Option<UssdSession>> {
        let now = Utc::now();
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .filter(|s| !s.is_expired(self.ttl, now))
            .cloned())
    }

    async fn save(&self, session: UssdSession) -> LedgerResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> LedgerResult<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn purge_expired(&self) -> LedgerResult<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.ttl, now));
        Ok(before - sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("0712345678").unwrap()
    }

    #[tokio::test]
    async fn test_session_state_and_data_persist_across_requests() {
        let store = InMemorySessionStore::default();

        let mut session = store.get_or_create("ATUid_1", &phone()).await.unwrap();
        assert_eq!(session.state(), MAIN_MENU);
        session.set_state("REQUEST_LOAN_AMOUNT");
        session.set_data("amount", json!(1500));
        store.save(session).await.unwrap();

        let resumed = store.get_or_create("ATUid_1", &phone()).await.unwrap();
        assert_eq!(resumed.state(), "REQUEST_LOAN_AMOUNT");
        assert_eq!(resumed.data("amount"), Some(&json!(1500)));
    }

    #[tokio::test]
    async fn test_reset_returns_to_main_menu() {
        let mut session = UssdSession::new("s", phone());
        session.set_state("CONFIRM");
        session.set_data("lender", json!("254722000111"));
        session.reset();

        assert_eq!(session.state(), MAIN_MENU);
        assert!(session.data("lender").is_none());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_invisible_and_purged() {
        let store = InMemorySessionStore::new(Duration::from_secs(180));
        let mut stale = UssdSession::new("old", phone());
        stale.set_state("CONFIRM");
        stale.last_activity_at = Utc::now() - chrono::Duration::minutes(4);
        store.save(stale).await.unwrap();
        store.get_or_create("fresh", &phone()).await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        let restarted = store.get_or_create("old", &phone()).await.unwrap();
        assert_eq!(restarted.state(), MAIN_MENU);

        store.remove("old").await.unwrap();
        let mut expired = UssdSession::new("gone", phone());
        expired.last_activity_at = Utc::now() - chrono::Duration::minutes(10);
        store.save(expired).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.active_sessions().await, 1);
    }
}
