//! Per-document session state kept between an analysis and follow-up questions.
//!
//! Sessions are in-memory by default and do not survive a restart. The
//! backing store is injected through [`SessionBackend`], so a persistent
//! store can replace the default map without touching the pipeline.
//!
//! Every mutation replaces the whole [`Session`] value. Readers hold an
//! `Arc<Session>` snapshot and never observe a half-applied update. Writes to
//! one session are serialized; different sessions never contend.

use crate::error::{AnalysisError, Result};
use crate::validator::AnalysisResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaExchange {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

impl QaExchange {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            asked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub document_text: Arc<str>,
    pub result: Option<Arc<AnalysisResult>>,
    pub exchanges: Vec<QaExchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, document_text: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            document_text: Arc::from(document_text),
            result: None,
            exchanges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent `n` exchanges, oldest first.
    pub fn recent_exchanges(&self, n: usize) -> &[QaExchange] {
        let start = self.exchanges.len().saturating_sub(n);
        &self.exchanges[start..]
    }
}

/// Immutable view of a session at one point in time.
pub type SessionSnapshot = Arc<Session>;

/// Storage for whole session values.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>>;

    /// Stores `session`, replacing any previous value with the same id.
    async fn save(&self, session: SessionSnapshot) -> Result<()>;

    /// Returns whether a session was removed.
    async fn delete(&self, id: &SessionId) -> Result<bool>;

    async fn ids(&self) -> Result<Vec<SessionId>>;

    /// Removes every session, returning how many there were.
    async fn clear(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionBackend {
    sessions: RwLock<HashMap<SessionId, SessionSnapshot>>,
}

impl InMemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for InMemorySessionBackend {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, session: SessionSnapshot) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn ids(&self) -> Result<Vec<SessionId>> {
        Ok(self.sessions.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        Ok(count)
    }
}

#[derive(Default)]
struct SessionLocks {
    /// Held by a whole analysis or question workflow.
    workflow: Arc<AsyncMutex<()>>,
    /// Held for each read-modify-write of the stored value.
    write: Arc<AsyncMutex<()>>,
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    locks: Mutex<HashMap<SessionId, Arc<SessionLocks>>>,
    ttl: Option<Duration>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            ttl: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionBackend::new()))
    }

    /// Sessions idle for longer than `ttl` are treated as gone.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn create(&self, document_text: &str) -> Result<SessionId> {
        let id = SessionId::generate();
        self.backend
            .save(Arc::new(Session::new(id.clone(), document_text)))
            .await?;
        info!(
            "Created session {} ({} chars of document text)",
            id,
            document_text.chars().count()
        );
        Ok(id)
    }

    /// Stores new document text under `id`, creating the session if needed.
    /// The previous analysis and exchanges belong to the old text and are dropped.
    pub async fn put(&self, id: &SessionId, document_text: &str) -> Result<SessionSnapshot> {
        let locks = self.locks_for(id)?;
        let _write = locks.write.lock().await;

        let mut session = Session::new(id.clone(), document_text);
        if let Some(existing) = self.load_live(id).await? {
            session.created_at = existing.created_at;
        }
        let session = Arc::new(session);
        self.backend.save(Arc::clone(&session)).await?;
        Ok(session)
    }

    /// Atomically replaces the session's current analysis result.
    pub async fn attach_result(
        &self,
        id: &SessionId,
        result: impl Into<Arc<AnalysisResult>>,
    ) -> Result<SessionSnapshot> {
        let result = result.into();
        self.replace(id, move |session| Session {
            result: Some(result),
            ..session.clone()
        })
        .await
    }

    pub async fn record_exchange(&self, id: &SessionId, exchange: QaExchange) -> Result<SessionSnapshot> {
        self.replace(id, move |session| {
            let mut next = session.clone();
            next.exchanges.push(exchange);
            next
        })
        .await
    }

    pub async fn get(&self, id: &SessionId) -> Result<SessionSnapshot> {
        match self.load_live(id).await? {
            Some(session) => Ok(session),
            None => {
                self.forget(id)?;
                Err(AnalysisError::SessionNotFound(id.to_string()))
            }
        }
    }

    /// Exclusive access to an existing session for the duration of a workflow.
    pub async fn lock(&self, id: &SessionId) -> Result<OwnedMutexGuard<()>> {
        self.get(id).await?;
        let locks = self.locks_for(id)?;
        Ok(Arc::clone(&locks.workflow).lock_owned().await)
    }

    pub async fn clear(&self, id: &SessionId) -> Result<bool> {
        let removed = self.backend.delete(id).await?;
        self.lock_map()?.remove(id);
        if removed {
            info!("Cleared session {}", id);
        }
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut purged = 0;
        for id in self.backend.ids().await? {
            if let Some(session) = self.backend.load(&id).await? {
                if is_expired(&session, ttl, now) && self.clear(&id).await? {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!("Purged {} expired session(s)", purged);
        }
        Ok(purged)
    }

    /// Drops every session. Used on process shutdown.
    pub async fn teardown(&self) -> Result<usize> {
        let count = self.backend.clear().await?;
        self.lock_map()?.clear();
        info!("Session store torn down ({} session(s) dropped)", count);
        Ok(count)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.backend.ids().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn replace<F>(&self, id: &SessionId, apply: F) -> Result<SessionSnapshot>
    where
        F: FnOnce(&Session) -> Session + Send,
    {
        let locks = self.locks_for(id)?;
        let _write = locks.write.lock().await;

        let current = self.get(id).await?;
        let mut next = apply(&current);
        next.id = current.id.clone();
        next.updated_at = Utc::now();
        let next = Arc::new(next);
        self.backend.save(Arc::clone(&next)).await?;
        debug!("Session {} replaced", id);
        Ok(next)
    }

    async fn load_live(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        let Some(session) = self.backend.load(id).await? else {
            return Ok(None);
        };
        match self.ttl {
            Some(ttl) if is_expired(&session, ttl, Utc::now()) => {
                debug!("Session {} expired", id);
                self.backend.delete(id).await?;
                Ok(None)
            }
            _ => Ok(Some(session)),
        }
    }

    fn lock_map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, Arc<SessionLocks>>>> {
        self.locks
            .lock()
            .map_err(|_| AnalysisError::SessionStore("session lock table poisoned".to_string()))
    }

    fn locks_for(&self, id: &SessionId) -> Result<Arc<SessionLocks>> {
        Ok(Arc::clone(self.lock_map()?.entry(id.clone()).or_default()))
    }

    /// Drops the lock entry of a session that no longer exists.
    fn forget(&self, id: &SessionId) -> Result<()> {
        self.lock_map()?.remove(id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.lock_map().map(|locks| locks.len()).unwrap_or_default()
    }
}

fn is_expired(session: &Session, ttl: Duration, now: DateTime<Utc>) -> bool {
    (now - session.updated_at)
        .to_std()
        .map(|idle| idle > ttl)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(template_id: &str, data: serde_json::Value) -> AnalysisResult {
        AnalysisResult {
            template_id: template_id.to_string(),
            template_name: template_id.to_string(),
            created_at: Utc::now(),
            data,
            incomplete: false,
            truncated: false,
            missing_fields: vec![],
            issues: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SessionStore::in_memory();
        let id = store.create("Annual report 2023").await.unwrap();
        let snapshot = store.get(&id).await.unwrap();
        assert_eq!(&*snapshot.document_text, "Annual report 2023");
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = SessionStore::in_memory();
        let err = store.get(&SessionId::from("nope")).await.unwrap_err();
        assert!(matches!(err, AnalysisError::SessionNotFound(_)));

        let err = store
            .attach_result(&SessionId::from("nope"), result("financial", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_entries() {
        let store = SessionStore::in_memory();
        let live = store.create("doc").await.unwrap();
        drop(store.lock(&live).await.unwrap());
        assert_eq!(store.tracked_locks(), 1);

        for i in 0..10 {
            let bogus = SessionId::from(format!("bogus-{}", i));
            assert!(matches!(
                store.lock(&bogus).await,
                Err(AnalysisError::SessionNotFound(_))
            ));
            assert!(store
                .record_exchange(&bogus, QaExchange::new("q", "a"))
                .await
                .is_err());
        }
        assert_eq!(store.tracked_locks(), 1);
    }

    #[tokio::test]
    async fn test_attach_result_replaces_whole_result() {
        let store = SessionStore::in_memory();
        let id = store.create("doc").await.unwrap();

        let before = store
            .attach_result(&id, result("financial", json!({ "credit_score": 70 })))
            .await
            .unwrap();
        store
            .attach_result(&id, result("legal", json!({ "evaluation": { "overall_score": 55 } })))
            .await
            .unwrap();

        let after = store.get(&id).await.unwrap();
        let current = after.result.as_ref().unwrap();
        assert_eq!(current.template_id, "legal");
        assert!(current.data.get("credit_score").is_none());
        // Earlier snapshots are unaffected.
        assert_eq!(before.result.as_ref().unwrap().template_id, "financial");
    }

    #[tokio::test]
    async fn test_put_resets_analysis_and_history() {
        let store = SessionStore::in_memory();
        let id = store.create("v1").await.unwrap();
        store
            .attach_result(&id, result("financial", json!({})))
            .await
            .unwrap();
        store
            .record_exchange(&id, QaExchange::new("q", "a"))
            .await
            .unwrap();

        let replaced = store.put(&id, "v2").await.unwrap();
        assert_eq!(&*replaced.document_text, "v2");
        assert!(replaced.result.is_none());
        assert!(replaced.exchanges.is_empty());
    }

    #[tokio::test]
    async fn test_exchanges_kept_in_order() {
        let store = SessionStore::in_memory();
        let id = store.create("doc").await.unwrap();
        for i in 0..4 {
            store
                .record_exchange(&id, QaExchange::new(format!("q{}", i), format!("a{}", i)))
                .await
                .unwrap();
        }
        let snapshot = store.get(&id).await.unwrap();
        let recent: Vec<&str> = snapshot
            .recent_exchanges(2)
            .iter()
            .map(|e| e.question.as_str())
            .collect();
        assert_eq!(recent, vec!["q2", "q3"]);
    }

    #[tokio::test]
    async fn test_expired_sessions_are_not_found() {
        let store = SessionStore::in_memory().with_ttl(Some(Duration::from_millis(20)));
        let id = store.create("doc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            store.get(&id).await,
            Err(AnalysisError::SessionNotFound(_))
        ));
        assert!(store.is_empty().await.unwrap());
        assert_eq!(store.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_lock_entry_is_dropped() {
        let store = SessionStore::in_memory().with_ttl(Some(Duration::from_millis(20)));
        let id = store.create("doc").await.unwrap();
        drop(store.lock(&id).await.unwrap());
        assert_eq!(store.tracked_locks(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.lock(&id).await.is_err());
        assert_eq!(store.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_purge_and_teardown() {
        let store = SessionStore::in_memory().with_ttl(Some(Duration::from_millis(20)));
        store.create("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = store.create("new").await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&fresh).await.is_ok());

        assert_eq!(store.teardown().await.unwrap(), 1);
        assert!(store.get(&fresh).await.is_err());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = SessionStore::in_memory();
        let id = store.create("doc").await.unwrap();
        assert!(store.clear(&id).await.unwrap());
        assert!(!store.clear(&id).await.unwrap());
        assert!(store.get(&id).await.is_err());
    }
}
