//! # Stage: Key-Value Store and Sessions
//!
//! ## Responsibility
//! Provide the passthrough key-value capability (get/set/expire/delete) the
//! dispatch facade is handed, and the session transcript layer built on it.
//!
//! ## Guarantees
//! - Expired entries are never returned by the memory backend.
//! - Bounded: the memory backend never holds more than `max_entries` keys.
//! - A corrupt transcript reads as empty rather than failing the request.
//!
//! ## NOT Responsible For
//! - Cross-request locking: concurrent appends to the same session are
//!   last-writer-wins.
//! - Eviction policy beyond "drop an arbitrary entry when full".

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;

/// Key prefix for session transcripts.
pub const SESSION_PREFIX: &str = "gateway:sessions:";

/// Store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(feature = "caching")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Minimal key-value capability.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` at `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a new expiry on `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store on a [`DashMap`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl MemoryStore {
    /// Store holding at most `max_entries` keys; `0` means unbounded.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Number of stored keys, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&self) {
        let now = Instant::now();
        // Collect the key first so no shard guard is held across remove.
        let victim = {
            let expired = self
                .entries
                .iter()
                .find(|e| !e.value().is_live(now))
                .map(|e| e.key().clone());
            expired.or_else(|| self.entries.iter().next().map(|e| e.key().clone()))
        };
        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!(key = %key, "evicted (memory)");
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove(key);
        debug!(key, "expired (memory)");
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        if self.max_entries > 0
            && self.entries.len() >= self.max_entries
            && !self.entries.contains_key(key)
        {
            self.evict_one();
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis-backed store (feature `caching`).
#[cfg(feature = "caching")]
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: redis::Client,
}

#[cfg(feature = "caching")]
impl RedisStore {
    /// Open a client and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Backend`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[cfg(feature = "caching")]
#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Build the configured store, or `None` when sessions are disabled.
///
/// A `store.url` selects Redis when the `caching` feature is compiled in;
/// otherwise the memory backend is used and a warning is logged.
///
/// # Errors
///
/// [`StoreError::Backend`] if Redis is configured but unreachable.
pub async fn build_store(
    config: &StoreConfig,
) -> Result<Option<Arc<dyn KeyValueStore>>, StoreError> {
    if !config.enabled {
        info!("session store disabled");
        return Ok(None);
    }

    if let Some(url) = config.url.as_deref() {
        #[cfg(feature = "caching")]
        {
            let store = RedisStore::connect(url).await?;
            info!("using redis session store");
            return Ok(Some(Arc::new(store)));
        }
        #[cfg(not(feature = "caching"))]
        {
            let _ = url;
            warn!("store.url is set but the `caching` feature is not enabled; using memory store");
        }
    }

    info!(max_entries = config.max_entries, "using in-memory session store");
    Ok(Some(Arc::new(MemoryStore::new(config.max_entries))))
}

// ============================================================================
// Sessions
// ============================================================================

/// Speaker of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller.
    User,
    /// The provider's reply.
    Assistant,
    /// Injected context.
    System,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who said it.
    pub role: Role,
    /// What was said.
    pub content: String,
}

impl Message {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Injected context.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Transcript {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct TranscriptRef<'a> {
    messages: &'a [Message],
}

/// Session transcripts stored as JSON under [`SESSION_PREFIX`].
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("backend", &self.kv.backend())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionStore {
    /// Sessions on `kv`, expiring after `ttl` of inactivity when given.
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Option<Duration>) -> Self {
        Self { kv, ttl }
    }

    /// A fresh random session id.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn key(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    /// Messages recorded for `session_id`; empty when unknown.
    ///
    /// # Errors
    ///
    /// [`StoreError::Backend`] when the backend fails.
    pub async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let Some(raw) = self.kv.get(&Self::key(session_id)).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Transcript>(&raw) {
            Ok(t) => Ok(t.messages),
            Err(e) => {
                warn!(session_id, error = %e, "corrupt session transcript, starting fresh");
                Ok(Vec::new())
            }
        }
    }

    /// Append `messages` to the transcript for `session_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the backend fails.
    pub async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        let mut transcript = Transcript {
            messages: self.load(session_id).await?,
        };
        transcript.messages.extend_from_slice(messages);
        let raw = serde_json::to_string(&transcript)?;
        self.kv.set(&Self::key(session_id), raw, self.ttl).await
    }

    /// Replace the whole transcript for `session_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the backend fails.
    pub async fn save(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&TranscriptRef { messages })?;
        self.kv.set(&Self::key(session_id), raw, self.ttl).await
    }

    /// Backend name.
    pub fn backend(&self) -> &'static str {
        self.kv.backend()
    }
}
