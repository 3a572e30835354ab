//! Key/value backends for the result cache.

use async_trait::async_trait;
use glob::{Pattern, PatternError};
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use thiserror::Error;

const SCAN_BATCH: u64 = 100;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] PatternError),
}

/// Figures reported by the backend itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreInfo {
    pub key_count: u64,
    pub memory_used: Option<String>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every key matching a glob (`*`, `?`) and returns how many were removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;

    async fn info(&self) -> Result<StoreInfo, CacheError>;
}

/// Redis-backed store sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = self.conn.clone().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let _: () = self
            .conn
            .clone()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let removed: u64 = self.conn.clone().del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut deleted = 0u64;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn info(&self) -> Result<StoreInfo, CacheError> {
        let mut conn = self.conn.clone();
        let key_count: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        let memory: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        Ok(StoreInfo {
            key_count,
            memory_used: parse_info_field(&memory, "used_memory_human"),
        })
    }
}

fn parse_info_field(info: &str, field: &str) -> Option<String> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == field).then(|| value.trim().to_string())
    })
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local store with per-entry expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, MemoryEntry>, now: Instant) {
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, now);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let pattern = key_pattern(pattern)?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        Ok((before - entries.len()) as u64)
    }

    async fn info(&self) -> Result<StoreInfo, CacheError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, Instant::now());
        let bytes: usize = entries
            .iter()
            .map(|(key, entry)| key.len() + entry.value.len())
            .sum();
        Ok(StoreInfo {
            key_count: entries.len() as u64,
            memory_used: Some(format!("{bytes}B")),
        })
    }
}

/// Compiles a Redis `SCAN MATCH` pattern for `glob`. Backslash escapes become
/// one-character classes and `[^...]` becomes `[!...]`. Runs of `*` collapse because
/// `glob` reserves `**`.
pub fn key_pattern(pattern: &str) -> Result<Pattern, PatternError> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) => {
                    translated.push('[');
                    translated.push(escaped);
                    translated.push(']');
                }
                Some(escaped) => translated.push(escaped),
                None => translated.push('\\'),
            },
            '[' => {
                translated.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    translated.push('!');
                }
            }
            '*' if translated.ends_with('*') => {}
            other => translated.push(other),
        }
    }
    Pattern::new(&translated)
}
