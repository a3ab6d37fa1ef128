//! Key-value interface backing the distributed limiter and cache modes.
//!
//! Concrete backends (a shared cache server, typically) plug in behind
//! [`KvStore`]. The in-memory implementation serves local development and
//! tests; it honors the same TTL and compare-and-set semantics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("KV backend unavailable: {0}")]
    Unavailable(String),
    #[error("KV operation failed: {0}")]
    Operation(String),
}

/// Pluggable KV backend: get, compare-and-set, counter-with-TTL and
/// publish/subscribe.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Stores `value` only if the current value equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Increments a counter, creating it with the TTL when absent.
    /// Returns the post-increment value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, KvError>;

    /// Publishes a message on a channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), KvError>;

    /// Subscribes to a channel.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, KvError>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

/// Process-local KV store with TTL support.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let entries = self.entries.read().expect("kv lock poisoned");
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.write().expect("kv lock poisoned");
        let current = entries.get(key).filter(|e| e.live()).map(|e| e.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        let mut entries = self.entries.write().expect("kv lock poisoned");
        let next = match entries.get(key).filter(|e| e.live()) {
            Some(entry) => {
                let current: u64 = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let expires_at = entry.expires_at;
                let next = current + 1;
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.to_string().into_bytes(),
                        expires_at,
                    },
                );
                next
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: b"1".to_vec(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                1
            }
        };
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), KvError> {
        if let Some(sender) = self
            .channels
            .read()
            .expect("kv lock poisoned")
            .get(channel)
        {
            let _ = sender.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, KvError> {
        let mut channels = self.channels.write().expect("kv lock poisoned");
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(sender.subscribe())
    }
}
