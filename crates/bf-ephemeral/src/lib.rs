//! bf-ephemeral
//!
//! In-memory realization of the [`EphemeralStore`] collaborator: TTL'd
//! key/value, list queues with a blocking pop, and broadcast pub/sub, all
//! behind one async lock. Deployments that outgrow a single host swap this
//! for an external cache without touching any consumer; every component is
//! written against the trait.
//!
//! TTL semantics: expiry deadlines use the monotonic clock. Expired entries
//! are dropped lazily on access and by the background sweeper, so a value
//! is gone at most one sweep tick after its TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

use bf_schemas::{EphemeralStore, Subscription};

/// Buffer depth for each pub/sub channel. Slow subscribers lag and skip
/// ahead rather than applying backpressure to publishers.
const CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

struct KvEntry {
    value: Value,
    expires_at: Instant,
}

struct ListEntry {
    items: VecDeque<Value>,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, KvEntry>,
    lists: HashMap<String, ListEntry>,
    channels: HashMap<String, broadcast::Sender<Value>>,
    list_wakeups: HashMap<String, Arc<Notify>>,
}

impl Inner {
    fn purge_expired(&mut self, now: Instant) {
        self.kv.retain(|_, e| e.expires_at > now);
        self.lists.retain(|_, e| e.expires_at > now);
    }

    fn channel(&mut self, name: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn wakeup(&mut self, list: &str) -> Arc<Notify> {
        self.list_wakeups
            .entry(list.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// Shared in-memory store. Clone-cheap via `Arc`; one instance serves every
/// in-process component of a deployment.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Drop expired keys/lists now. Called by the sweeper; exposed so tests
    /// can force a sweep deterministically.
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
    }
}

/// Spawn a background task that sweeps expired entries every `interval`.
pub fn spawn_sweeper(store: MemoryStore, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.sweep().await;
        }
    });
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.kv.get(key) {
            Some(e) if e.expires_at > now => Ok(Some(e.value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn rpush(&self, list: &str, value: Value, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let entry = inner
            .lists
            .entry(list.to_string())
            .or_insert_with(|| ListEntry {
                items: VecDeque::new(),
                expires_at: now + ttl,
            });
        // A push refreshes the list's deadline; readers race TTL, not pushes.
        entry.expires_at = now + ttl;
        entry.items.push_back(value);
        let wakeup = inner.wakeup(list);
        drop(inner);
        // notify_one stores a permit when nobody is waiting yet, so a pop
        // that races this push still wakes immediately.
        wakeup.notify_one();
        Ok(())
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            let wakeup = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.purge_expired(now);
                if let Some(entry) = inner.lists.get_mut(list) {
                    if let Some(v) = entry.items.pop_front() {
                        return Ok(Some(v));
                    }
                }
                if now >= deadline {
                    return Ok(None);
                }
                inner.wakeup(list)
            };

            tokio::select! {
                _ = wakeup.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    trace!(list, "blpop timed out");
                }
            }
        }
    }

    async fn publish(&self, channel: &str, message: Value) -> Result<()> {
        let tx = {
            let mut inner = self.inner.lock().await;
            inner.channel(channel)
        };
        // No subscribers is fine; completion events are best-effort fan-out.
        let _ = tx.send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let tx = {
            let mut inner = self.inner.lock().await;
            inner.channel(channel)
        };
        Ok(Subscription::new(tx.subscribe()))
    }
}
