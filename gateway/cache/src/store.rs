use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use bytes::Bytes;
use gateway_core::CacheStore;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Expired entries are purged by the first write after this much time has passed since the last
/// purge.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Longer TTLs are clamped to this.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An in-process [`CacheStore`] with per-key expiry and a tag index.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Stored>,
    tags: HashMap<String, HashSet<String>>,
    swept_at: Option<Instant>,
}

#[derive(Debug)]
struct Stored {
    value: Bytes,
    expires_at: Instant,
    tags: Vec<String>,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .read()
            .entries
            .values()
            .filter(|s| s.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of entries held, including expired entries that haven't been purged yet.
    #[cfg(test)]
    pub(crate) fn held(&self) -> usize {
        self.state.read().entries.len()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let now = Instant::now();
        {
            let state = self.state.read();
            match state.entries.get(key) {
                None => return Ok(None),
                Some(stored) if stored.expires_at > now => return Ok(Some(stored.value.clone())),
                Some(_) => {}
            }
        }

        // The entry expired; drop it so that it no longer occupies memory.
        let mut state = self.state.write();
        if state.entries.get(key).is_some_and(|s| s.expires_at <= now) {
            state.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut state = self.state.write();
        if state
            .swept_at
            .is_none_or(|at| now.saturating_duration_since(at) >= SWEEP_INTERVAL)
        {
            state.sweep(now);
        }

        state.remove(key);
        for tag in tags {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.entries.insert(
            key.to_string(),
            Stored {
                value,
                expires_at: now + ttl.min(MAX_TTL),
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut state = self.state.write();
        let deleted = keys
            .iter()
            .filter_map(|key| state.remove(key))
            .filter(|s| s.expires_at > now)
            .count();
        Ok(deleted)
    }

    async fn delete_by_tags(&self, tags: &[String]) -> anyhow::Result<usize> {
        let now = Instant::now();
        let mut state = self.state.write();
        let keys = tags
            .iter()
            .filter_map(|tag| state.tags.get(tag))
            .flatten()
            .cloned()
            .collect::<HashSet<_>>();
        let deleted = keys
            .iter()
            .filter_map(|key| state.remove(key))
            .filter(|s| s.expires_at > now)
            .count();
        Ok(deleted)
    }
}

// === impl State ===

impl State {
    fn sweep(&mut self, now: Instant) {
        let expired = self
            .entries
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            self.remove(key);
        }
        if !expired.is_empty() {
            tracing::debug!(entries = expired.len(), "Purged expired cache entries");
        }
        self.swept_at = Some(now);
    }

    fn remove(&mut self, key: &str) -> Option<Stored> {
        let stored = self.entries.remove(key)?;
        for tag in &stored.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(stored)
    }
}
