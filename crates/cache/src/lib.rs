//! In-memory decision cache.
//!
//! Implements the gateway's [`DecisionCache`] port with a per-kind TTL
//! (operation decisions expire quickly, URL verdicts live longer) and a size
//! bound enforced by evicting the oldest insertion first.
//!
//! ## Architectural Layer
//!
//! **Infrastructure adapter.** Holds no policy; the gateway decides what is
//! cached and under which key.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gateway::config::duration_ms;
use gateway::{CacheKey, CollaboratorError, Decision, DecisionCache};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Expiry and size limits for [`InMemoryDecisionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_ms")]
    pub operation_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub url_ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            operation_ttl: Duration::from_secs(30),
            url_ttl: Duration::from_secs(5 * 60),
            max_entries: 10_000,
        }
    }
}

/// Counters returned by [`InMemoryDecisionCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits as a percentage of lookups; `0.0` before the first lookup.
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Entry {
    decision: Decision,
    expires_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Entry>,
    /// Insertion sequence number to key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Entries {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.by_key.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.by_key.remove(&key);
        Some(key)
    }
}

/// Process-local [`DecisionCache`] with TTL and oldest-first eviction.
#[derive(Debug)]
pub struct InMemoryDecisionCache {
    config: CacheConfig,
    entries: Mutex<Entries>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryDecisionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Entries::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Entry count and lookup counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.entries().by_key.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
        }
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        *self.entries() = Entries::default();
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .by_key
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired.len()
    }

    fn ttl(&self, key: &CacheKey) -> Duration {
        match key {
            CacheKey::Operation(_) => self.config.operation_ttl,
            CacheKey::Url(_) => self.config.url_ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryDecisionCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl DecisionCache for InMemoryDecisionCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Decision>, CollaboratorError> {
        let key = key.to_key_string();
        let now = Instant::now();
        let found = {
            let mut entries = self.entries();
            match entries.by_key.get(&key) {
                Some(entry) if entry.expires_at > now => Some(entry.decision.clone()),
                Some(_) => {
                    entries.remove(&key);
                    None
                }
                None => None,
            }
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn set(&self, key: &CacheKey, decision: &Decision) -> Result<(), CollaboratorError> {
        if self.config.max_entries == 0 {
            return Ok(());
        }
        let expires_at = Instant::now() + self.ttl(key);
        let key = key.to_key_string();
        let mut entries = self.entries();
        entries.remove(&key);
        while entries.by_key.len() >= self.config.max_entries {
            match entries.evict_oldest() {
                Some(evicted) => tracing::trace!(key = %evicted, "decision cache full; evicted oldest entry"),
                None => break,
            }
        }
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.order.insert(seq, key.clone());
        entries.by_key.insert(
            key,
            Entry {
                decision: decision.clone(),
                expires_at,
                seq,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gateway::DenialReason;
    use pretty_assertions::assert_eq;

    use super::*;

    fn op(fp: &str) -> CacheKey {
        CacheKey::Operation(fp.to_string())
    }

    fn url(u: &str) -> CacheKey {
        CacheKey::Url(u.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_by_kind() {
        let cache = InMemoryDecisionCache::default();
        cache.set(&op("a"), &Decision::Allow).await.unwrap();
        cache
            .set(&url("https://kalshi.com"), &Decision::Deny(DenialReason::RestrictedPath))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&op("a")).await.unwrap(), None);
        assert_eq!(
            cache.get(&url("https://kalshi.com")).await.unwrap(),
            Some(Decision::Deny(DenialReason::RestrictedPath))
        );

        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(cache.get(&url("https://kalshi.com")).await.unwrap(), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_and_url_keys_do_not_collide() {
        let cache = InMemoryDecisionCache::default();
        cache.set(&op("x"), &Decision::Allow).await.unwrap();
        assert_eq!(cache.get(&url("x")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entry_is_evicted_when_full() {
        let cache = InMemoryDecisionCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        cache.set(&op("1"), &Decision::Allow).await.unwrap();
        cache.set(&op("2"), &Decision::Allow).await.unwrap();
        // Rewriting a key refreshes its position.
        cache.set(&op("1"), &Decision::Allow).await.unwrap();
        cache.set(&op("3"), &Decision::Allow).await.unwrap();

        assert_eq!(cache.get(&op("2")).await.unwrap(), None);
        assert!(cache.get(&op("1")).await.unwrap().is_some());
        assert!(cache.get(&op("3")).await.unwrap().is_some());
        assert_eq!(cache.stats().entries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_hits_and_misses() {
        let cache = InMemoryDecisionCache::default();
        assert_eq!(cache.stats().hit_rate, 0.0);
        cache.get(&op("a")).await.unwrap();
        cache.set(&op("a"), &Decision::Allow).await.unwrap();
        cache.get(&op("a")).await.unwrap();
        cache.get(&op("a")).await.unwrap();
        cache.get(&op("b")).await.unwrap();

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 2));
        assert_eq!(stats.hit_rate, 50.0);

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let cache = InMemoryDecisionCache::default();
        cache.set(&op("short"), &Decision::Allow).await.unwrap();
        cache.set(&url("long"), &Decision::Allow).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }
}
