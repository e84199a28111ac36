// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Instance cache with positive and negative entries.
//!
//! [`CacheReader`] is cloned into every task on the lookup path and only
//! takes the read lock. [`CacheWriter`] is not `Clone` and lives in the cache
//! owner task, so there is exactly one writer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::Instance;
use crate::constants;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheOptions {
    /// How long a found instance is trusted
    pub ttl: Duration,
    /// How long a failed or empty lookup is trusted
    pub negative_ttl: Duration,
    /// Period of the refresh/eviction sweep
    pub refresh_period: Duration,
    /// Entries not read for this long are dropped regardless of TTL
    pub evict_after_idle: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: constants::DEFAULT_CACHE_TTL,
            negative_ttl: constants::DEFAULT_CACHE_NEGATIVE_TTL,
            refresh_period: constants::DEFAULT_CACHE_REFRESH_PERIOD,
            evict_after_idle: constants::DEFAULT_CACHE_EVICT_AFTER_IDLE,
        }
    }
}

/// What a lookup said about one address.
#[derive(Clone, Debug, PartialEq)]
pub enum LookupOutcome {
    Found(Instance),
    NotFound,
    Failed,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub lookups: AtomicU64,
    pub lookup_errors: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug)]
struct InstanceHolder {
    /// `None` is a negative entry
    instance: Option<Arc<Instance>>,
    expires_at: Instant,
    /// Nanoseconds since the cache epoch
    last_access: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    entries: RwLock<HashMap<IpAddr, InstanceHolder>>,
    epoch: Instant,
    stats: Arc<CacheStats>,
}

impl Shared {
    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    fn peek(&self, ip: IpAddr) -> Option<Option<Arc<Instance>>> {
        let now = self.nanos_since_epoch(Instant::now());
        #[allow(clippy::expect_used)]
        let entries = self.entries.read().expect("lock poisoned");
        entries.get(&ip).map(|holder| {
            holder.last_access.store(now, Ordering::Relaxed);
            holder.instance.clone()
        })
    }
}

/// Creates an empty cache and returns its two halves.
#[must_use]
pub fn new_cache(stats: Arc<CacheStats>) -> (CacheReader, CacheWriter) {
    let shared = Arc::new(Shared {
        entries: RwLock::new(HashMap::new()),
        epoch: Instant::now(),
        stats,
    });
    (
        CacheReader {
            shared: Arc::clone(&shared),
        },
        CacheWriter { shared },
    )
}

#[derive(Clone, Debug)]
pub struct CacheReader {
    shared: Arc<Shared>,
}

impl CacheReader {
    /// `None` on a miss; `Some(None)` for a cached negative entry.
    #[must_use]
    pub fn get(&self, ip: IpAddr) -> Option<Option<Arc<Instance>>> {
        let found = self.shared.peek(ip);
        let counter = if found.is_some() {
            &self.shared.stats.hits
        } else {
            &self.shared.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.shared.entries.read().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.shared.stats
    }
}

#[derive(Debug)]
pub struct CacheWriter {
    shared: Arc<Shared>,
}

impl CacheWriter {
    /// Same as [`CacheReader::get`] but without touching hit/miss counters.
    #[must_use]
    pub fn peek(&self, ip: IpAddr) -> Option<Option<Arc<Instance>>> {
        self.shared.peek(ip)
    }

    /// Records the outcome of a lookup.
    ///
    /// A failed refresh of a positive entry keeps the known instance and
    /// retries after the negative TTL.
    pub fn apply(&mut self, ip: IpAddr, outcome: LookupOutcome, options: &CacheOptions) {
        self.store(ip, outcome, options, true);
    }

    /// Records the outcome of a background refresh. An entry evicted while
    /// its refresh was in flight stays evicted.
    pub fn apply_refresh(
        &mut self,
        ip: IpAddr,
        outcome: LookupOutcome,
        options: &CacheOptions,
    ) {
        self.store(ip, outcome, options, false);
    }

    fn store(
        &mut self,
        ip: IpAddr,
        outcome: LookupOutcome,
        options: &CacheOptions,
        insert: bool,
    ) {
        let now = Instant::now();
        let access = self.shared.nanos_since_epoch(now);
        #[allow(clippy::expect_used)]
        let mut entries = self.shared.entries.write().expect("lock poisoned");

        let (instance, ttl) = match outcome {
            LookupOutcome::Found(instance) => (Some(Arc::new(instance)), options.ttl),
            LookupOutcome::NotFound => (None, options.negative_ttl),
            LookupOutcome::Failed => (
                entries.get(&ip).and_then(|holder| holder.instance.clone()),
                options.negative_ttl,
            ),
        };

        match entries.get_mut(&ip) {
            Some(holder) => {
                holder.instance = instance;
                holder.expires_at = now + ttl;
            }
            None if insert => {
                entries.insert(
                    ip,
                    InstanceHolder {
                        instance,
                        expires_at: now + ttl,
                        last_access: AtomicU64::new(access),
                    },
                );
            }
            None => {}
        }
    }

    /// Evicts entries idle for longer than `evict_after_idle` and returns the
    /// expired survivors, which need a refresh.
    pub fn sweep(&mut self, evict_after_idle: Duration) -> Vec<IpAddr> {
        let now = Instant::now();
        let now_nanos = self.shared.nanos_since_epoch(now);
        let idle_nanos = u64::try_from(evict_after_idle.as_nanos()).unwrap_or(u64::MAX);
        let mut refresh = Vec::new();
        let mut evicted = 0;

        #[allow(clippy::expect_used)]
        let mut entries = self.shared.entries.write().expect("lock poisoned");
        entries.retain(|ip, holder| {
            let last_access = holder.last_access.load(Ordering::Relaxed);
            if now_nanos.saturating_sub(last_access) > idle_nanos {
                evicted += 1;
                return false;
            }
            if holder.expires_at <= now {
                refresh.push(*ip);
            }
            true
        });
        self.shared
            .stats
            .evictions
            .fetch_add(evicted, Ordering::Relaxed);
        refresh
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metric::Tags;

    fn options() -> CacheOptions {
        CacheOptions {
            ttl: Duration::from_secs(100),
            negative_ttl: Duration::from_secs(10),
            refresh_period: Duration::from_secs(5),
            evict_after_idle: Duration::from_secs(1000),
        }
    }

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            tags: Tags::parse("region:us-east-1"),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_entry_lives_for_ttl() {
        let (reader, mut writer) = new_cache(Arc::default());
        let opts = options();
        assert_eq!(reader.get(ip("10.0.0.1")), None);

        writer.apply(ip("10.0.0.1"), LookupOutcome::Found(instance("i-1")), &opts);
        let hit = reader.get(ip("10.0.0.1")).unwrap().unwrap();
        assert_eq!(hit.id, "i-1");

        tokio::time::advance(Duration::from_secs(99)).await;
        assert!(writer.sweep(opts.evict_after_idle).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(writer.sweep(opts.evict_after_idle), vec![ip("10.0.0.1")]);
        // still served while the refresh is in flight
        assert!(reader.get(ip("10.0.0.1")).unwrap().is_some());

        assert_eq!(reader.stats().hits.load(Ordering::Relaxed), 2);
        assert_eq!(reader.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_entry_lives_for_negative_ttl() {
        let (reader, mut writer) = new_cache(Arc::default());
        let opts = options();
        writer.apply(ip("10.0.0.2"), LookupOutcome::NotFound, &opts);
        assert_eq!(reader.get(ip("10.0.0.2")), Some(None));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(writer.sweep(opts.evict_after_idle).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(writer.sweep(opts.evict_after_idle), vec![ip("10.0.0.2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_are_evicted_regardless_of_ttl() {
        let (reader, mut writer) = new_cache(Arc::default());
        let opts = CacheOptions {
            evict_after_idle: Duration::from_secs(30),
            ..options()
        };
        writer.apply(ip("10.0.0.3"), LookupOutcome::Found(instance("i-3")), &opts);
        writer.apply(ip("10.0.0.4"), LookupOutcome::Found(instance("i-4")), &opts);

        tokio::time::advance(Duration::from_secs(20)).await;
        let _ = reader.get(ip("10.0.0.4"));
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(writer.sweep(opts.evict_after_idle).is_empty());
        assert_eq!(reader.get(ip("10.0.0.3")), None);
        assert!(reader.get(ip("10.0.0.4")).is_some());
        assert_eq!(reader.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_known_instance() {
        let (reader, mut writer) = new_cache(Arc::default());
        let opts = options();
        writer.apply(ip("10.0.0.5"), LookupOutcome::Found(instance("i-5")), &opts);
        writer.apply(ip("10.0.0.5"), LookupOutcome::Failed, &opts);
        assert_eq!(reader.get(ip("10.0.0.5")).unwrap().unwrap().id, "i-5");

        // retried after the negative TTL, not the full TTL
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(writer.sweep(opts.evict_after_idle), vec![ip("10.0.0.5")]);

        writer.apply(ip("10.0.0.6"), LookupOutcome::Failed, &opts);
        assert_eq!(reader.get(ip("10.0.0.6")), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_does_not_revive_evicted_entries() {
        let (reader, mut writer) = new_cache(Arc::default());
        let opts = CacheOptions {
            evict_after_idle: Duration::from_secs(30),
            ..options()
        };
        writer.apply(ip("10.0.0.7"), LookupOutcome::Found(instance("i-7")), &opts);
        writer.apply(ip("10.0.0.8"), LookupOutcome::Found(instance("i-8")), &opts);
        let _ = reader.get(ip("10.0.0.8"));

        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = reader.get(ip("10.0.0.8"));
        assert!(writer.sweep(opts.evict_after_idle).is_empty());

        writer.apply_refresh(ip("10.0.0.7"), LookupOutcome::Found(instance("i-7b")), &opts);
        writer.apply_refresh(ip("10.0.0.8"), LookupOutcome::Found(instance("i-8b")), &opts);
        assert_eq!(writer.peek(ip("10.0.0.7")), None);
        assert_eq!(reader.get(ip("10.0.0.8")).unwrap().unwrap().id, "i-8b");
        assert_eq!(reader.len(), 1);
    }
}
