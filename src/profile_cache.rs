//! Bounded LRU of profile projections with stale-while-revalidate reads.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    cache_meta::PROFILE_MS, clock::SharedClock, error::SyncError, projection::Profile,
};

pub const DEFAULT_CAPACITY: usize = 500;

/// Source of profiles for cache misses and revalidation.
pub trait ProfileFetcher: Send + Sync + 'static {
    /// Fetch the current profile of each key. Keys with no profile are omitted.
    fn fetch_profiles(&self, pubkeys: Vec<String>) -> BoxFuture<'static, Result<Vec<Profile>, SyncError>>;
}

struct Entry {
    profile: Profile,
    fetched_at: u64,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Recency order, oldest first.
    order: BTreeMap<u64, String>,
    tick: u64,
    in_flight: HashSet<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }
}

#[derive(Clone)]
pub struct ProfileCache {
    inner: Arc<Mutex<Inner>>,
    fetcher: Option<Arc<dyn ProfileFetcher>>,
    clock: SharedClock,
    capacity: usize,
}

impl ProfileCache {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fetcher: None,
            clock,
            capacity: capacity.max(1),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ProfileFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `pubkey` is cached. Does not affect recency.
    pub fn contains(&self, pubkey: &str) -> bool {
        self.inner.lock().entries.contains_key(pubkey)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Cached profile, if any. A miss schedules a background fetch; a stale
    /// hit is returned as is and schedules a revalidation.
    pub fn get(&self, pubkey: &str) -> Option<Profile> {
        let now = self.clock.now_ms();
        let (hit, needs_fetch) = {
            let mut inner = self.inner.lock();
            match inner.entries.get(pubkey) {
                Some(entry) => {
                    let stale = now.saturating_sub(entry.fetched_at) >= PROFILE_MS;
                    let profile = entry.profile.clone();
                    inner.touch(pubkey);
                    (Some(profile), stale)
                }
                None => (None, true),
            }
        };
        if needs_fetch {
            self.schedule(vec![pubkey.to_string()]);
        }
        hit
    }

    /// Cached profiles for `pubkeys`. Every missing or stale key goes out in a
    /// single background fetch.
    pub fn get_batch<I, S>(&self, pubkeys: I) -> HashMap<String, Profile>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = self.clock.now_ms();
        let mut found = HashMap::new();
        let mut to_fetch = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut seen = HashSet::new();
            for key in pubkeys {
                let key = key.as_ref();
                if !seen.insert(key.to_string()) {
                    continue;
                }
                match inner.entries.get(key) {
                    Some(entry) => {
                        if now.saturating_sub(entry.fetched_at) >= PROFILE_MS {
                            to_fetch.push(key.to_string());
                        }
                        found.insert(key.to_string(), entry.profile.clone());
                        inner.touch(key);
                    }
                    None => to_fetch.push(key.to_string()),
                }
            }
        }
        if !to_fetch.is_empty() {
            self.schedule(to_fetch);
        }
        found
    }

    /// Store `profile` under `pubkey`, evicting the least recently used entry
    /// when full. An older profile never replaces a newer one, but the entry
    /// still counts as freshly fetched.
    pub fn insert(&self, pubkey: &str, profile: Profile) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(pubkey) {
            if profile.created_at >= entry.profile.created_at {
                entry.profile = profile;
            }
            entry.fetched_at = now;
            inner.touch(pubkey);
            return;
        }
        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!(pubkey = %oldest, "profile evicted");
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, pubkey.to_string());
        inner.entries.insert(
            pubkey.to_string(),
            Entry {
                profile,
                fetched_at: now,
                tick,
            },
        );
    }

    fn schedule(&self, keys: Vec<String>) {
        let Some(fetcher) = self.fetcher.clone() else {
            return;
        };
        let keys: Vec<String> = {
            let mut inner = self.inner.lock();
            keys.into_iter()
                .filter(|k| inner.in_flight.insert(k.clone()))
                .collect()
        };
        if keys.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, profile fetch skipped");
            self.release(&keys);
            return;
        };
        let fut = fetcher.fetch_profiles(keys.clone());
        let cache = self.clone();
        handle.spawn(async move {
            match fut.await {
                Ok(profiles) => {
                    for profile in profiles {
                        let key = profile.pubkey.clone();
                        cache.insert(&key, profile);
                    }
                }
                Err(e) => warn!(count = keys.len(), "profile fetch failed: {e}"),
            }
            cache.release(&keys);
        });
    }

    fn release(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for k in keys {
            inner.in_flight.remove(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    fn profile(pubkey: &str, created_at: u64, name: &str) -> Profile {
        Profile {
            pubkey: pubkey.into(),
            created_at,
            name: Some(name.into()),
            ..Profile::default()
        }
    }

    #[derive(Default)]
    struct Gate {
        calls: AtomicUsize,
        requested: Mutex<Vec<Vec<String>>>,
        release: Notify,
    }

    struct GatedFetcher(Arc<Gate>);

    impl ProfileFetcher for GatedFetcher {
        fn fetch_profiles(
            &self,
            pubkeys: Vec<String>,
        ) -> BoxFuture<'static, Result<Vec<Profile>, SyncError>> {
            let gate = self.0.clone();
            gate.calls.fetch_add(1, Ordering::SeqCst);
            gate.requested.lock().push(pubkeys.clone());
            Box::pin(async move {
                gate.release.notified().await;
                Ok(pubkeys.iter().map(|k| profile(k, 10, "fetched")).collect())
            })
        }
    }

    fn gated(clock: &ManualClock) -> (Arc<Gate>, ProfileCache) {
        let gate = Arc::new(Gate::default());
        let cache = ProfileCache::new(DEFAULT_CAPACITY, Arc::new(clock.clone()))
            .with_fetcher(Arc::new(GatedFetcher(gate.clone())));
        (gate, cache)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn evicts_exactly_the_least_recently_used() {
        let clock = ManualClock::new(0);
        let cache = ProfileCache::new(DEFAULT_CAPACITY, Arc::new(clock));
        for i in 0..500 {
            cache.insert(&format!("pk{i}"), profile(&format!("pk{i}"), 1, "x"));
        }
        assert_eq!(cache.len(), 500);
        // refresh the oldest so pk1 becomes the eviction candidate
        assert!(cache.get("pk0").is_some());
        cache.insert("pk500", profile("pk500", 1, "x"));
        assert_eq!(cache.len(), 500);
        assert!(cache.contains("pk0"));
        assert!(!cache.contains("pk1"));
        assert!(cache.contains("pk2"));
        assert!(cache.contains("pk500"));
    }

    #[test]
    fn older_profile_does_not_replace_newer() {
        let cache = ProfileCache::new(4, Arc::new(ManualClock::new(0)));
        cache.insert("a", profile("a", 20, "new"));
        cache.insert("a", profile("a", 10, "old"));
        assert_eq!(cache.get("a").unwrap().name.as_deref(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn miss_without_runtime_is_harmless() {
        let clock = ManualClock::new(0);
        let (gate, cache) = gated(&clock);
        assert!(cache.get("a").is_none());
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn miss_fetches_once_while_in_flight() {
        let clock = ManualClock::new(0);
        let (gate, cache) = gated(&clock);
        assert!(cache.get("a").is_none());
        assert!(cache.get("a").is_none());
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 1);

        gate.release.notify_one();
        wait_until(|| cache.contains("a") && cache.in_flight() == 0).await;
        assert_eq!(cache.get("a").unwrap().name.as_deref(), Some("fetched"));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_hit_is_served_and_revalidated() {
        let clock = ManualClock::new(0);
        let (gate, cache) = gated(&clock);
        cache.insert("a", profile("a", 1, "cached"));
        assert_eq!(cache.get("a").unwrap().name.as_deref(), Some("cached"));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);

        clock.advance(PROFILE_MS + 1);
        assert_eq!(cache.get("a").unwrap().name.as_deref(), Some("cached"));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        gate.release.notify_one();
        wait_until(|| cache.in_flight() == 0).await;
        assert_eq!(cache.get("a").unwrap().name.as_deref(), Some("fetched"));
    }

    #[tokio::test]
    async fn entry_goes_stale_exactly_at_the_threshold() {
        let clock = ManualClock::new(0);
        let (gate, cache) = gated(&clock);
        cache.insert("a", profile("a", 1, "cached"));
        clock.advance(PROFILE_MS - 1);
        assert!(cache.get("a").is_some());
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
        clock.advance(1);
        assert!(cache.get("a").is_some());
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_issues_one_fetch_for_missing_and_stale() {
        let clock = ManualClock::new(0);
        let (gate, cache) = gated(&clock);
        cache.insert("stale", profile("stale", 1, "s"));
        clock.advance(PROFILE_MS + 1);
        cache.insert("fresh", profile("fresh", 1, "f"));

        let found = cache.get_batch(["fresh", "stale", "b", "c", "b"]);
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("fresh") && found.contains_key("stale"));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            gate.requested.lock()[0],
            vec!["stale".to_string(), "b".into(), "c".into()]
        );

        // keys already in flight are not requested again
        cache.get_batch(["b", "c"]);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        gate.release.notify_one();
        wait_until(|| cache.in_flight() == 0).await;
        assert_eq!(cache.len(), 4);
    }
}
