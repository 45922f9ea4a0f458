//! The service object: every component wired once from [`Settings`] and
//! handed to consumers by reference.

use std::{collections::HashSet, fs, sync::Arc};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    cache_meta::CacheMetaStore,
    clock::{self, SharedClock},
    config::Settings,
    error::SyncResult,
    event::{Address, KIND_PAYOUT, KIND_PLEDGE, KIND_PROFILE, KIND_REPUTATION},
    filter::Filter,
    loaders::{self, Loader},
    pool::RelayPool,
    profile_cache::ProfileCache,
    projection::{tally_votes, Profile, VoteTally},
    rate_limit::RateLimiter,
    reputation::{derive_reputation, ReputationScore},
    store::EventStore,
    transport::{Transport, WsTransport},
};

pub struct Services {
    pub settings: Settings,
    pub clock: SharedClock,
    pub store: EventStore,
    pub cache_meta: CacheMetaStore,
    pub limiter: RateLimiter,
    pub pool: RelayPool,
    pub loader: Loader,
    pub profiles: ProfileCache,
    profile_feed: Option<JoinHandle<()>>,
}

impl Services {
    /// Wire everything over WebSocket relays with the system clock.
    pub fn new(settings: Settings) -> SyncResult<Self> {
        let transport = Arc::new(WsTransport::new(
            settings.tor_socks.clone(),
            settings.connect_timeout,
        ));
        Self::with_transport(settings, transport, clock::system())
    }

    pub fn with_transport(
        settings: Settings,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> SyncResult<Self> {
        fs::create_dir_all(&settings.cache_dir)?;
        let store = if settings.journal {
            EventStore::with_journal(settings.journal_path())
        } else {
            EventStore::new()
        };
        let cache_meta = CacheMetaStore::open(settings.cache_meta_path(), clock.clone());
        let limiter = RateLimiter::new(settings.cooldowns, clock.clone());
        let pool = RelayPool::new(
            settings.default_relays().to_vec(),
            transport,
            store.clone(),
            limiter.clone(),
        );
        let loader = Loader::new(pool.clone(), cache_meta.clone());
        let profiles = ProfileCache::new(settings.profile_cache_capacity, clock.clone())
            .with_fetcher(Arc::new(pool.clone()));
        let profile_feed = spawn_profile_feed(&store, &profiles);
        info!(
            relays = settings.relays.len(),
            events = store.len(),
            cache_dir = %settings.cache_dir.display(),
            "services ready"
        );
        Ok(Self {
            settings,
            clock,
            store,
            cache_meta,
            limiter,
            pool,
            loader,
            profiles,
            profile_feed,
        })
    }

    /// Derive `actor`'s reputation from what the store holds right now.
    pub fn reputation(&self, actor: &str) -> ReputationScore {
        let payouts = self.store.query(&Filter::new().kind(KIND_PAYOUT));
        let reputation = self
            .store
            .query(&Filter::new().kind(KIND_REPUTATION).tag("p", [actor]));
        let pledges = self
            .store
            .query(&Filter::new().kind(KIND_PLEDGE).author(actor));
        derive_reputation(actor, &payouts, &reputation, &pledges)
    }

    /// Vote counts per solution on the task at `address`.
    pub fn vote_tally(&self, address: &Address) -> VoteTally {
        let plan = loaders::votes_for(address);
        tally_votes(&self.loader.local(&plan))
    }

    /// Stop background work. Cache metadata is written on every update, so
    /// nothing is lost here.
    pub fn shutdown(mut self) {
        if let Some(task) = self.profile_feed.take() {
            task.abort();
        }
        self.limiter.reset();
        debug!("services shut down");
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        if let Some(task) = self.profile_feed.take() {
            task.abort();
        }
    }
}

/// Keep the profile cache in step with profile events entering the store.
/// Without a runtime there is nothing to drive it, and the cache relies on
/// its own fetches.
fn spawn_profile_feed(store: &EventStore, profiles: &ProfileCache) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let mut live = store.current_timeline(Filter::new().kind(KIND_PROFILE));
    let profiles = profiles.clone();
    Some(handle.spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = live.get();
        loop {
            for ev in &current {
                if seen.insert(ev.id.clone()) {
                    profiles.insert(&ev.pubkey, Profile::from_event(ev));
                }
            }
            match live.changed().await {
                Some(next) => current = next,
                None => break,
            }
        }
    }))
}
