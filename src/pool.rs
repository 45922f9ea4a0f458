//! Fan-out over the configured relays.
//!
//! Every relay is handled by its own task. A relay that cannot be reached or
//! misbehaves is logged and skipped; the others carry on. Deliveries go
//! straight into the [`EventStore`], which validates and deduplicates.

use std::{sync::Arc, time::Duration};

use futures_util::{
    future::{join_all, BoxFuture},
    StreamExt,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    event::{Event, KIND_PROFILE},
    filter::Filter,
    profile_cache::ProfileFetcher,
    projection::Profile,
    rate_limit::RateLimiter,
    store::EventStore,
    transport::{Delivery, Transport},
    validator::Validator,
};

/// How long a one-shot fetch waits on a relay that stops sending before EOSE.
pub const DEFAULT_FETCH_IDLE: Duration = Duration::from_secs(15);

/// A single relay subscription feeding the store.
pub struct SubscriptionHandle {
    relay: String,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery and drop the connection. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(relay = %self.relay, "unsubscribed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// One subscription per relay, torn down together.
#[derive(Default)]
pub struct CompositeSubscription {
    children: Vec<SubscriptionHandle>,
}

impl CompositeSubscription {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of children still running.
    pub fn active(&self) -> usize {
        self.children.iter().filter(|c| c.is_active()).count()
    }

    /// Stop every child. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        for child in &mut self.children {
            child.unsubscribe();
        }
    }
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum RelayOutcome {
    Accepted,
    Rejected,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub event_id: String,
    pub relays: Vec<(String, RelayOutcome)>,
}

impl PublishReport {
    pub fn accepted(&self) -> usize {
        self.relays
            .iter()
            .filter(|(_, o)| *o == RelayOutcome::Accepted)
            .count()
    }
}

#[derive(Clone)]
pub struct RelayPool {
    relays: Arc<Vec<String>>,
    transport: Arc<dyn Transport>,
    store: EventStore,
    limiter: RateLimiter,
    validator: Validator,
    fetch_idle: Duration,
}

impl RelayPool {
    pub fn new(
        relays: Vec<String>,
        transport: Arc<dyn Transport>,
        store: EventStore,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            relays: Arc::new(relays),
            transport,
            store,
            limiter,
            validator: Validator::new(),
            fetch_idle: DEFAULT_FETCH_IDLE,
        }
    }

    pub fn with_fetch_idle(mut self, idle: Duration) -> Self {
        self.fetch_idle = idle;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Keep feeding `relay`'s answers to `filter` into the store until the
    /// handle is unsubscribed or dropped. Must be called inside a runtime.
    pub fn subscribe(&self, relay: &str, filter: &Filter) -> SubscriptionHandle {
        let transport = self.transport.clone();
        let store = self.store.clone();
        let relay_owned = relay.to_string();
        let filter = filter.clone();
        let task = tokio::spawn(async move {
            let relay = relay_owned;
            let mut stream = match transport.subscribe(&relay, &filter).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%relay, "subscribe failed: {e}");
                    return;
                }
            };
            let mut admitted = 0usize;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Delivery::Event(ev)) => {
                        if store.add(ev) {
                            admitted += 1;
                        }
                    }
                    Ok(Delivery::EndOfStored) => debug!(%relay, admitted, "caught up"),
                    Err(e) => {
                        warn!(%relay, "subscription error: {e}");
                        break;
                    }
                }
            }
            debug!(%relay, admitted, "subscription ended");
        });
        SubscriptionHandle {
            relay: relay.to_string(),
            task: Some(task),
        }
    }

    /// Subscribe to `filter` on every configured relay.
    pub fn subscribe_all(&self, filter: &Filter) -> CompositeSubscription {
        CompositeSubscription {
            children: self
                .relays
                .iter()
                .map(|relay| self.subscribe(relay, filter))
                .collect(),
        }
    }

    /// Query every relay once and wait until each has sent its stored events.
    /// Returns the number of events newly admitted to the store.
    pub async fn fetch(&self, filter: &Filter) -> Result<usize, SyncError> {
        if self.relays.is_empty() {
            return Err(SyncError::NoRelaysConfigured);
        }
        let results = join_all(self.relays.iter().map(|relay| self.fetch_one(relay, filter))).await;
        let reachable = results.iter().filter(|r| r.is_some()).count();
        if reachable == 0 {
            return Err(SyncError::NoReachableSources);
        }
        let admitted: usize = results.into_iter().flatten().sum();
        info!(reachable, total = self.relays.len(), admitted, "fetch complete");
        Ok(admitted)
    }

    /// `None` if the relay could not be reached.
    async fn fetch_one(&self, relay: &str, filter: &Filter) -> Option<usize> {
        let mut stream = match self.transport.subscribe(relay, filter).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%relay, "fetch failed: {e}");
                return None;
            }
        };
        let mut admitted = 0;
        loop {
            match tokio::time::timeout(self.fetch_idle, stream.next()).await {
                Ok(Some(Ok(Delivery::Event(ev)))) => {
                    if self.store.add(ev) {
                        admitted += 1;
                    }
                }
                Ok(Some(Ok(Delivery::EndOfStored))) | Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%relay, "fetch interrupted: {e}");
                    break;
                }
                Err(_) => {
                    warn!(%relay, "fetch idle, giving up on relay");
                    break;
                }
            }
        }
        Some(admitted)
    }

    /// Send a signed event to every relay. Succeeds if at least one relay
    /// accepted it, in which case the event is also added to the store.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport, SyncError> {
        self.validator.verify(event)?;
        let d_tag = event.identity().map(|i| i.d_tag);
        let check = self.limiter.can_publish(event.kind, d_tag.as_deref());
        if !check.allowed {
            return Err(SyncError::RateLimited {
                remaining_ms: check.remaining_ms,
            });
        }
        if self.relays.is_empty() {
            return Err(SyncError::NoRelaysConfigured);
        }

        let outcomes = join_all(self.relays.iter().map(|relay| async move {
            let outcome = match self.transport.publish(relay, event).await {
                Ok(true) => RelayOutcome::Accepted,
                Ok(false) => RelayOutcome::Rejected,
                Err(e) => {
                    warn!(%relay, "publish failed: {e}");
                    RelayOutcome::Failed(e.to_string())
                }
            };
            (relay.clone(), outcome)
        }))
        .await;
        let report = PublishReport {
            event_id: event.id.clone(),
            relays: outcomes,
        };

        if report.accepted() == 0 {
            let reached = report
                .relays
                .iter()
                .any(|(_, o)| !matches!(o, RelayOutcome::Failed(_)));
            return Err(if reached {
                SyncError::PublishRejected
            } else {
                SyncError::NoReachableSources
            });
        }
        self.limiter.record_publish(event.kind, d_tag.as_deref());
        self.store.add(event.clone());
        info!(id = %event.id, accepted = report.accepted(), "published");
        Ok(report)
    }
}

impl ProfileFetcher for RelayPool {
    fn fetch_profiles(&self, pubkeys: Vec<String>) -> BoxFuture<'static, Result<Vec<Profile>, SyncError>> {
        let pool = self.clone();
        Box::pin(async move {
            let filter = Filter::new().kind(KIND_PROFILE).authors(pubkeys.iter().cloned());
            pool.fetch(&filter).await?;
            Ok(pubkeys
                .iter()
                .filter_map(|pk| pool.store.current(KIND_PROFILE, pk, ""))
                .map(|ev| Profile::from_event(&ev))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        event::{KIND_SOLUTION, KIND_TASK},
        rate_limit::Cooldowns,
        test_support::{signed, with_bad_sig, Script, ScriptedTransport, Signer},
        transport::{tests::spawn_mock_relay, WsTransport},
    };

    fn pool_with(transport: ScriptedTransport, relays: &[&str]) -> (Arc<ScriptedTransport>, RelayPool) {
        let transport = Arc::new(transport);
        let limiter = RateLimiter::new(Cooldowns::default(), Arc::new(ManualClock::new(0)));
        let pool = RelayPool::new(
            relays.iter().map(|r| r.to_string()).collect(),
            transport.clone(),
            EventStore::new(),
            limiter,
        )
        .with_fetch_idle(Duration::from_millis(200));
        (transport, pool)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn tasks(signer: &Signer, n: u64) -> Vec<Event> {
        (0..n)
            .map(|i| signed(signer, KIND_TASK, 100 + i, vec![vec!["d", format!("t{i}").as_str()]], ""))
            .collect()
    }

    #[tokio::test]
    async fn fetch_survives_failed_relays_and_drops_forgeries() {
        let signer = Signer::new(7);
        let mut delivered = tasks(&signer, 5);
        delivered.push(with_bad_sig(signed(&signer, KIND_TASK, 1, vec![vec!["d", "x"]], "")));
        delivered.push(with_bad_sig(signed(&signer, KIND_TASK, 2, vec![vec!["d", "y"]], "")));
        let transport = ScriptedTransport::default().with("wss://good", Script::Deliver(delivered));
        let (_, pool) = pool_with(transport, &["wss://down1", "wss://good", "wss://down2"]);

        let timeline = pool.store().timeline(Filter::new().kind(KIND_TASK));
        assert_eq!(pool.fetch(&Filter::new().kind(KIND_TASK)).await.unwrap(), 5);
        assert_eq!(timeline.get().len(), 5);
        assert_eq!(pool.store().len(), 5);
    }

    #[tokio::test]
    async fn subscribe_all_survives_failed_relays_and_drops_forgeries() {
        let signer = Signer::new(7);
        let mut delivered = tasks(&signer, 5);
        delivered.push(with_bad_sig(signed(&signer, KIND_TASK, 1, vec![vec!["d", "x"]], "")));
        delivered.push(with_bad_sig(signed(&signer, KIND_TASK, 2, vec![vec!["d", "y"]], "")));
        let transport = ScriptedTransport::default().with("wss://good", Script::Deliver(delivered));
        let (transport, pool) = pool_with(transport, &["wss://down1", "wss://good", "wss://down2"]);

        let timeline = pool.store().timeline(Filter::new().kind(KIND_TASK));
        let sub = pool.subscribe_all(&Filter::new().kind(KIND_TASK));
        assert_eq!(sub.len(), 3);
        // the reachable relay stays subscribed after its stored events
        wait_until(|| {
            transport.subscribes.load(std::sync::atomic::Ordering::SeqCst) == 3
                && sub.active() == 1
                && timeline.get().len() == 5
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(timeline.get().len(), 5);
        assert_eq!(pool.store().len(), 5);
    }

    #[tokio::test]
    async fn fetch_fails_only_when_nothing_is_reachable() {
        let (_, pool) = pool_with(ScriptedTransport::default(), &["wss://a", "wss://b"]);
        assert!(matches!(
            pool.fetch(&Filter::new()).await,
            Err(SyncError::NoReachableSources)
        ));

        let (_, empty) = pool_with(ScriptedTransport::default(), &[]);
        assert!(matches!(
            empty.fetch(&Filter::new()).await,
            Err(SyncError::NoRelaysConfigured)
        ));
    }

    #[tokio::test]
    async fn silent_relay_counts_as_reachable_after_idle() {
        let transport = ScriptedTransport::default().with("wss://quiet", Script::Silent);
        let (_, pool) = pool_with(transport, &["wss://quiet"]);
        assert_eq!(pool.fetch(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicates_across_relays_are_admitted_once() {
        let signer = Signer::new(8);
        let events = tasks(&signer, 3);
        let transport = ScriptedTransport::default()
            .with("wss://a", Script::Deliver(events.clone()))
            .with("wss://b", Script::Deliver(events));
        let (_, pool) = pool_with(transport, &["wss://a", "wss://b"]);
        assert_eq!(pool.fetch(&Filter::new()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn subscribe_all_feeds_live_views() {
        let signer = Signer::new(9);
        let (tx, script) = Script::channel();
        let transport = ScriptedTransport::default()
            .with("wss://live", script)
            .with("wss://stored", Script::Deliver(tasks(&signer, 2)));
        let (_, pool) = pool_with(transport, &["wss://live", "wss://stored", "wss://down"]);

        let mut timeline = pool.store().timeline(Filter::new().kind(KIND_SOLUTION));
        let sub = pool.subscribe_all(&Filter::new());
        assert_eq!(sub.len(), 3);

        let sol = signed(&signer, KIND_SOLUTION, 5, vec![vec!["a", "37300:x:y"]], "done");
        tx.send(Delivery::Event(sol.clone())).unwrap();
        let seen = timeline.changed().await.unwrap();
        assert_eq!(seen, vec![sol]);

        let store = pool.store().clone();
        wait_until(|| store.len() == 3).await;
    }

    #[tokio::test]
    async fn unsubscribe_before_connecting_is_safe() {
        let transport = ScriptedTransport::default().with("wss://quiet", Script::Silent);
        let (_, pool) = pool_with(transport, &["wss://quiet", "wss://down"]);
        let mut sub = pool.subscribe_all(&Filter::new());
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.active(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_releases_the_connection() {
        let (tx, script) = Script::channel();
        let transport = ScriptedTransport::default()
            .with("wss://live", script)
            .with("wss://quiet", Script::Silent);
        let (transport, pool) = pool_with(transport, &["wss://live", "wss://quiet"]);

        let mut sub = pool.subscribe_all(&Filter::new());
        wait_until(|| transport.subscribes.load(std::sync::atomic::Ordering::SeqCst) == 2).await;
        assert_eq!(sub.active(), 2);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.active(), 0);
        wait_until(|| tx.is_closed()).await;
    }

    #[tokio::test]
    async fn dropping_composite_tears_down_children() {
        let (tx, script) = Script::channel();
        let transport = ScriptedTransport::default().with("wss://live", script);
        let (transport, pool) = pool_with(transport, &["wss://live"]);
        let sub = pool.subscribe_all(&Filter::new());
        wait_until(|| transport.subscribes.load(std::sync::atomic::Ordering::SeqCst) == 1).await;
        drop(sub);
        wait_until(|| tx.is_closed()).await;
    }

    #[tokio::test]
    async fn publish_reports_per_relay_and_rate_limits() {
        let signer = Signer::new(10);
        let transport = ScriptedTransport::default()
            .with("wss://a", Script::Silent)
            .with("wss://b", Script::Silent);
        transport.reject.lock().insert("wss://b".into());
        let (transport, pool) = pool_with(transport, &["wss://a", "wss://b", "wss://down"]);

        let ev = signed(&signer, KIND_SOLUTION, 1, vec![vec!["a", "37300:x:y"]], "");
        let report = pool.publish(&ev).await.unwrap();
        assert_eq!(report.accepted(), 1);
        assert_eq!(report.relays[1], ("wss://b".to_string(), RelayOutcome::Rejected));
        assert!(matches!(report.relays[2].1, RelayOutcome::Failed(_)));
        assert!(pool.store().contains(&ev.id));
        assert_eq!(transport.published.lock().len(), 2);

        let again = signed(&signer, KIND_SOLUTION, 2, vec![vec!["a", "37300:x:y"]], "");
        assert!(matches!(
            pool.publish(&again).await,
            Err(SyncError::RateLimited { remaining_ms: 60_000 })
        ));
    }

    #[tokio::test]
    async fn publish_refuses_invalid_and_unacknowledged_events() {
        let signer = Signer::new(11);
        let transport = ScriptedTransport::default().with("wss://a", Script::Silent);
        transport.reject.lock().insert("wss://a".into());
        let (_, pool) = pool_with(transport, &["wss://a"]);

        let forged = with_bad_sig(signed(&signer, 1, 1, vec![], ""));
        assert!(matches!(pool.publish(&forged).await, Err(SyncError::Invalid(_))));

        let ev = signed(&signer, 1, 1, vec![], "");
        assert!(matches!(pool.publish(&ev).await, Err(SyncError::PublishRejected)));
        assert!(!pool.store().contains(&ev.id));
        // a refused publish does not start the cooldown
        assert!(matches!(pool.publish(&ev).await, Err(SyncError::PublishRejected)));
    }

    #[tokio::test]
    async fn pool_fetches_profiles_for_the_cache() {
        let alice = Signer::new(12);
        let profile = signed(&alice, KIND_PROFILE, 3, vec![], r#"{"name":"alice"}"#);
        let transport = ScriptedTransport::default().with("wss://a", Script::Deliver(vec![profile]));
        let (_, pool) = pool_with(transport, &["wss://a"]);
        let got = pool
            .fetch_profiles(vec![alice.pubkey.clone(), "unknown".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name.as_deref(), Some("alice"));
        assert_eq!(got[0].pubkey, alice.pubkey);
    }

    #[tokio::test]
    async fn fetch_over_websocket_relay() {
        let signer = Signer::new(13);
        let url = spawn_mock_relay(tasks(&signer, 4)).await;
        let pool = RelayPool::new(
            vec![url],
            Arc::new(WsTransport::default()),
            EventStore::new(),
            RateLimiter::new(Cooldowns::default(), crate::clock::system()),
        );
        assert_eq!(pool.fetch(&Filter::new().kind(KIND_TASK)).await.unwrap(), 4);
        let again = signed(&signer, 1, 9, vec![], "hello");
        assert_eq!(pool.publish(&again).await.unwrap().accepted(), 1);
    }
}
