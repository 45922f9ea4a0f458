//! Domain queries translated into relay filters, and the loader that decides
//! whether the network needs asking at all.

use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    cache_meta::{fingerprint, fingerprint_json, CacheMetaStore, FreshnessClass},
    error::SyncError,
    event::{
        Address, Event, KIND_PAYOUT, KIND_PLEDGE, KIND_PROFILE, KIND_REPUTATION, KIND_SOLUTION,
        KIND_TASK, KIND_VOTE,
    },
    filter::Filter,
    live::Live,
    pool::RelayPool,
};

/// Filters that answer one domain query, and how long an answer stays fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub filters: Vec<Filter>,
    pub class: FreshnessClass,
}

impl Plan {
    fn single(filter: Filter, class: FreshnessClass) -> Self {
        Self {
            filters: vec![filter],
            class,
        }
    }

    /// Digest under which the plan's fetches are recorded.
    pub fn fingerprint(&self) -> String {
        match self.filters.as_slice() {
            [one] => fingerprint(one),
            many => fingerprint_json(&Value::Array(
                many.iter().map(|f| Value::Object(f.to_json())).collect(),
            )),
        }
    }
}

/// Most recent tasks.
pub fn task_list(limit: usize) -> Plan {
    Plan::single(Filter::new().kind(KIND_TASK).limit(limit), FreshnessClass::List)
}

/// One task by its address.
pub fn task_by_address(address: &Address) -> Plan {
    let filter = Filter::new()
        .kind(address.kind())
        .author(address.author())
        .tag("d", [address.d_tag()]);
    Plan::single(filter, FreshnessClass::Detail)
}

fn referencing(kind: u32, address: &Address) -> Plan {
    let filter = Filter::new().kind(kind).tag("a", [address.to_string()]);
    Plan::single(filter, FreshnessClass::Dependent)
}

pub fn pledges_for(address: &Address) -> Plan {
    referencing(KIND_PLEDGE, address)
}

pub fn solutions_for(address: &Address) -> Plan {
    referencing(KIND_SOLUTION, address)
}

pub fn votes_for(address: &Address) -> Plan {
    referencing(KIND_VOTE, address)
}

pub fn payouts_for(address: &Address) -> Plan {
    referencing(KIND_PAYOUT, address)
}

/// Profiles of `authors`. Duplicates are dropped and the order is normalized
/// so that the same set always yields the same fingerprint.
pub fn profiles<I, S>(authors: I) -> Plan
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut authors: Vec<String> = authors.into_iter().map(Into::into).collect();
    authors.sort();
    authors.dedup();
    Plan::single(Filter::new().kind(KIND_PROFILE).authors(authors), FreshnessClass::Profile)
}

/// Everything the reputation derivation reads about `actor` that a relay can
/// select directly. Payouts on the actor's own tasks need the task addresses
/// first; see [`Loader::load_reputation`].
pub fn reputation_inputs(actor: &str) -> Plan {
    Plan {
        filters: vec![
            Filter::new().kinds([KIND_PAYOUT, KIND_PLEDGE, KIND_TASK]).author(actor),
            Filter::new().kind(KIND_PAYOUT).tag("p", [actor]),
            Filter::new().kind(KIND_REPUTATION).tag("p", [actor]),
        ],
        class: FreshnessClass::Dependent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Answered recently; the network was not asked.
    Fresh,
    Fetched { admitted: usize, results: usize },
}

/// Runs plans against the pool, consulting the fetch bookkeeping first.
#[derive(Clone)]
pub struct Loader {
    pool: RelayPool,
    meta: CacheMetaStore,
}

impl Loader {
    pub fn new(pool: RelayPool, meta: CacheMetaStore) -> Self {
        Self { pool, meta }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Fetch `plan` unless it was answered within its freshness window.
    pub async fn load(&self, plan: &Plan) -> Result<LoadOutcome, SyncError> {
        let digest = plan.fingerprint();
        if self.meta.is_fresh(&digest, plan.class.threshold_ms()) {
            debug!(%digest, "fresh, skipping network");
            return Ok(LoadOutcome::Fresh);
        }
        self.refresh(plan).await
    }

    /// Fetch `plan` regardless of freshness.
    pub async fn refresh(&self, plan: &Plan) -> Result<LoadOutcome, SyncError> {
        let digest = plan.fingerprint();
        let admitted: usize = try_join_all(plan.filters.iter().map(|f| self.pool.fetch(f)))
            .await?
            .into_iter()
            .sum();
        let results = self.local(plan).len();
        self.meta.record_fetch(&digest, results as u64);
        debug!(%digest, admitted, results, "fetched");
        Ok(LoadOutcome::Fetched { admitted, results })
    }

    /// Store contents answering `plan`, newest first, without touching the network.
    pub fn local(&self, plan: &Plan) -> Vec<Event> {
        let store = self.pool.store();
        let mut out: Vec<Event> = Vec::new();
        for filter in &plan.filters {
            for ev in store.query(filter) {
                if !out.iter().any(|e| e.id == ev.id) {
                    out.push(ev);
                }
            }
        }
        out
    }

    /// Live view of the plan's first filter, collapsed to current versions,
    /// with a background load if the answer is stale. Must be called inside a
    /// runtime.
    pub fn view(&self, plan: &Plan) -> Live<Vec<Event>> {
        let filter = plan.filters.first().cloned().unwrap_or_default();
        let live = self.pool.store().current_timeline(filter);
        let loader = self.clone();
        let plan = plan.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.load(&plan).await {
                warn!(digest = %plan.fingerprint(), "background load failed: {e}");
            }
        });
        live
    }

    /// Reputation inputs for `actor`, including payouts on the actor's tasks.
    pub async fn load_reputation(&self, actor: &str) -> Result<LoadOutcome, SyncError> {
        let first = self.load(&reputation_inputs(actor)).await?;
        let addresses: Vec<String> = self
            .pool
            .store()
            .query(&Filter::new().kind(KIND_TASK).author(actor))
            .iter()
            .filter_map(|ev| ev.address().map(|a| a.to_string()))
            .collect();
        if addresses.is_empty() {
            return Ok(first);
        }
        let payouts = Plan::single(
            Filter::new().kind(KIND_PAYOUT).tag("a", addresses),
            FreshnessClass::Dependent,
        );
        self.load(&payouts).await
    }
}
