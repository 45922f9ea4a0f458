//! In-memory materialized event store with live views.
//!
//! Every accepted event is kept for the lifetime of the store. Mutable
//! identities point at their current event; timelines are recomputed from the
//! author/kind indexes whenever a matching event is admitted.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    event::{Event, Identity},
    filter::Filter,
    live::Live,
    validator::Validator,
};

/// Shared handle to the store. Cloning is cheap.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Mutex<Inner>>,
    validator: Validator,
}

struct TimelineWatcher {
    filter: Filter,
    collapse: bool,
    tx: watch::Sender<Vec<Event>>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, Event>,
    by_author: HashMap<String, HashSet<String>>,
    by_kind: HashMap<u32, HashSet<String>>,
    current: HashMap<Identity, String>,
    current_watchers: HashMap<Identity, watch::Sender<Option<Event>>>,
    timelines: Vec<TimelineWatcher>,
    journal: Option<Journal>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create an empty store with no journal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            validator: Validator::new(),
        }
    }

    /// Create a store backed by a newline-delimited JSON journal at `path`.
    ///
    /// Existing journal entries are replayed through [`EventStore::add`], so
    /// they are validated again. Unreadable lines are skipped.
    pub fn with_journal(path: impl Into<PathBuf>) -> Self {
        let store = Self::new();
        let journal = Journal { path: path.into() };
        let mut replayed = 0usize;
        for ev in journal.load() {
            if store.add(ev) {
                replayed += 1;
            }
        }
        debug!(path = %journal.path.display(), replayed, "journal replayed");
        store.inner.lock().journal = Some(journal);
        store
    }

    /// Admit an event. Returns `true` only if it was valid and not yet known.
    pub fn add(&self, ev: Event) -> bool {
        if !self.validator.validate(&ev) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.events.contains_key(&ev.id) {
            return false;
        }
        inner
            .by_author
            .entry(ev.pubkey.clone())
            .or_default()
            .insert(ev.id.clone());
        inner
            .by_kind
            .entry(ev.kind)
            .or_default()
            .insert(ev.id.clone());
        inner.events.insert(ev.id.clone(), ev.clone());

        let mut replaced = false;
        let mut previous: Option<Event> = None;
        if let Some(identity) = ev.identity() {
            let cur = inner
                .current
                .get(&identity)
                .and_then(|id| inner.events.get(id))
                .cloned();
            let wins = match &cur {
                Some(cur) => supersedes(&ev, cur),
                None => true,
            };
            if wins {
                inner.current.insert(identity.clone(), ev.id.clone());
                replaced = true;
                previous = cur;
                if let Some(tx) = inner.current_watchers.get(&identity) {
                    tx.send_replace(Some(ev.clone()));
                }
            }
        }
        inner.current_watchers.retain(|_, tx| !tx.is_closed());

        inner.timelines.retain(|w| !w.tx.is_closed());
        let (events, timelines) = (&inner.events, &inner.timelines);
        for w in timelines.iter() {
            let affected = if w.collapse && ev.identity().is_some() {
                // A superseded version leaves collapsed timelines unchanged;
                // a replacement also drops the old version from them.
                replaced
                    && (w.filter.matches(&ev)
                        || previous.as_ref().is_some_and(|p| w.filter.matches(p)))
            } else {
                w.filter.matches(&ev)
            };
            if !affected {
                continue;
            }
            let view = query_locked(
                events,
                &inner.by_author,
                &inner.by_kind,
                &inner.current,
                &w.filter,
                w.collapse,
            );
            w.tx.send_replace(view);
        }

        if let Some(journal) = &inner.journal {
            journal.append(&ev);
        }
        true
    }

    /// Live view of the current event for a mutable identity.
    pub fn current_of(&self, kind: u32, author: &str, d_tag: &str) -> Live<Option<Event>> {
        let identity = Identity::new(kind, author, d_tag);
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.current_watchers.get(&identity) {
            return Live::new(tx.subscribe());
        }
        let present = current_locked(&inner, &identity);
        let (tx, rx) = watch::channel(present);
        inner.current_watchers.insert(identity, tx);
        Live::new(rx)
    }

    /// Live view of every admitted event matching `filter`, newest first.
    pub fn timeline(&self, filter: Filter) -> Live<Vec<Event>> {
        self.register_timeline(filter, false)
    }

    /// Like [`EventStore::timeline`], but each mutable identity contributes
    /// only its current event.
    pub fn current_timeline(&self, filter: Filter) -> Live<Vec<Event>> {
        self.register_timeline(filter, true)
    }

    fn register_timeline(&self, filter: Filter, collapse: bool) -> Live<Vec<Event>> {
        let mut inner = self.inner.lock();
        let view = query_locked(
            &inner.events,
            &inner.by_author,
            &inner.by_kind,
            &inner.current,
            &filter,
            collapse,
        );
        let (tx, rx) = watch::channel(view);
        inner.timelines.push(TimelineWatcher {
            filter,
            collapse,
            tx,
        });
        Live::new(rx)
    }

    /// Snapshot of events matching `filter`, newest first.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let inner = self.inner.lock();
        query_locked(
            &inner.events,
            &inner.by_author,
            &inner.by_kind,
            &inner.current,
            filter,
            false,
        )
    }

    /// Snapshot of the current event for a mutable identity.
    pub fn current(&self, kind: u32, author: &str, d_tag: &str) -> Option<Event> {
        let inner = self.inner.lock();
        current_locked(&inner, &Identity::new(kind, author, d_tag))
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.inner.lock().events.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().events.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live views still attached. Detached views are pruned on write.
    pub fn watcher_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.timelines.iter().filter(|w| !w.tx.is_closed()).count()
            + inner
                .current_watchers
                .values()
                .filter(|tx| !tx.is_closed())
                .count()
    }
}

/// Replacement rule: newer `created_at` wins; on a tie the smaller id wins.
fn supersedes(candidate: &Event, current: &Event) -> bool {
    (candidate.created_at, Reverse(&candidate.id)) > (current.created_at, Reverse(&current.id))
}

fn current_locked(inner: &Inner, identity: &Identity) -> Option<Event> {
    inner
        .current
        .get(identity)
        .and_then(|id| inner.events.get(id))
        .cloned()
}

/// Intersect the author and kind indexes, then apply the full filter.
fn query_locked(
    events: &HashMap<String, Event>,
    by_author: &HashMap<String, HashSet<String>>,
    by_kind: &HashMap<u32, HashSet<String>>,
    current: &HashMap<Identity, String>,
    filter: &Filter,
    collapse: bool,
) -> Vec<Event> {
    let mut sets: Vec<HashSet<&String>> = vec![];
    if let Some(authors) = &filter.authors {
        sets.push(
            authors
                .iter()
                .filter_map(|a| by_author.get(a))
                .flatten()
                .collect(),
        );
    }
    if let Some(kinds) = &filter.kinds {
        sets.push(
            kinds
                .iter()
                .filter_map(|k| by_kind.get(k))
                .flatten()
                .collect(),
        );
    }
    let candidates: Box<dyn Iterator<Item = &Event> + '_> = match sets.into_iter().reduce(|a, b| {
        a.intersection(&b).copied().collect()
    }) {
        Some(ids) => Box::new(ids.into_iter().filter_map(|id| events.get(id))),
        None => Box::new(events.values()),
    };
    let mut out: Vec<Event> = candidates
        .filter(|ev| filter.matches(ev))
        .filter(|ev| {
            !collapse
                || ev
                    .identity()
                    .map_or(true, |identity| current.get(&identity) == Some(&ev.id))
        })
        .cloned()
        .collect();
    out.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(limit) = filter.limit {
        out.truncate(limit);
    }
    out
}

/// Append-only newline-delimited JSON log of admitted events.
struct Journal {
    path: PathBuf,
}

impl Journal {
    fn load(&self) -> Vec<Event> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return vec![],
            Err(e) => {
                warn!(path = %self.path.display(), "journal unreadable: {e}");
                return vec![];
            }
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Event>(&line) {
                Ok(ev) => Some(ev),
                Err(e) => {
                    warn!(path = %self.path.display(), "skipping journal line: {e}");
                    None
                }
            })
            .collect()
    }

    fn append(&self, ev: &Event) {
        if let Err(e) = append_line(&self.path, ev) {
            warn!(path = %self.path.display(), id = %ev.id, "journal append failed: {e}");
        }
    }
}

fn append_line(path: &Path, ev: &Event) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    serde_json::to_writer(&mut f, ev)?;
    f.write_all(b"\n")?;
    Ok(())
}
