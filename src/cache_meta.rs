//! Fetch bookkeeping keyed by query fingerprint, persisted across restarts.
//!
//! Every entry records when a query shape was last satisfied from the network
//! and how many events came back. Loaders consult it to skip re-fetching data
//! the store already has. All of it is a cache: a missing, corrupt or
//! unwritable file only costs a refetch.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    clock::{self, SharedClock},
    filter::Filter,
};

/// Current on-disk format version. Files with another version are discarded.
pub const CACHE_META_VERSION: u32 = 1;

/// List views go stale quickest.
pub const LIST_VIEW_MS: u64 = 120_000;
pub const DETAIL_VIEW_MS: u64 = 300_000;
pub const PROFILE_MS: u64 = 900_000;
/// Records hanging off a task (pledges, solutions, votes, payouts).
pub const DEPENDENT_VIEW_MS: u64 = 60_000;

/// Query classes with their own freshness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessClass {
    List,
    Detail,
    Profile,
    Dependent,
}

impl FreshnessClass {
    pub fn threshold_ms(self) -> u64 {
        match self {
            FreshnessClass::List => LIST_VIEW_MS,
            FreshnessClass::Detail => DETAIL_VIEW_MS,
            FreshnessClass::Profile => PROFILE_MS,
            FreshnessClass::Dependent => DEPENDENT_VIEW_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub last_fetched_at: u64,
    pub result_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    queries: HashMap<String, CacheEntry>,
}

/// Short deterministic digest of a filter: 8 lowercase hex characters.
pub fn fingerprint(filter: &Filter) -> String {
    fingerprint_json(&Value::Object(filter.to_json()))
}

/// Fingerprint a raw JSON filter. Key order and the order of values inside
/// arrays do not affect the digest.
pub fn fingerprint_json(val: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(val, &mut canonical);
    let hash = Sha256::digest(canonical.as_bytes());
    hex::encode(&hash[..4])
}

fn write_canonical(val: &Value, out: &mut String) {
    match val {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            let mut parts: Vec<String> = items
                .iter()
                .map(|item| {
                    let mut s = String::new();
                    write_canonical(item, &mut s);
                    s
                })
                .collect();
            parts.sort();
            out.push('[');
            out.push_str(&parts.join(","));
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Shared handle to the fetch bookkeeping table.
#[derive(Clone)]
pub struct CacheMetaStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    path: Option<PathBuf>,
    clock: SharedClock,
}

impl CacheMetaStore {
    /// In-memory table that is never persisted.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            path: None,
            clock,
        }
    }

    /// Table persisted at `path`, loading whatever is already there.
    pub fn open(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let path = path.into();
        let entries = match load(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), "discarding cache metadata: {e}");
                HashMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "cache metadata loaded");
        Self {
            entries: Arc::new(Mutex::new(entries)),
            path: Some(path),
            clock,
        }
    }

    /// Table persisted at `path` using the system clock.
    pub fn open_default(path: impl Into<PathBuf>) -> Self {
        Self::open(path, clock::system())
    }

    /// Record that `digest` was just satisfied from the network.
    pub fn record_fetch(&self, digest: &str, result_count: u64) {
        let entry = CacheEntry {
            last_fetched_at: self.clock.now_ms(),
            result_count,
        };
        // Written under the lock so a slower writer cannot replace a newer table.
        let mut entries = self.entries.lock();
        entries.insert(digest.to_string(), entry);
        self.persist(entries.clone());
    }

    /// True iff an entry exists and is younger than `threshold_ms`.
    pub fn is_fresh(&self, digest: &str, threshold_ms: u64) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .get(digest)
            .map_or(false, |e| now.saturating_sub(e.last_fetched_at) < threshold_ms)
    }

    pub fn get(&self, digest: &str) -> Option<CacheEntry> {
        self.entries.lock().get(digest).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, including the persisted copy.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.persist(HashMap::new());
    }

    fn persist(&self, queries: HashMap<String, CacheEntry>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = save(path, queries) {
            warn!(path = %path.display(), "cache metadata write failed: {e}");
        }
    }
}

fn load(path: &Path) -> Result<HashMap<String, CacheEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = fs::read_to_string(path)?;
    let file: CacheFile = serde_json::from_str(&data)?;
    if file.version != CACHE_META_VERSION {
        return Err(anyhow!(
            "unsupported version {} (expected {CACHE_META_VERSION})",
            file.version
        ));
    }
    Ok(file.queries)
}

/// Write the table atomically through a temp file in the same directory.
fn save(path: &Path, queries: HashMap<String, CacheEntry>) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;
    let file = CacheFile {
        version: CACHE_META_VERSION,
        queries,
    };
    let tmp = tempfile::NamedTempFile::new_in(&parent)?;
    serde_json::to_writer(&tmp, &file)?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manual() -> (ManualClock, SharedClock) {
        let clock = ManualClock::new(1_000_000);
        (clock.clone(), Arc::new(clock))
    }

    #[test]
    fn fingerprint_ignores_key_and_array_order() {
        let a = serde_json::json!({"kinds": [73002, 73001], "#a": ["x", "y"], "limit": 5});
        let b = serde_json::json!({"limit": 5, "#a": ["y", "x"], "kinds": [73001, 73002]});
        assert_eq!(fingerprint_json(&a), fingerprint_json(&b));
        let fa = Filter::from_value(&a);
        let fb = Filter::from_value(&b);
        assert_eq!(fingerprint(&fa), fingerprint(&fb));
        assert_eq!(fingerprint(&fa), fingerprint_json(&a));
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        let a = Filter::new().kind(37300).limit(50);
        let b = Filter::new().kind(37300).limit(51);
        let c = Filter::new().kind(73002).limit(50);
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn fingerprint_is_eight_lowercase_hex() {
        let fp = fingerprint(&Filter::new());
        assert_eq!(fp.len(), 8);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    proptest! {
        #[test]
        fn fingerprint_invariant_under_permutation(
            kinds in proptest::collection::vec(0u32..100_000, 0..6),
            authors in proptest::collection::vec("[a-f0-9]{4}", 0..6),
            rot in 0usize..6,
        ) {
            let mut k2 = kinds.clone();
            k2.reverse();
            let mut a2 = authors.clone();
            if !a2.is_empty() {
                let r = rot % a2.len();
                a2.rotate_left(r);
            }
            let f1 = Filter::new().kinds(kinds).authors(authors).limit(10);
            let f2 = Filter::new().limit(10).authors(a2).kinds(k2);
            prop_assert_eq!(fingerprint(&f1), fingerprint(&f2));
        }
    }

    #[test]
    fn freshness_expires_at_threshold() {
        let (clock, shared) = manual();
        let meta = CacheMetaStore::in_memory(shared);
        assert!(!meta.is_fresh("deadbeef", LIST_VIEW_MS));
        meta.record_fetch("deadbeef", 3);
        assert!(meta.is_fresh("deadbeef", LIST_VIEW_MS));
        clock.advance(LIST_VIEW_MS - 1);
        assert!(meta.is_fresh("deadbeef", LIST_VIEW_MS));
        clock.advance(1);
        assert!(!meta.is_fresh("deadbeef", LIST_VIEW_MS));
        assert_eq!(meta.get("deadbeef").unwrap().result_count, 3);
    }

    #[test]
    fn concurrent_records_all_reach_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache-meta.json");
        let (_, shared) = manual();
        let meta = CacheMetaStore::open(&path, shared.clone());
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let meta = meta.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        meta.record_fetch(&format!("{n:02}{i:02}"), i);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        let reopened = CacheMetaStore::open(&path, shared);
        assert_eq!(reopened.len(), 80);
    }

    #[test]
    fn record_fetch_overwrites() {
        let (clock, shared) = manual();
        let meta = CacheMetaStore::in_memory(shared);
        meta.record_fetch("aa", 1);
        clock.advance(10);
        meta.record_fetch("aa", 7);
        let entry = meta.get("aa").unwrap();
        assert_eq!(entry.result_count, 7);
        assert_eq!(entry.last_fetched_at, 1_000_010);
        meta.clear();
        assert!(meta.is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache/meta.json");
        let (_clock, shared) = manual();
        let meta = CacheMetaStore::open(&path, shared.clone());
        meta.record_fetch("0badf00d", 12);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["queries"]["0badf00d"]["resultCount"], 12);
        assert_eq!(raw["queries"]["0badf00d"]["lastFetchedAt"], 1_000_000);

        let reopened = CacheMetaStore::open(&path, shared);
        assert!(reopened.is_fresh("0badf00d", DETAIL_VIEW_MS));
    }

    #[test]
    fn corrupt_or_foreign_version_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        let (_clock, shared) = manual();
        fs::write(&path, "{not json").unwrap();
        assert!(CacheMetaStore::open(&path, shared.clone()).is_empty());

        fs::write(
            &path,
            r#"{"version":2,"queries":{"aa":{"lastFetchedAt":1,"resultCount":1}}}"#,
        )
        .unwrap();
        assert!(CacheMetaStore::open(&path, shared).is_empty());
    }

    #[test]
    fn write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // a directory where the file should be makes every write fail
        let path = dir.path().join("meta.json");
        fs::create_dir_all(&path).unwrap();
        let (_clock, shared) = manual();
        let meta = CacheMetaStore::open(&path, shared);
        meta.record_fetch("aa", 1);
        assert!(meta.is_fresh("aa", PROFILE_MS));
    }

    #[test]
    fn thresholds_by_class() {
        assert_eq!(FreshnessClass::List.threshold_ms(), 120_000);
        assert_eq!(FreshnessClass::Detail.threshold_ms(), 300_000);
        assert_eq!(FreshnessClass::Profile.threshold_ms(), 900_000);
        assert_eq!(FreshnessClass::Dependent.threshold_ms(), 60_000);
    }
}
