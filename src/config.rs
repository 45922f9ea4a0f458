//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{profile_cache::DEFAULT_CAPACITY, rate_limit::Cooldowns, transport::DEFAULT_CONNECT_TIMEOUT};

/// Relays written into a freshly generated `.env`.
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.primal.net"];

pub const DEFAULT_MINT: &str = "https://mint.minibits.cash/Bitcoin";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Directory holding the cache metadata and the event journal.
    pub cache_dir: PathBuf,
    /// Relays queried and published to.
    pub relays: Vec<String>,
    /// Mint suggested for new pledges.
    pub default_mint: String,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub profile_cache_capacity: usize,
    pub connect_timeout: Duration,
    /// Keep admitted events in a journal so they survive restarts.
    pub journal: bool,
    pub cooldowns: Cooldowns,
}

impl Settings {
    /// Defaults rooted at `cache_dir`, with no relays.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            relays: vec![],
            default_mint: DEFAULT_MINT.into(),
            tor_socks: None,
            profile_cache_capacity: DEFAULT_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            journal: false,
            cooldowns: Cooldowns::default(),
        }
    }

    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let cache_dir = PathBuf::from(env::var("CACHE_DIR").context("CACHE_DIR not set")?);
        let defaults = Cooldowns::default();
        let cooldowns = Cooldowns {
            task_create: env_u64("COOLDOWN_TASK_CREATE_MS", defaults.task_create),
            task_update: env_u64("COOLDOWN_TASK_UPDATE_MS", defaults.task_update),
            solution: env_u64("COOLDOWN_SOLUTION_MS", defaults.solution),
            pledge: env_u64("COOLDOWN_PLEDGE_MS", defaults.pledge),
            vote: env_u64("COOLDOWN_VOTE_MS", defaults.vote),
            payout: env_u64("COOLDOWN_PAYOUT_MS", defaults.payout),
            fallback: env_u64("COOLDOWN_FALLBACK_MS", defaults.fallback),
        };
        Ok(Self {
            cache_dir,
            relays: csv_strings(env::var("RELAYS").unwrap_or_default()),
            default_mint: env::var("DEFAULT_MINT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_MINT.into()),
            tor_socks: env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty()),
            profile_cache_capacity: env_u64("PROFILE_CACHE_CAPACITY", DEFAULT_CAPACITY as u64)
                as usize,
            connect_timeout: Duration::from_millis(env_u64(
                "CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            )),
            journal: env::var("JOURNAL").unwrap_or_else(|_| "0".into()) == "1",
            cooldowns,
        })
    }

    /// Relays every query fans out to.
    pub fn default_relays(&self) -> &[String] {
        &self.relays
    }

    pub fn cache_meta_path(&self) -> PathBuf {
        self.cache_dir.join("cache-meta.json")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.cache_dir.join("events.ndjson")
    }
}

/// Numeric variable, falling back to `default` when absent or unparsable.
fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
