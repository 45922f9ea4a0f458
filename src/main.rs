//! Command line interface for the sync layer. Supports initialization,
//! one-shot fetches, live watching, reputation lookups, filter fingerprints,
//! signature verification and relay list management.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use bountysync::{
    cache_meta::{fingerprint, FreshnessClass},
    config::{self, Settings},
    event::Event,
    filter::Filter,
    loaders::Plan,
    transport,
    validator::Validator,
    Services,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "bountysync",
    author,
    version,
    about = "Local event sync and cache for Nostr bounty clients"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` if missing and create `CACHE_DIR`.
    Init,
    /// Query every relay once and print matching events as JSON lines.
    Fetch {
        #[command(flatten)]
        filter: FilterArgs,
        /// Ask the relays even if the same query was answered recently.
        #[arg(long)]
        force: bool,
    },
    /// Subscribe on every relay and print new events until Ctrl-C.
    Watch {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Derive the reputation tier of a public key.
    Reputation {
        pubkey: String,
        /// Only use what is already cached locally.
        #[arg(long)]
        offline: bool,
    },
    /// Print the cache fingerprint of a filter given as JSON.
    Fingerprint { filter: String },
    /// Check the id and signature of event JSON files.
    Verify {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Manage the relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

/// Operations available under `bountysync relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// NIP-01 filter JSON; the flags below are applied on top.
    #[arg(long)]
    filter: Option<String>,
    #[arg(long = "kind")]
    kinds: Vec<u32>,
    #[arg(long = "author")]
    authors: Vec<String>,
    /// Tag constraint NAME=VALUE, repeatable, e.g. `--tag a=37300:<pubkey>:<d>`.
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
    #[arg(long)]
    since: Option<u64>,
    #[arg(long)]
    limit: Option<usize>,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {s:?}")),
    }
}

impl FilterArgs {
    fn build(&self) -> anyhow::Result<Filter> {
        let mut filter = match &self.filter {
            Some(raw) => serde_json::from_str::<Filter>(raw).context("parsing --filter")?,
            None => Filter::new(),
        };
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().cloned());
        }
        let mut tags: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, value) in &self.tags {
            tags.entry(name.as_str()).or_default().push(value.as_str());
        }
        for (name, values) in tags {
            filter = filter.tag(name, values);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        Ok(filter)
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            fs::create_dir_all(&cfg.cache_dir)?;
            info!(cache_dir = %cfg.cache_dir.display(), "initialized");
        }
        Commands::Fetch { filter, force } => {
            let filter = filter.build()?;
            let services = Services::new(cfg)?;
            let plan = Plan {
                filters: vec![filter.clone()],
                class: FreshnessClass::List,
            };
            let outcome = if force {
                services.loader.refresh(&plan).await?
            } else {
                services.loader.load(&plan).await?
            };
            info!(?outcome, "fetch finished");
            for ev in services.store.query(&filter) {
                println!("{}", serde_json::to_string(&ev)?);
            }
            services.shutdown();
        }
        Commands::Watch { filter } => {
            let filter = filter.build()?;
            let services = Services::new(cfg)?;
            watch(&services, filter).await?;
            services.shutdown();
        }
        Commands::Reputation { pubkey, offline } => {
            let services = Services::new(cfg)?;
            if !offline {
                if let Err(e) = services.loader.load_reputation(&pubkey).await {
                    warn!("using local data only: {e}");
                }
            }
            let score = services.reputation(&pubkey);
            println!("{}", serde_json::to_string_pretty(&score)?);
            services.shutdown();
        }
        Commands::Fingerprint { filter } => {
            let filter: Filter = serde_json::from_str(&filter).context("parsing filter")?;
            println!("{}", fingerprint(&filter));
        }
        Commands::Verify { files } => verify_files(&files)?,
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg).await?,
    }
    Ok(())
}

async fn watch(services: &Services, filter: Filter) -> anyhow::Result<()> {
    let mut timeline = services.store.timeline(filter.clone());
    let mut printed: HashSet<String> = HashSet::new();
    let mut sub = services.pool.subscribe_all(&filter);
    info!(relays = sub.len(), "watching");
    print_new(&timeline.get(), &mut printed)?;
    loop {
        tokio::select! {
            next = timeline.changed() => match next {
                Some(events) => print_new(&events, &mut printed)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    sub.unsubscribe();
    timeline.cancel();
    Ok(())
}

/// Print events not printed before, oldest first.
fn print_new(events: &[Event], printed: &mut HashSet<String>) -> anyhow::Result<()> {
    for ev in events.iter().rev() {
        if printed.insert(ev.id.clone()) {
            println!("{}", serde_json::to_string(ev)?);
        }
    }
    Ok(())
}

fn verify_files(files: &[String]) -> anyhow::Result<()> {
    let validator = Validator::new();
    let mut failures = 0usize;
    for f in files {
        let data = fs::read_to_string(f).with_context(|| format!("reading {f}"))?;
        let ev: Event = serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
        match validator.verify(&ev) {
            Ok(()) => println!("ok {} {}", ev.id, f),
            Err(e) => {
                println!("invalid {f}: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} events failed verification", files.len());
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_dir = base_dir.join("bountysync-data");
    let mut content = String::new();
    content.push_str(&format!("CACHE_DIR={}\n", display_path(&cache_dir)));
    content.push_str(&format!("RELAYS={}\n", config::DEFAULT_RELAYS.join(",")));
    content.push_str(&format!("DEFAULT_MINT={}\n", config::DEFAULT_MINT));
    content.push_str("TOR_SOCKS=\n");
    content.push_str("PROFILE_CACHE_CAPACITY=500\n");
    content.push_str("CONNECT_TIMEOUT_MS=10000\n");
    content.push_str("JOURNAL=1\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(env_path, cfg, url).await?,
        RelayAction::Remove { url } => remove_relay(env_path, cfg, url)?,
    }
    Ok(())
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    transport::test_connection(&url, cfg.tor_socks.as_deref(), cfg.connect_timeout).await?;
    let mut relays = cfg.relays.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS", relays_joined);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
