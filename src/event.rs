//! Nostr event model, record-class constants and mutable identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task (bounty) record. Parameterized replaceable, keyed by its `d` tag.
pub const KIND_TASK: u32 = 37300;
/// Solution submitted against a task.
pub const KIND_SOLUTION: u32 = 73001;
/// Pledge of funds toward a task.
pub const KIND_PLEDGE: u32 = 73002;
/// Vote on a solution.
pub const KIND_VOTE: u32 = 1018;
/// Payout released to a solver.
pub const KIND_PAYOUT: u32 = 73004;
/// Reputation record (retractions and similar) targeting an actor.
pub const KIND_REPUTATION: u32 = 73006;
/// Actor metadata. Replaceable, one per author.
pub const KIND_PROFILE: u32 = 0;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The ones this crate reads:
///
/// - `d` – identifier for replaceable events
/// - `a` – address of a task (`kind:author:d`)
/// - `p` – references another author's public key
/// - `e` – links to another event ID
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event as received from relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 37300,
///   "created_at": 1700000000,
///   "tags": [["d", "fix-login"], ["title", "Fix login"]],
///   "content": "details",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `0` or `37300`.
    pub kind: u32,
    /// Unix timestamp of creation, as claimed by the author.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `a` (address).
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Event content body.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All first values of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// The `d` tag value, empty when absent.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Mutable identity of this event, if its kind is replaceable.
    pub fn identity(&self) -> Option<Identity> {
        if is_replaceable(self.kind) {
            Some(Identity::new(self.kind, &self.pubkey, ""))
        } else if is_parameterized(self.kind) {
            Some(Identity::new(self.kind, &self.pubkey, self.d_tag()))
        } else {
            None
        }
    }

    /// Address other events use to point at this one, if it has an identity.
    pub fn address(&self) -> Option<Address> {
        self.identity().map(Address::from)
    }
}

/// Replaceable kinds keep one current event per author.
pub fn is_replaceable(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Parameterized replaceable kinds keep one current event per author and `d` tag.
pub fn is_parameterized(kind: u32) -> bool {
    (30_000..40_000).contains(&kind)
}

/// `(kind, author, d_tag)` triple under which only one event is current.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub kind: u32,
    pub author: String,
    pub d_tag: String,
}

impl Identity {
    pub fn new(kind: u32, author: &str, d_tag: &str) -> Self {
        Self {
            kind,
            author: author.to_string(),
            d_tag: d_tag.to_string(),
        }
    }
}

/// Stable external reference to a mutable identity, `kind:author:d_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(pub Identity);

impl Address {
    /// Parse `kind:author:d_tag`. The `d_tag` part may itself contain `:`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next()?.parse().ok()?;
        let author = parts.next()?;
        let d_tag = parts.next()?;
        if author.is_empty() {
            return None;
        }
        Some(Address(Identity::new(kind, author, d_tag)))
    }

    pub fn kind(&self) -> u32 {
        self.0.kind
    }

    pub fn author(&self) -> &str {
        &self.0.author
    }

    pub fn d_tag(&self) -> &str {
        &self.0.d_tag
    }
}

impl From<Identity> for Address {
    fn from(id: Identity) -> Self {
        Address(id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.kind, self.0.author, self.0.d_tag)
    }
}
