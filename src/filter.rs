//! Query filters shared by the store, the loaders and the wire transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::event::Event;

/// NIP-01 style filter. Every populated criterion must match; `limit` only
/// truncates results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
    /// Tag equality constraints keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Case-insensitive substring match against `content`.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: u32) -> Self {
        self.kinds([kind])
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn author(self, author: impl Into<String>) -> Self {
        self.authors([author.into()])
    }

    /// Add a tag constraint; `name` may be given with or without the `#`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = name.trim_start_matches('#').to_string();
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `ev` satisfies every populated criterion.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = ev
                .tag_values(name)
                .any(|v| values.iter().any(|want| want == v));
            if !hit {
                return false;
            }
        }
        if self.since.map_or(false, |s| ev.created_at < s) {
            return false;
        }
        if self.until.map_or(false, |u| ev.created_at > u) {
            return false;
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            if !needle.is_empty() && !ev.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    /// Convert into the JSON object used for `REQ` messages.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), strings(authors));
        }
        for (tag, values) in &self.tags {
            map.insert(format!("#{tag}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(search) = &self.search {
            map.insert("search".into(), Value::String(search.clone()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Build a `Filter` from a NIP-01 filter JSON object. Unknown keys and
    /// values of the wrong type are ignored.
    pub fn from_value(val: &Value) -> Self {
        let string_list = |v: &Value| -> Option<Vec<String>> {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        };
        let ids = val.get("ids").and_then(string_list);
        let authors = val.get("authors").and_then(string_list);
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    if let Some(values) = string_list(v) {
                        tags.insert(name.to_string(), values);
                    }
                }
            }
        }
        Filter {
            ids,
            kinds,
            authors,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            search: val
                .get("search")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::Object(self.to_json()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = Value::deserialize(deserializer)?;
        if !val.is_object() {
            return Err(serde::de::Error::custom("filter must be a JSON object"));
        }
        Ok(Filter::from_value(&val))
    }
}
