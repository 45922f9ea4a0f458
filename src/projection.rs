//! Typed read models parsed from event content and tags.
//!
//! Parsing never fails. A field that cannot be read is left `None` and the
//! problem is recorded in `parse_error`; every other field stays usable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::{
    Address, Event, KIND_PAYOUT, KIND_PLEDGE, KIND_PROFILE, KIND_REPUTATION, KIND_SOLUTION,
    KIND_TASK, KIND_VOTE,
};

/// `type` tag value for a retracted bounty.
pub const BOUNTY_RETRACTION: &str = "bounty_retraction";
/// `type` tag value for a retracted pledge.
pub const PLEDGE_RETRACTION: &str = "pledge_retraction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Open,
    Funded,
    Completed,
    Cancelled,
}

impl TaskStatus {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "funded" => Some(Self::Funded),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Task {
    pub id: String,
    pub author: String,
    pub address: Option<String>,
    pub d_tag: String,
    pub created_at: u64,
    pub title: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub reward_sats: Option<u64>,
    pub mint: Option<String>,
    pub topics: Vec<String>,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Solution {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub task: Option<String>,
    pub link: Option<String>,
    pub description: String,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Pledge {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub task: Option<String>,
    pub amount_sats: Option<u64>,
    pub mint: Option<String>,
    /// Opaque payment token carried in the content.
    pub token: String,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Vote {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub task: Option<String>,
    pub solution: Option<String>,
    pub choice: Option<VoteChoice>,
    pub reason: String,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Payout {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub task: Option<String>,
    pub recipient: Option<String>,
    pub solution: Option<String>,
    pub amount_sats: Option<u64>,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReputationRecord {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub target: Option<String>,
    pub record_type: Option<String>,
    pub reference: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip_deserializing)]
    pub pubkey: String,
    #[serde(skip_deserializing)]
    pub created_at: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub nip05: Option<String>,
    #[serde(default)]
    pub lud16: Option<String>,
    #[serde(skip_deserializing)]
    pub parse_error: Option<String>,
}

impl Profile {
    pub fn from_event(ev: &Event) -> Self {
        // Metadata fields are optional and may carry any JSON type; read what fits.
        let mut profile = match serde_json::from_str::<serde_json::Value>(&ev.content) {
            Ok(val) if val.is_object() => {
                let text = |key: &str| val.get(key).and_then(|v| v.as_str()).map(String::from);
                Profile {
                    name: text("name"),
                    display_name: text("display_name").or_else(|| text("displayName")),
                    about: text("about"),
                    picture: text("picture"),
                    nip05: text("nip05"),
                    lud16: text("lud16"),
                    ..Profile::default()
                }
            }
            Ok(_) => Profile {
                parse_error: Some("profile content is not a JSON object".into()),
                ..Profile::default()
            },
            Err(e) => Profile {
                parse_error: Some(format!("profile content: {e}")),
                ..Profile::default()
            },
        };
        profile.pubkey = ev.pubkey.clone();
        profile.created_at = ev.created_at;
        profile
    }

    /// Best human-readable label.
    pub fn label(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.name.as_deref())
    }
}

/// Closed set of record classes, selected by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Task(Task),
    Solution(Solution),
    Pledge(Pledge),
    Vote(Vote),
    Payout(Payout),
    Reputation(ReputationRecord),
    Profile(Profile),
    Other { id: String, kind: u32 },
}

impl Record {
    pub fn parse(ev: &Event) -> Self {
        match ev.kind {
            KIND_TASK => Record::Task(Task::from_event(ev)),
            KIND_SOLUTION => Record::Solution(Solution::from_event(ev)),
            KIND_PLEDGE => Record::Pledge(Pledge::from_event(ev)),
            KIND_VOTE => Record::Vote(Vote::from_event(ev)),
            KIND_PAYOUT => Record::Payout(Payout::from_event(ev)),
            KIND_REPUTATION => Record::Reputation(ReputationRecord::from_event(ev)),
            KIND_PROFILE => Record::Profile(Profile::from_event(ev)),
            kind => Record::Other {
                id: ev.id.clone(),
                kind,
            },
        }
    }

    pub fn parse_error(&self) -> Option<&str> {
        match self {
            Record::Task(t) => t.parse_error.as_deref(),
            Record::Solution(s) => s.parse_error.as_deref(),
            Record::Pledge(p) => p.parse_error.as_deref(),
            Record::Vote(v) => v.parse_error.as_deref(),
            Record::Payout(p) => p.parse_error.as_deref(),
            Record::Profile(p) => p.parse_error.as_deref(),
            Record::Reputation(_) | Record::Other { .. } => None,
        }
    }
}

/// Collects field-level problems; the first one is kept.
#[derive(Default)]
struct Problems(Option<String>);

impl Problems {
    fn note(&mut self, msg: String) {
        if self.0.is_none() {
            self.0 = Some(msg);
        }
    }

    fn amount(&mut self, ev: &Event, tag: &str) -> Option<u64> {
        let raw = ev.tag_value(tag)?;
        match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.note(format!("invalid {tag}: {raw:?}"));
                None
            }
        }
    }

    fn address(&mut self, ev: &Event) -> Option<String> {
        let raw = ev.tag_value("a")?;
        if Address::parse(raw).is_none() {
            self.note(format!("invalid address: {raw:?}"));
        }
        Some(raw.to_string())
    }
}

impl Task {
    pub fn from_event(ev: &Event) -> Self {
        let mut problems = Problems::default();
        let status = match ev.tag_value("status") {
            None => TaskStatus::Open,
            Some(raw) => TaskStatus::parse(raw).unwrap_or_else(|| {
                problems.note(format!("invalid status: {raw:?}"));
                TaskStatus::Open
            }),
        };
        let reward_sats = problems.amount(ev, "reward");
        Task {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            address: ev.address().map(|a| a.to_string()),
            d_tag: ev.d_tag().to_string(),
            created_at: ev.created_at,
            title: ev.tag_value("title").map(String::from),
            description: ev.content.clone(),
            status,
            reward_sats,
            mint: ev.tag_value("mint").map(String::from),
            topics: ev.tag_values("t").map(String::from).collect(),
            parse_error: problems.0,
        }
    }
}

impl Solution {
    pub fn from_event(ev: &Event) -> Self {
        let mut problems = Problems::default();
        let task = problems.address(ev);
        Solution {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            task,
            link: ev.tag_value("r").map(String::from),
            description: ev.content.clone(),
            parse_error: problems.0,
        }
    }
}

impl Pledge {
    pub fn from_event(ev: &Event) -> Self {
        let mut problems = Problems::default();
        let task = problems.address(ev);
        let amount_sats = problems.amount(ev, "amount");
        Pledge {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            task,
            amount_sats,
            mint: ev.tag_value("mint").map(String::from),
            token: ev.content.clone(),
            parse_error: problems.0,
        }
    }
}

impl Vote {
    pub fn from_event(ev: &Event) -> Self {
        let mut problems = Problems::default();
        let task = problems.address(ev);
        let choice = match ev.tag_value("vote") {
            Some("approve") => Some(VoteChoice::Approve),
            Some("reject") => Some(VoteChoice::Reject),
            Some(raw) => {
                problems.note(format!("invalid vote: {raw:?}"));
                None
            }
            None => {
                problems.note("missing vote tag".into());
                None
            }
        };
        Vote {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            task,
            solution: ev.tag_value("e").map(String::from),
            choice,
            reason: ev.content.clone(),
            parse_error: problems.0,
        }
    }
}

impl Payout {
    pub fn from_event(ev: &Event) -> Self {
        let mut problems = Problems::default();
        let task = problems.address(ev);
        let amount_sats = problems.amount(ev, "amount");
        Payout {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            task,
            recipient: ev.tag_value("p").map(String::from),
            solution: ev.tag_value("e").map(String::from),
            amount_sats,
            parse_error: problems.0,
        }
    }
}

impl ReputationRecord {
    pub fn from_event(ev: &Event) -> Self {
        ReputationRecord {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            target: ev.tag_value("p").map(String::from),
            record_type: ev.tag_value("type").map(String::from),
            reference: ev.tag_value("a").map(String::from),
            reason: ev.content.clone(),
        }
    }
}

/// Approve/reject counts for one solution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoteCount {
    pub approve: u32,
    pub reject: u32,
}

/// Vote counts per solution id. Only each voter's latest vote counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub by_solution: HashMap<String, VoteCount>,
}

impl VoteTally {
    pub fn get(&self, solution_id: &str) -> VoteCount {
        self.by_solution.get(solution_id).copied().unwrap_or_default()
    }
}

/// Tally vote events. Votes without a solution or a readable choice are skipped.
pub fn tally_votes<'a>(votes: impl IntoIterator<Item = &'a Event>) -> VoteTally {
    // (solution, voter) -> (created_at, id, choice)
    let mut latest: HashMap<(String, String), (u64, String, VoteChoice)> = HashMap::new();
    for ev in votes.into_iter().filter(|e| e.kind == KIND_VOTE) {
        let vote = Vote::from_event(ev);
        let (Some(solution), Some(choice)) = (vote.solution, vote.choice) else {
            continue;
        };
        let key = (solution, vote.author);
        let newer = latest.get(&key).map_or(true, |(ts, id, _)| {
            (vote.created_at, std::cmp::Reverse(&vote.id)) > (*ts, std::cmp::Reverse(id))
        });
        if newer {
            latest.insert(key, (vote.created_at, vote.id, choice));
        }
    }
    let mut tally = VoteTally::default();
    for ((solution, _), (_, _, choice)) in latest {
        let count = tally.by_solution.entry(solution).or_default();
        match choice {
            VoteChoice::Approve => count.approve += 1,
            VoteChoice::Reject => count.reject += 1,
        }
    }
    tally
}
