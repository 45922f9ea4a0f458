//! Trust tier derivation from payout, retraction and pledge history.

use serde::Serialize;

use crate::{
    event::{Address, Event, KIND_PAYOUT, KIND_PLEDGE, KIND_REPUTATION},
    projection::{BOUNTY_RETRACTION, PLEDGE_RETRACTION},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    New,
    Emerging,
    Established,
    Trusted,
    Flagged,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::New => "new",
            Tier::Emerging => "emerging",
            Tier::Established => "established",
            Tier::Trusted => "trusted",
            Tier::Flagged => "flagged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationScore {
    pub actor: String,
    pub bounties_completed: u32,
    pub pledges_released: u32,
    pub total_pledges: u32,
    pub release_rate: f64,
    pub solutions_accepted: u32,
    pub bounty_retractions: u32,
    pub pledge_retractions: u32,
    pub total_retractions: u32,
    pub total_completions: u32,
    pub total_interactions: u32,
    pub tier: Tier,
}

/// Counts that feed the tier rules.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counts {
    pub bounties_completed: u32,
    pub pledges_released: u32,
    pub total_pledges: u32,
    pub solutions_accepted: u32,
    pub bounty_retractions: u32,
    pub pledge_retractions: u32,
}

impl Counts {
    pub fn release_rate(&self) -> f64 {
        if self.total_pledges == 0 {
            1.0
        } else {
            f64::from(self.pledges_released) / f64::from(self.total_pledges)
        }
    }

    pub fn total_retractions(&self) -> u32 {
        self.bounty_retractions + self.pledge_retractions
    }

    pub fn total_completions(&self) -> u32 {
        self.bounties_completed + self.pledges_released + self.solutions_accepted
    }

    pub fn total_interactions(&self) -> u32 {
        self.total_completions() + self.total_retractions()
    }

    /// First matching rule wins.
    pub fn tier(&self) -> Tier {
        let retractions = self.total_retractions();
        let interactions = self.total_interactions();
        let rate = self.release_rate();
        if retractions > 0 && retractions > self.total_completions() {
            Tier::Flagged
        } else if interactions >= 25 && rate > 0.95 && self.bounty_retractions == 0 {
            Tier::Trusted
        } else if interactions >= 10 && rate > 0.9 {
            Tier::Established
        } else if interactions >= 3 && retractions == 0 {
            Tier::Emerging
        } else {
            Tier::New
        }
    }

    pub fn score(&self, actor: &str) -> ReputationScore {
        ReputationScore {
            actor: actor.to_string(),
            bounties_completed: self.bounties_completed,
            pledges_released: self.pledges_released,
            total_pledges: self.total_pledges,
            release_rate: self.release_rate(),
            solutions_accepted: self.solutions_accepted,
            bounty_retractions: self.bounty_retractions,
            pledge_retractions: self.pledge_retractions,
            total_retractions: self.total_retractions(),
            total_completions: self.total_completions(),
            total_interactions: self.total_interactions(),
            tier: self.tier(),
        }
    }
}

/// Pure derivation; events of unexpected kinds in any input are ignored.
pub fn derive_reputation<'a>(
    actor: &str,
    payouts: impl IntoIterator<Item = &'a Event>,
    reputation_events: impl IntoIterator<Item = &'a Event>,
    pledges: impl IntoIterator<Item = &'a Event>,
) -> ReputationScore {
    let mut counts = Counts::default();

    for ev in payouts.into_iter().filter(|e| e.kind == KIND_PAYOUT) {
        let target_author = ev
            .tag_value("a")
            .and_then(Address::parse)
            .map(|a| a.author().to_string());
        if target_author.as_deref() == Some(actor) {
            counts.bounties_completed += 1;
        }
        if ev.pubkey == actor {
            counts.pledges_released += 1;
        }
        if ev.tag_value("p") == Some(actor) {
            counts.solutions_accepted += 1;
        }
    }

    for ev in reputation_events
        .into_iter()
        .filter(|e| e.kind == KIND_REPUTATION && e.tag_value("p") == Some(actor))
    {
        match ev.tag_value("type") {
            Some(BOUNTY_RETRACTION) => counts.bounty_retractions += 1,
            Some(PLEDGE_RETRACTION) => counts.pledge_retractions += 1,
            _ => {}
        }
    }

    counts.total_pledges = pledges
        .into_iter()
        .filter(|e| e.kind == KIND_PLEDGE && e.pubkey == actor)
        .count() as u32;

    counts.score(actor)
}
