//! Client-side publish cooldowns per record class and identity.
//!
//! Advisory UX protection against accidental double submits. Relays enforce
//! nothing based on this, and nothing here is a trust boundary.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    clock::SharedClock,
    event::{KIND_PAYOUT, KIND_PLEDGE, KIND_SOLUTION, KIND_TASK, KIND_VOTE},
};

/// Cooldowns in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldowns {
    pub task_create: u64,
    pub task_update: u64,
    pub solution: u64,
    pub pledge: u64,
    pub vote: u64,
    pub payout: u64,
    /// Applies to every other kind.
    pub fallback: u64,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            task_create: 30_000,
            task_update: 10_000,
            solution: 60_000,
            pledge: 10_000,
            vote: 5_000,
            payout: 60_000,
            fallback: 30_000,
        }
    }
}

impl Cooldowns {
    /// Cooldown for `kind`; `is_update` selects the reduced task update window.
    pub fn for_kind(&self, kind: u32, is_update: bool) -> u64 {
        match kind {
            KIND_TASK if is_update => self.task_update,
            KIND_TASK => self.task_create,
            KIND_SOLUTION => self.solution,
            KIND_PLEDGE => self.pledge,
            KIND_VOTE => self.vote,
            KIND_PAYOUT => self.payout,
            _ => self.fallback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub allowed: bool,
    pub remaining_ms: u64,
}

/// In-memory cooldown tracker. Cloning shares state.
#[derive(Clone)]
pub struct RateLimiter {
    last_publish: Arc<Mutex<HashMap<String, u64>>>,
    cooldowns: Cooldowns,
    clock: SharedClock,
}

fn key(kind: u32, d_tag: Option<&str>) -> String {
    match d_tag {
        Some(d) => format!("{kind}:{d}"),
        None => kind.to_string(),
    }
}

impl RateLimiter {
    pub fn new(cooldowns: Cooldowns, clock: SharedClock) -> Self {
        Self {
            last_publish: Arc::new(Mutex::new(HashMap::new())),
            cooldowns,
            clock,
        }
    }

    pub fn cooldowns(&self) -> &Cooldowns {
        &self.cooldowns
    }

    /// Whether a publish of `kind` (for the identity `d_tag`, if any) may go out now.
    pub fn can_publish(&self, kind: u32, d_tag: Option<&str>) -> RateLimitCheck {
        let last = self.last_publish.lock().get(&key(kind, d_tag)).copied();
        let Some(last) = last else {
            return RateLimitCheck {
                allowed: true,
                remaining_ms: 0,
            };
        };
        // A prior publish under the same identity key means this one is an update.
        let is_update = d_tag.is_some();
        let cooldown = self.cooldowns.for_kind(kind, is_update);
        let elapsed = self.clock.now_ms().saturating_sub(last);
        if elapsed >= cooldown {
            RateLimitCheck {
                allowed: true,
                remaining_ms: 0,
            }
        } else {
            RateLimitCheck {
                allowed: false,
                remaining_ms: cooldown - elapsed,
            }
        }
    }

    pub fn record_publish(&self, kind: u32, d_tag: Option<&str>) {
        let now = self.clock.now_ms();
        self.last_publish.lock().insert(key(kind, d_tag), now);
    }

    /// Forget every publish, e.g. on logout.
    pub fn reset(&self) {
        self.last_publish.lock().clear();
    }
}
