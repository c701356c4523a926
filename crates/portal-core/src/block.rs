use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    ReloadRate,
    InteractionRate,
    External(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::ReloadRate => write!(f, "Too many page reloads in a short time"),
            BlockReason::InteractionRate => {
                write!(f, "Unusually rapid clicking or typing detected")
            }
            BlockReason::External(reason) => write!(f, "{reason}"),
        }
    }
}

/// Local lockout record. Persisted so a reload cannot escape it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub active: bool,
    pub reason: Option<BlockReason>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockState {
    pub fn enter(&mut self, reason: BlockReason, now: DateTime<Utc>, duration: Duration) {
        self.active = true;
        self.reason = Some(reason);
        self.blocked_at = Some(now);
        self.expires_at = Some(now + duration);
    }

    pub fn exit(&mut self) {
        self.active = false;
        self.reason = None;
        self.blocked_at = None;
        self.expires_at = None;
    }

    /// A block without an expiry is treated as already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => true,
        }
    }

    pub fn is_enforced(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    /// Whole seconds left, rounded up, or `None` when not enforced.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        if !self.is_enforced(now) {
            return None;
        }
        let expires_at = self.expires_at?;
        let millis = (expires_at - now).num_milliseconds();
        u64::try_from(millis).ok().map(|ms| ms.div_ceil(1000))
    }
}
