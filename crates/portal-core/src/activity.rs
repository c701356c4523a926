use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Click/keydown ceiling inside one reset period.
pub const INTERACTION_CEILING: u32 = 50;
/// Fixed reset period of the interaction counter. Not tied to the policy.
pub const ACTION_RESET_INTERVAL_SECS: u64 = 30;

/// Rolling counters of risky activity for one browser profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityWindow {
    #[serde(default)]
    pub reload_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub action_count: u32,
}

impl ActivityWindow {
    /// Drop reloads that are not strictly newer than `now - window`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        self.reload_timestamps.retain(|t| *t > cutoff);
    }

    /// Record a page load and return the number of reloads inside the window.
    pub fn record_reload(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        self.reload_timestamps.push(now);
        self.prune(now, window);
        self.reload_timestamps.len()
    }

    pub fn record_action(&mut self) -> u32 {
        self.action_count = self.action_count.saturating_add(1);
        self.action_count
    }

    pub fn reset_actions(&mut self) {
        self.action_count = 0;
    }

    pub fn interaction_ceiling_exceeded(&self) -> bool {
        self.action_count > INTERACTION_CEILING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_reloads_fall_out_of_window() {
        let start = Utc::now();
        let window = Duration::seconds(15);
        let mut activity = ActivityWindow::default();
        activity.record_reload(start, window);
        activity.record_reload(start + Duration::seconds(5), window);
        // exactly on the boundary counts as outside
        let count = activity.record_reload(start + Duration::seconds(15), window);
        assert_eq!(count, 2);
        assert!(activity
            .reload_timestamps
            .iter()
            .all(|t| *t > start + Duration::seconds(15) - window));
    }

    #[test]
    fn ceiling_is_strictly_exceeded() {
        let mut activity = ActivityWindow::default();
        for _ in 0..INTERACTION_CEILING {
            activity.record_action();
        }
        assert!(!activity.interaction_ceiling_exceeded());
        activity.record_action();
        assert!(activity.interaction_ceiling_exceeded());
        activity.reset_actions();
        assert_eq!(activity.action_count, 0);
    }
}
