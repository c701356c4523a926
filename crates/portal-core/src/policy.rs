use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Collection and document holding the live guard policy.
pub const POLICY_COLLECTION: &str = "settings";
pub const POLICY_DOCUMENT: &str = "security";

pub const DEFAULT_MAX_REFRESHES: u32 = 5;
pub const DEFAULT_REFRESH_WINDOW_SECONDS: u32 = 15;
pub const DEFAULT_BLOCK_DURATION_MINUTES: u32 = 5;

/// Remotely configured thresholds and switches for the access guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GuardPolicy {
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub reload_detection: bool,
    #[serde(default = "default_true")]
    pub interaction_detection: bool,
    #[serde(default = "default_max_refreshes")]
    pub max_refreshes: u32,
    #[serde(default = "default_refresh_window")]
    pub refresh_window_seconds: u32,
    #[serde(default = "default_block_duration")]
    pub block_duration_minutes: u32,
    #[serde(default)]
    pub maintenance_mode: bool,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            active: true,
            reload_detection: true,
            interaction_detection: true,
            max_refreshes: DEFAULT_MAX_REFRESHES,
            refresh_window_seconds: DEFAULT_REFRESH_WINDOW_SECONDS,
            block_duration_minutes: DEFAULT_BLOCK_DURATION_MINUTES,
            maintenance_mode: false,
        }
    }
}

impl GuardPolicy {
    pub fn refresh_window(&self) -> Duration {
        Duration::seconds(i64::from(self.refresh_window_seconds))
    }

    pub fn block_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.block_duration_minutes))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_refreshes == 0 {
            anyhow::bail!("maxRefreshes must be at least 1");
        }
        if self.refresh_window_seconds == 0 {
            anyhow::bail!("refreshWindowSeconds must be at least 1");
        }
        if self.block_duration_minutes == 0 {
            anyhow::bail!("blockDurationMinutes must be at least 1");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_refreshes() -> u32 {
    DEFAULT_MAX_REFRESHES
}

fn default_refresh_window() -> u32 {
    DEFAULT_REFRESH_WINDOW_SECONDS
}

fn default_block_duration() -> u32 {
    DEFAULT_BLOCK_DURATION_MINUTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_takes_defaults() {
        let policy: GuardPolicy =
            serde_json::from_value(serde_json::json!({"maintenanceMode": true})).unwrap();
        assert!(policy.active);
        assert!(policy.maintenance_mode);
        assert_eq!(policy.max_refreshes, DEFAULT_MAX_REFRESHES);
        assert_eq!(policy.refresh_window_seconds, DEFAULT_REFRESH_WINDOW_SECONDS);
    }

    #[test]
    fn zero_window_is_rejected() {
        let policy = GuardPolicy {
            refresh_window_seconds: 0,
            ..GuardPolicy::default()
        };
        assert!(policy.validate().is_err());
        assert!(GuardPolicy::default().validate().is_ok());
    }
}
