use std::sync::OnceLock;
use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Default max number of rule state updates kept in memory per rule.
pub const DEFAULT_RULE_UPDATE_ENTRIES_LIMIT: usize = 10;

/// Process-wide tunables for the rules engine. Read-only during group
/// execution; supplied once by the outer layer at bootstrap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// How often to evaluate the rules when a group doesn't define its own
    /// interval.
    pub evaluation_interval: Duration,

    /// Minimum amount of time to wait before resending an alert to a notifier.
    pub resend_delay: Duration,

    /// Limits the maximum duration for automatic alert expiration, which by
    /// default is 4 times the evaluation interval of the parent group.
    /// Zero disables the cap.
    pub max_resolve_duration: Duration,

    /// How far to look into the past for alert timeseries when restoring
    /// alert state. For example, with look_back=1h the range from now() to
    /// now()-1h will be scanned.
    pub remote_read_look_back: Duration,

    /// Labels in the form 'name=value' to add to all generated recording
    /// rules and alerts.
    pub external_labels: AHashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(60),
            resend_delay: Duration::default(),
            max_resolve_duration: Duration::default(),
            remote_read_look_back: Duration::from_secs(60 * 60),
            external_labels: Default::default(),
        }
    }
}

static GLOBAL_SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Installs the process-wide settings. Returns the rejected value if the
/// settings were already initialized.
pub fn init_global_settings(settings: Settings) -> Result<(), Settings> {
    GLOBAL_SETTINGS.set(settings)
}

pub fn get_global_settings() -> &'static Settings {
    GLOBAL_SETTINGS.get_or_init(Settings::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.evaluation_interval, Duration::from_secs(60));
        assert!(settings.resend_delay.is_zero());
        assert!(settings.max_resolve_duration.is_zero());
        assert_eq!(settings.remote_read_look_back, Duration::from_secs(3600));
        assert!(settings.external_labels.is_empty());
    }

    #[test]
    fn global_settings_initialize_once() {
        let settings = get_global_settings();
        assert_eq!(settings.evaluation_interval, Duration::from_secs(60));
        // the second init is rejected once the defaults are in place
        assert!(init_global_settings(Settings::default()).is_err());
    }
}
