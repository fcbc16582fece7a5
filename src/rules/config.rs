use std::fmt::Display;
use std::hash::Hasher;
use std::str::FromStr;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::config::DEFAULT_RULE_UPDATE_ENTRIES_LIMIT;
use crate::rules::alerts_error::{AlertsError, AlertsResult};
use crate::rules::rule::RuleType;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DataSourceType {
    #[default]
    Prometheus,
    Graphite,
}

impl Display for DataSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSourceType::Prometheus => write!(f, "prometheus"),
            DataSourceType::Graphite => write!(f, "graphite"),
        }
    }
}

impl FromStr for DataSourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prometheus" => Ok(DataSourceType::Prometheus),
            "graphite" => Ok(DataSourceType::Graphite),
            _ => Err(format!("unknown datasource type: {}", s)),
        }
    }
}

/// A single key/value header passed to the datasource or the notifiers.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// GroupConfig is a config for a group of rules, as produced by the outer
/// configuration loader.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub datasource_type: DataSourceType,
    #[serde(default)]
    pub interval: Option<Duration>,
    /// eval_offset pins evaluation to the given offset within each interval.
    #[serde(default)]
    pub eval_offset: Option<Duration>,
    /// eval_alignment will make the timestamp of the group query requests be
    /// aligned with interval. Ignored when eval_offset is set.
    #[serde(default)]
    pub eval_alignment: Option<bool>,
    /// Max number of series a single rule may produce. 0 is unlimited.
    #[serde(default)]
    pub limit: usize,
    /// Max number of rules evaluated concurrently within the group.
    #[serde(default)]
    pub concurrency: usize,
    /// Opaque change detector computed by the configuration loader.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub labels: AHashMap<String, String>,
    #[serde(default)]
    pub params: AHashMap<String, String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub notifier_headers: Vec<Header>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl GroupConfig {
    pub fn validate(&self) -> AlertsResult<()> {
        if self.name.is_empty() {
            return Err(AlertsError::InvalidConfiguration(
                "group name must be set".to_string(),
            ));
        }
        let mut seen: AHashSet<u64> = AHashSet::with_capacity(self.rules.len());
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.hash()) {
                return Err(AlertsError::InvalidConfiguration(format!(
                    "rule \"{}\" is a duplicate within group \"{}\"",
                    rule, self.name
                )));
            }
        }
        Ok(())
    }
}

/// RuleConfig describes an entity that represents either a recording rule or
/// an alerting rule.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub record: String,
    #[serde(default)]
    pub alert: String,
    pub expr: String,
    #[serde(default)]
    pub r#for: Duration,
    /// The alert will continue firing for this long even when the alerting
    /// expression no longer has results.
    #[serde(default)]
    pub keep_firing_for: Duration,
    #[serde(default)]
    pub labels: AHashMap<String, String>,
    #[serde(default)]
    pub annotations: AHashMap<String, String>,
    #[serde(default)]
    pub debug: bool,
    /// Max number of the rule's state updates stored in memory. Overrides the
    /// process-wide default.
    #[serde(default)]
    pub update_entries_limit: Option<usize>,
}

impl RuleConfig {
    /// Returns the rule name according to its type.
    pub fn name(&self) -> &str {
        if !self.record.is_empty() {
            &self.record
        } else {
            &self.alert
        }
    }

    pub fn rule_type(&self) -> RuleType {
        if !self.record.is_empty() {
            RuleType::Recording
        } else {
            RuleType::Alerting
        }
    }

    /// hash returns the unique hash of the rule config, used for duplicate
    /// detection and rule identity across reloads.
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.write(self.record.as_bytes());
        hasher.write(b"\xff");
        hasher.write(self.alert.as_bytes());
        hasher.write(b"\xff");
        hasher.write(self.expr.as_bytes());
        hasher.write_u128(self.r#for.as_millis());
        let mut keys: Vec<&String> = self.labels.keys().collect();
        keys.sort();
        for key in keys {
            hasher.write(key.as_bytes());
            hasher.write(b"=");
            if let Some(value) = self.labels.get(key) {
                hasher.write(value.as_bytes());
            }
            hasher.write(b"\xff");
        }
        hasher.digest()
    }

    pub fn update_entries_limit(&self) -> usize {
        self.update_entries_limit
            .unwrap_or(DEFAULT_RULE_UPDATE_ENTRIES_LIMIT)
    }

    pub fn validate(&self) -> AlertsResult<()> {
        let name = self.name();
        if self.record.is_empty() && self.alert.is_empty() {
            return Err(AlertsError::InvalidRule(
                "rule must have either record or alert field set".to_string(),
            ));
        }
        if !self.record.is_empty() && !self.alert.is_empty() {
            return Err(AlertsError::InvalidRule(format!(
                "rule \"{name}\" should have either record or alert field set, not both"
            )));
        }
        if self.expr.is_empty() {
            return Err(AlertsError::InvalidRule(format!(
                "rule \"{name}\" must have expression set"
            )));
        }
        Ok(())
    }
}

impl Display for RuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rule {}; expr: {}", self.rule_type(), self.name(), self.expr)
    }
}
