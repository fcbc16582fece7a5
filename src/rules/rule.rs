use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::common::Timestamp;
use crate::rules::alerts_error::AlertsResult;
use crate::rules::datasource::Querier;
use crate::rules::notifier::Alert;
use crate::rules::types::RawTimeSeries;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    Recording,
    #[default]
    Alerting,
}

impl RuleType {
    pub fn name(&self) -> &'static str {
        match self {
            RuleType::Recording => "recording",
            RuleType::Alerting => "alerting",
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, RuleType::Recording)
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self, RuleType::Alerting)
    }
}

impl Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            value if value.eq_ignore_ascii_case("recording_rule") => Ok(RuleType::Recording),
            value if value.eq_ignore_ascii_case(RuleType::Recording.name()) => Ok(RuleType::Recording),
            value if value.eq_ignore_ascii_case(RuleType::Alerting.name()) => Ok(RuleType::Alerting),
            _ => Err(format!("unknown rule type: {}", s)),
        }
    }
}

/// Rule represents an alerting or recording rule that has a unique id, can be
/// executed and updated with another Rule of the same identity.
#[async_trait]
pub trait Rule: Debug + Display + Send + Sync {
    /// id returns a unique id that may be used for identifying this Rule
    /// among others.
    fn id(&self) -> u64;

    fn rule_type(&self) -> RuleType;

    /// labels returns the extra labels attached to every series the rule
    /// emits.
    fn labels(&self) -> AHashMap<String, String>;

    /// exec executes the rule at the given timestamp. Returns an error if the
    /// number of resulting time series exceeds `limit` (0 means no limit), or
    /// `AlertsError::Cancelled` once `cancel` fires.
    async fn exec(
        &self,
        cancel: CancellationToken,
        ts: Timestamp,
        limit: usize,
    ) -> AlertsResult<Vec<RawTimeSeries>>;

    /// update_with merges the configuration of `other` into this rule in
    /// place, preserving accumulated state such as active alert timers.
    fn update_with(&self, other: &dyn Rule) -> AlertsResult<()>;

    /// close releases the resources held by the rule.
    fn close(&self);

    /// as_alerting narrows the rule to its alerting capabilities, if any.
    fn as_alerting(&self) -> Option<&dyn AlertingRule> {
        None
    }
}

/// The extended contract of alerting rules.
#[async_trait]
pub trait AlertingRule: Rule {
    /// for_duration returns how long the alert expression must keep returning
    /// results before the alert switches from pending to firing.
    fn for_duration(&self) -> Duration;

    fn debug(&self) -> bool;

    /// restore rehydrates the rule's active-alerts state from the data
    /// source.
    async fn restore(
        &self,
        querier: Box<dyn Querier>,
        ts: Timestamp,
        look_back: Duration,
    ) -> AlertsResult<()>;

    /// alerts_to_send returns the alerts that are due for (re-)notification
    /// at `ts`.
    fn alerts_to_send(
        &self,
        ts: Timestamp,
        resolve_duration: Duration,
        resend_delay: Duration,
    ) -> Vec<Alert>;
}
