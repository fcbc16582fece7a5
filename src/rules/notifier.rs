use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::Timestamp;
use crate::rules::alerts_error::AlertsResult;

/// AlertState is the state of an alert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    /// Neither firing nor pending.
    #[default]
    Inactive,
    /// Active for less than the configured threshold duration.
    Pending,
    /// Active for longer than the configured threshold duration.
    Firing,
}

impl Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(AlertState::Inactive),
            "pending" => Ok(AlertState::Pending),
            "firing" => Ok(AlertState::Firing),
            _ => Err(format!("unknown alert state: {}", s)),
        }
    }
}

/// The triggered alert, as handed to notifiers.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// group_id contains the id of the parent rules group.
    pub group_id: u64,
    /// name represents the Alert name.
    pub name: String,
    /// labels is the list of label-value pairs attached to the Alert.
    pub labels: AHashMap<String, String>,
    /// annotations is the list of annotations generated on Alert evaluation.
    pub annotations: AHashMap<String, String>,
    /// state represents the current state of the Alert.
    pub state: AlertState,
    /// expr contains the expression that was executed to generate the Alert.
    pub expr: String,
    /// active_at defines the moment of time when the Alert has become active.
    pub active_at: Timestamp,
    /// start defines the moment of time when the Alert started firing.
    pub start: Timestamp,
    /// end defines the moment of time when the Alert is set to expire.
    pub end: Timestamp,
    /// resolved_at defines the moment when the Alert switched from Firing to
    /// Inactive.
    pub resolved_at: Timestamp,
    /// last_sent defines the moment when the Alert was sent last time.
    pub last_sent: Timestamp,
    /// value stores the value returned from evaluating the expression.
    pub value: f64,
    /// id is the unique identifier of the Alert.
    pub id: u64,
    /// restored is true if the Alert was restored after restart.
    pub restored: bool,
    /// for defines how long the Alert needs to be active to become Firing.
    pub r#for: Duration,
}

/// Notifier is a common interface for alert manager providers.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// send sends the given list of alerts, attaching `notifier_headers` to
    /// the request. Returns an error if it fails to deliver them.
    async fn send(
        &self,
        alerts: &[Alert],
        notifier_headers: &AHashMap<String, String>,
    ) -> AlertsResult<()>;

    /// addr returns the address alerts are sent to.
    fn addr(&self) -> String;
}

/// Returns the current set of notifiers. Re-resolved on every dispatch so
/// discovery-backed notifier sets stay fresh.
pub type NotifierProviderFn = Arc<dyn Fn() -> Vec<Arc<dyn Notifier>> + Send + Sync>;
