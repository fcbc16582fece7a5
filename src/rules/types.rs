use serde::{Deserialize, Serialize};

use crate::common::types::{Label, Sample};
use crate::common::{Timestamp, METRIC_NAME_LABEL};

/// A fully resolved time series as produced by rule execution and consumed by
/// the remote-write sink.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTimeSeries {
    pub samples: Vec<Sample>,
    pub labels: Vec<Label>,
}

pub fn new_time_series(
    values: &[f64],
    timestamps: &[Timestamp],
    labels: Vec<Label>,
) -> RawTimeSeries {
    let samples = values
        .iter()
        .zip(timestamps.iter())
        .map(|(value, timestamp)| Sample {
            value: *value,
            timestamp: *timestamp,
        })
        .collect();

    RawTimeSeries { samples, labels }
}

/// labels_to_string renders the label set in the canonical
/// `{name="value",...}` form, keeping the provided label order. An empty name
/// is rendered as `__name__`. Two label sets are equal for staleness tracking
/// iff their rendered strings are equal.
pub fn labels_to_string(labels: &[Label]) -> String {
    let capacity = labels
        .iter()
        .fold(2, |acc, l| acc + l.name.len() + l.value.len() + 4);
    let mut b = String::with_capacity(capacity);
    b.push('{');
    for (i, label) in labels.iter().enumerate() {
        if label.name.is_empty() {
            b.push_str(METRIC_NAME_LABEL);
        } else {
            b.push_str(&label.name);
        }
        b.push('=');
        b.push_str(&enquote::enquote('"', &label.value));
        if i < labels.len() - 1 {
            b.push(',');
        }
    }
    b.push('}');
    b
}
