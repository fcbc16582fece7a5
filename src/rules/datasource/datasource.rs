use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::common::types::Label;
use crate::common::Timestamp;
use crate::rules::alerts_error::AlertsResult;
use crate::rules::config::DataSourceType;

/// Querier wraps the query and query_range methods of the data source.
pub trait Querier: Send + Sync {
    /// query executes an instant request with the given query at the given
    /// timestamp and returns the list of matched metrics.
    fn query(&self, query: &str, ts: Timestamp) -> AlertsResult<QueryResult>;

    /// query_range executes a range request with the given query on the given
    /// time range.
    fn query_range(&self, query: &str, from: Timestamp, to: Timestamp) -> AlertsResult<QueryResult>;
}

/// QuerierBuilder builds Queriers with the given params.
pub trait QuerierBuilder: Send + Sync {
    fn build_with_params(&self, params: QuerierParams) -> Box<dyn Querier>;
}

/// QuerierParams are the per-group params a Querier is built with.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerierParams {
    pub data_source_type: DataSourceType,
    pub evaluation_interval: Duration,
    pub query_params: AHashMap<String, String>,
    pub headers: AHashMap<String, String>,
    pub debug: bool,
}

/// The response expected from the data source.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// The list of received metrics.
    pub data: Vec<Metric>,
    /// The number of time series touched by the data source during query
    /// evaluation. Zero when the data source doesn't report it.
    pub series_fetched: usize,
}

/// Metric is the basic entity returned by the data source.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub labels: Vec<Label>,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl Metric {
    pub fn new(labels: Vec<Label>, timestamps: Vec<Timestamp>, values: Vec<f64>) -> Metric {
        Metric {
            labels,
            timestamps,
            values,
        }
    }

    /// label returns the value of the given label, or an empty string if the
    /// label is missing.
    pub fn label(&self, key: &str) -> &str {
        for l in self.labels.iter() {
            if l.name == key {
                return &l.value;
            }
        }
        ""
    }

    /// add_label appends the given label to the label set.
    pub fn add_label(&mut self, key: &str, value: &str) {
        self.labels.push(Label::new(key, value));
    }

    /// set_label adds the label or updates an existing one.
    pub fn set_label(&mut self, key: &str, value: &str) {
        for l in self.labels.iter_mut() {
            if l.name == key {
                l.value = value.to_string();
                return;
            }
        }
        self.add_label(key, value);
    }

    /// del_label deletes the given label from the label set.
    pub fn del_label(&mut self, key: &str) {
        self.labels.retain(|l| l.name != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_label_accessors() {
        let mut m = Metric::new(vec![Label::new("job", "node")], vec![1000], vec![1.0]);
        assert_eq!(m.label("job"), "node");
        assert_eq!(m.label("missing"), "");

        m.set_label("job", "blackbox");
        assert_eq!(m.label("job"), "blackbox");
        assert_eq!(m.labels.len(), 1);

        m.set_label("instance", "localhost");
        assert_eq!(m.labels.len(), 2);

        m.del_label("job");
        assert_eq!(m.label("job"), "");
        assert_eq!(m.labels.len(), 1);
    }
}
