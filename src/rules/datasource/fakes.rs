use std::sync::{Arc, Mutex};

use crate::common::Timestamp;
use crate::rules::alerts_error::{AlertsError, AlertsResult};

use super::{Metric, Querier, QuerierBuilder, QuerierParams, QueryResult};

struct QuerierInner {
    metrics: Vec<Metric>,
    err: Option<AlertsError>,
    queries: Vec<String>,
}

/// FakeQuerier is an in-memory Querier for tests. It answers every query with
/// the configured metrics (or error) and records the queries it has seen.
/// Cloning shares the underlying state, so a clone handed out through
/// `build_with_params` stays observable.
#[derive(Clone)]
pub struct FakeQuerier {
    inner: Arc<Mutex<QuerierInner>>,
}

impl FakeQuerier {
    pub fn new() -> Self {
        Self::with_metrics(vec![])
    }

    pub fn with_metrics(metrics: Vec<Metric>) -> Self {
        FakeQuerier {
            inner: Arc::new(Mutex::new(QuerierInner {
                metrics,
                err: None,
                queries: vec![],
            })),
        }
    }

    pub fn add_metrics(&self, metrics: Vec<Metric>) {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.extend(metrics);
    }

    pub fn set_err(&self, err: Option<AlertsError>) {
        let mut inner = self.inner.lock().unwrap();
        inner.err = err;
    }

    pub fn queries(&self) -> Vec<String> {
        self.inner.lock().unwrap().queries.clone()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.clear();
        inner.err = None;
        inner.queries.clear();
    }

    fn answer(&self, query: &str) -> AlertsResult<QueryResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries.push(query.to_string());
        if let Some(err) = &inner.err {
            return Err(err.clone());
        }
        Ok(QueryResult {
            data: inner.metrics.clone(),
            series_fetched: inner.metrics.len(),
        })
    }
}

impl Default for FakeQuerier {
    fn default() -> Self {
        Self::new()
    }
}

impl Querier for FakeQuerier {
    fn query(&self, query: &str, _ts: Timestamp) -> AlertsResult<QueryResult> {
        self.answer(query)
    }

    fn query_range(
        &self,
        query: &str,
        _from: Timestamp,
        _to: Timestamp,
    ) -> AlertsResult<QueryResult> {
        self.answer(query)
    }
}

impl QuerierBuilder for FakeQuerier {
    fn build_with_params(&self, _params: QuerierParams) -> Box<dyn Querier> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Label;
    use crate::rules::config::DataSourceType;
    use std::time::Duration;

    #[test]
    fn fake_querier_answers_and_records() {
        let querier = FakeQuerier::with_metrics(vec![Metric::new(
            vec![Label::new("job", "node")],
            vec![1000],
            vec![1.0],
        )]);

        let res = querier.query("up == 0", 1000).unwrap();
        assert_eq!(res.data.len(), 1);
        assert_eq!(res.series_fetched, 1);
        assert_eq!(querier.queries(), vec!["up == 0".to_string()]);

        querier.set_err(Some(AlertsError::Generic("boom".to_string())));
        assert!(querier.query_range("up", 0, 1000).is_err());

        querier.reset();
        assert!(querier.queries().is_empty());
    }

    #[test]
    fn built_querier_shares_state() {
        let querier = FakeQuerier::new();
        let built = querier.build_with_params(QuerierParams {
            data_source_type: DataSourceType::Prometheus,
            evaluation_interval: Duration::from_secs(60),
            query_params: Default::default(),
            headers: Default::default(),
            debug: false,
        });
        built.query("up", 0).unwrap();
        assert_eq!(querier.queries(), vec!["up".to_string()]);
    }
}
