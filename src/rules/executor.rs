use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::common::decimal::STALE_NAN;
use crate::common::types::Label;
use crate::common::Timestamp;
use crate::config::get_global_settings;
use crate::rules::alerts_error::{AlertsError, AlertsResult, ErrorGroup};
use crate::rules::metrics::process_metrics;
use crate::rules::notifier::NotifierProviderFn;
use crate::rules::remote_write::RemoteWriteClient;
use crate::rules::rule::Rule;
use crate::rules::types::{labels_to_string, new_time_series, RawTimeSeries};

/// Series sent to remote write on the previous iteration, keyed by rule id
/// and the canonical string form of the label set.
pub(crate) type PreviouslySentSeries = HashMap<u64, HashMap<String, Vec<Label>>>;

/// Executor evaluates the rules of one group: it runs them with bounded
/// concurrency, forwards the results to remote write, synthesizes staleness
/// markers and dispatches alert notifications. One executor instance is owned
/// by exactly one running group; sharing it would collide the staleness maps
/// on rule ids.
pub(crate) struct Executor {
    notifiers: NotifierProviderFn,
    notifier_headers: RwLock<AHashMap<String, String>>,
    rw: Option<Arc<dyn RemoteWriteClient>>,
    previously_sent_series_to_rw: Mutex<PreviouslySentSeries>,
}

impl Executor {
    pub(crate) fn new(
        notifiers: NotifierProviderFn,
        notifier_headers: AHashMap<String, String>,
        rw: Option<Arc<dyn RemoteWriteClient>>,
    ) -> Executor {
        Executor {
            notifiers,
            notifier_headers: RwLock::new(notifier_headers),
            rw,
            previously_sent_series_to_rw: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the headers attached to notifier requests. Called when the
    /// owning group is reconfigured.
    pub(crate) fn set_notifier_headers(&self, headers: AHashMap<String, String>) {
        *self.notifier_headers.write().unwrap() = headers;
    }

    /// exec_concurrently returns a channel that yields the result of every
    /// rule evaluation and closes once all of them finished. With
    /// `concurrency` <= 1 the rules run sequentially on the caller's task, in
    /// the order they appear in `rules`, and no background task remains when
    /// the call returns. With higher concurrency the completion order is
    /// unspecified.
    pub(crate) async fn exec_concurrently(
        self: Arc<Self>,
        rules: &[Arc<dyn Rule>],
        cancel: CancellationToken,
        ts: Timestamp,
        concurrency: usize,
        resolve_duration: Duration,
        limit: usize,
    ) -> mpsc::Receiver<AlertsResult<()>> {
        // buffered to the number of rules so rule tasks never block on send,
        // even when the receiver stops draining early
        let (tx, rx) = mpsc::channel(rules.len().max(1));

        if concurrency <= 1 {
            for rule in rules {
                let res = self
                    .exec(rule.as_ref(), cancel.clone(), ts, resolve_duration, limit)
                    .await;
                let _ = tx.send(res).await;
            }
            return rx;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let rules = rules.to_vec();
        tokio::spawn(async move {
            let mut tasks = Vec::with_capacity(rules.len());
            for rule in rules {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let executor = Arc::clone(&self);
                let cancel = cancel.clone();
                let tx = tx.clone();
                tasks.push(tokio::spawn(async move {
                    let res = executor
                        .exec(rule.as_ref(), cancel, ts, resolve_duration, limit)
                        .await;
                    let _ = tx.send(res).await;
                    drop(permit);
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        });
        rx
    }

    /// exec executes the given rule at `ts` and processes its results: remote
    /// write, staleness markers and, for alerting rules, notifications.
    pub(crate) async fn exec(
        &self,
        rule: &dyn Rule,
        cancel: CancellationToken,
        ts: Timestamp,
        resolve_duration: Duration,
        limit: usize,
    ) -> AlertsResult<()> {
        let metrics = process_metrics();
        metrics.exec_total.inc();

        let tss = match rule.exec(cancel, ts, limit).await {
            Ok(tss) => tss,
            // the evaluation can be cancelled on graceful shutdown or on
            // group update, no need to handle it as an error
            Err(AlertsError::Cancelled) => return Ok(()),
            Err(err) => {
                metrics.exec_errors.inc();
                return Err(AlertsError::QueryExecutionError(format!(
                    "rule {}: failed to execute: {}",
                    rule, err
                )));
            }
        };

        if let Some(rw) = self.rw.as_ref() {
            self.push_to_rw(rw.as_ref(), rule, &tss)?;

            let stale_series = self.get_stale_series(rule, &tss, ts);
            self.push_to_rw(rw.as_ref(), rule, &stale_series)?;
        }

        let Some(alerting_rule) = rule.as_alerting() else {
            return Ok(());
        };

        let resend_delay = get_global_settings().resend_delay;
        let alerts = alerting_rule.alerts_to_send(ts, resolve_duration, resend_delay);
        if alerts.is_empty() {
            return Ok(());
        }

        let headers = self.notifier_headers.read().unwrap().clone();
        let notifiers = (self.notifiers)();
        let alerts = &alerts;
        let headers = &headers;
        // attempt every notifier even when some of them fail
        let sends = notifiers.iter().map(|nt| async move {
            nt.send(alerts, headers).await.map_err(|err| {
                format!(
                    "rule {}: failed to send alerts to addr {:?}: {}",
                    rule,
                    nt.addr(),
                    err
                )
            })
        });
        let mut err_gr = ErrorGroup::new();
        for res in join_all(sends).await {
            if let Err(err) = res {
                err_gr.push(err);
            }
        }
        if err_gr.is_empty() {
            Ok(())
        } else {
            Err(AlertsError::NotifierError(err_gr))
        }
    }

    fn push_to_rw(
        &self,
        rw: &dyn RemoteWriteClient,
        rule: &dyn Rule,
        tss: &[RawTimeSeries],
    ) -> AlertsResult<()> {
        let metrics = process_metrics();
        let mut last_err = None;
        for ts in tss {
            metrics.remote_write_total.inc();
            if let Err(err) = rw.push(ts.clone()) {
                metrics.remote_write_errors.inc();
                last_err = Some(AlertsError::RemoteWriteError(format!(
                    "rule {}: remote write failure: {}",
                    rule, err
                )));
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// get_stale_series returns staleness markers for the series that were
    /// sent on the previous iteration but are missing from `tss`, and records
    /// `tss` as the new previous set for the rule.
    fn get_stale_series(
        &self,
        rule: &dyn Rule,
        tss: &[RawTimeSeries],
        timestamp: Timestamp,
    ) -> Vec<RawTimeSeries> {
        let mut rule_labels: HashMap<String, Vec<Label>> = HashMap::with_capacity(tss.len());
        for ts in tss {
            // convert the labels to a string so we can compare them with the
            // previously sent series
            let key = labels_to_string(&ts.labels);
            rule_labels.insert(key, ts.labels.clone());
        }

        let rule_id = rule.id();
        let mut stale_series: Vec<RawTimeSeries> = vec![];
        let mut map = self.previously_sent_series_to_rw.lock().unwrap();
        if let Some(previous) = map.get(&rule_id) {
            // staleness markers carry second resolution
            let stale_ts = timestamp - timestamp.rem_euclid(1000);
            for (key, labels) in previous {
                if rule_labels.contains_key(key) {
                    continue;
                }
                // the series was sent on the previous iteration and has now
                // disappeared, mark it as stale
                stale_series.push(new_time_series(&[STALE_NAN], &[stale_ts], labels.clone()));
            }
        }
        map.insert(rule_id, rule_labels);
        stale_series
    }

    /// purge_stale_series drops the tracked series of rules which are no
    /// longer in the given active set. Called when the group's rule list has
    /// changed.
    pub(crate) fn purge_stale_series(&self, active_rules: &[Arc<dyn Rule>]) {
        let active: AHashSet<u64> = active_rules.iter().map(|r| r.id()).collect();
        let mut map = self.previously_sent_series_to_rw.lock().unwrap();
        map.retain(|id, _| active.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::decimal::is_stale_nan;
    use crate::rules::fakes::{FakeAlertingRule, FakeNotifier, FakeRule, FakeWriteClient};
    use crate::rules::notifier::{Alert, Notifier};

    fn no_notifiers() -> NotifierProviderFn {
        Arc::new(Vec::new)
    }

    fn provider_of(notifiers: Vec<Arc<FakeNotifier>>) -> NotifierProviderFn {
        Arc::new(move || {
            notifiers
                .iter()
                .map(|n| Arc::clone(n) as Arc<dyn Notifier>)
                .collect()
        })
    }

    fn series(label_value: &str, ts: Timestamp) -> RawTimeSeries {
        new_time_series(&[1.0], &[ts], vec![Label::new("a", label_value)])
    }

    #[tokio::test]
    async fn exec_pushes_series_to_remote_write() {
        let rw = Arc::new(FakeWriteClient::new());
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule = FakeRule::new(1, "r1").with_series(vec![series("1", 1000), series("2", 1000)]);

        executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap();

        assert_eq!(rw.pushed().len(), 2);
    }

    #[tokio::test]
    async fn exec_emits_stale_markers_for_disappeared_series() {
        let rw = Arc::new(FakeWriteClient::new());
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule = FakeRule::new(1, "r1").with_series(vec![series("1", 1000), series("2", 1000)]);

        executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap();
        rw.clear();

        rule.set_series(vec![series("1", 62_500)]);
        executor
            .exec(&rule, CancellationToken::new(), 62_500, Duration::ZERO, 0)
            .await
            .unwrap();

        let pushed = rw.pushed();
        assert_eq!(pushed.len(), 2);
        let stale: Vec<_> = pushed
            .iter()
            .filter(|ts| ts.samples.iter().any(|s| is_stale_nan(s.value)))
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].labels, vec![Label::new("a", "2")]);
        // second resolution
        assert_eq!(stale[0].samples[0].timestamp, 62_000);
    }

    #[tokio::test]
    async fn exec_reports_no_stale_markers_while_series_persist() {
        let rw = Arc::new(FakeWriteClient::new());
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule = FakeRule::new(1, "r1").with_series(vec![series("1", 1000)]);

        for ts in [1000, 2000, 3000] {
            executor
                .exec(&rule, CancellationToken::new(), ts, Duration::ZERO, 0)
                .await
                .unwrap();
        }

        assert!(rw.pushed().iter().all(|ts| ts
            .samples
            .iter()
            .all(|s| !is_stale_nan(s.value))));
    }

    #[tokio::test]
    async fn purge_stale_series_forgets_removed_rules() {
        let rw = Arc::new(FakeWriteClient::new());
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule1 = FakeRule::new(1, "r1").with_series(vec![series("1", 1000)]);
        let rule2: Arc<dyn Rule> =
            Arc::new(FakeRule::new(2, "r2").with_series(vec![series("2", 1000)]));

        executor
            .exec(&rule1, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap();

        // rule1 is dropped from the active set, its history must go with it
        executor.purge_stale_series(std::slice::from_ref(&rule2));
        rw.clear();

        rule1.set_series(vec![]);
        executor
            .exec(&rule1, CancellationToken::new(), 2000, Duration::ZERO, 0)
            .await
            .unwrap();

        assert!(rw.pushed().is_empty());
    }

    #[tokio::test]
    async fn exec_swallows_cancellation() {
        let rw = Arc::new(FakeWriteClient::new());
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule = FakeRule::new(1, "r1").with_err(AlertsError::Cancelled);

        let res = executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await;

        assert_eq!(res, Ok(()));
        assert!(rw.pushed().is_empty());
    }

    #[tokio::test]
    async fn exec_wraps_rule_failures() {
        let executor = Executor::new(no_notifiers(), Default::default(), None);
        let rule = FakeRule::new(1, "r1").with_err(AlertsError::Generic("boom".to_string()));

        let err = executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap_err();

        match err {
            AlertsError::QueryExecutionError(msg) => {
                assert!(msg.contains("r1"));
                assert!(msg.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_returns_last_remote_write_error() {
        let rw = Arc::new(FakeWriteClient::new());
        rw.set_err(Some(AlertsError::Generic("queue full".to_string())));
        let executor = Executor::new(no_notifiers(), Default::default(), Some(rw.clone()));
        let rule = FakeRule::new(1, "r1").with_series(vec![series("1", 1000), series("2", 1000)]);

        let err = executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, AlertsError::RemoteWriteError(_)));
        // every sample was attempted despite the failures
        assert_eq!(rw.attempts(), 2);
    }

    #[tokio::test]
    async fn exec_fans_out_to_every_notifier() {
        let failing = Arc::new(FakeNotifier::new("alertmanager-0:9093"));
        failing.set_err(Some(AlertsError::Generic("conn refused".to_string())));
        let healthy = Arc::new(FakeNotifier::new("alertmanager-1:9093"));

        let executor = Executor::new(
            provider_of(vec![failing.clone(), healthy.clone()]),
            Default::default(),
            None,
        );
        let rule = FakeAlertingRule::new(7, "HighLoad").with_alerts(vec![Alert {
            name: "HighLoad".to_string(),
            ..Default::default()
        }]);

        let err = executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap_err();

        match err {
            AlertsError::NotifierError(group) => {
                assert_eq!(group.len(), 1);
                assert!(group.0[0].contains("alertmanager-0:9093"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the healthy notifier still received the alerts
        assert_eq!(healthy.sent_alerts().len(), 1);
    }

    #[tokio::test]
    async fn exec_skips_notifiers_without_alerts() {
        let notifier = Arc::new(FakeNotifier::new("alertmanager-0:9093"));
        let executor = Executor::new(
            provider_of(vec![notifier.clone()]),
            Default::default(),
            None,
        );
        let rule = FakeAlertingRule::new(7, "HighLoad");

        executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap();

        assert!(notifier.sent_alerts().is_empty());
    }

    #[tokio::test]
    async fn notifier_headers_are_refreshed() {
        let notifier = Arc::new(FakeNotifier::new("alertmanager-0:9093"));
        let executor = Executor::new(
            provider_of(vec![notifier.clone()]),
            [("X-Tenant".to_string(), "a".to_string())].into_iter().collect(),
            None,
        );
        let rule = FakeAlertingRule::new(7, "HighLoad").with_alerts(vec![Alert::default()]);

        executor
            .exec(&rule, CancellationToken::new(), 1000, Duration::ZERO, 0)
            .await
            .unwrap();
        assert_eq!(notifier.last_headers().get("X-Tenant"), Some(&"a".to_string()));

        executor
            .set_notifier_headers([("X-Tenant".to_string(), "b".to_string())].into_iter().collect());
        executor
            .exec(&rule, CancellationToken::new(), 2000, Duration::ZERO, 0)
            .await
            .unwrap();
        assert_eq!(notifier.last_headers().get("X-Tenant"), Some(&"b".to_string()));
    }

    #[tokio::test]
    async fn exec_concurrently_sequential_preserves_order() {
        let executor = Arc::new(Executor::new(no_notifiers(), Default::default(), None));
        let order = Arc::new(Mutex::new(Vec::new()));
        let rules: Vec<Arc<dyn Rule>> = (0..5)
            .map(|i| {
                Arc::new(FakeRule::new(i, &format!("r{i}")).with_exec_order(order.clone()))
                    as Arc<dyn Rule>
            })
            .collect();

        let mut results = executor
            .exec_concurrently(
                &rules,
                CancellationToken::new(),
                1000,
                1,
                Duration::ZERO,
                0,
            )
            .await;

        let mut received = 0;
        while results.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn exec_concurrently_yields_one_result_per_rule() {
        let executor = Arc::new(Executor::new(no_notifiers(), Default::default(), None));
        let rules: Vec<Arc<dyn Rule>> = (0..10)
            .map(|i| {
                let rule = FakeRule::new(i, &format!("r{i}"))
                    .with_exec_delay(Duration::from_millis(10));
                let rule = if i % 2 == 0 {
                    rule.with_err(AlertsError::Generic("boom".to_string()))
                } else {
                    rule
                };
                Arc::new(rule) as Arc<dyn Rule>
            })
            .collect();

        let mut results = executor
            .exec_concurrently(
                &rules,
                CancellationToken::new(),
                1000,
                3,
                Duration::ZERO,
                0,
            )
            .await;

        let mut oks = 0;
        let mut errs = 0;
        while let Some(res) = results.recv().await {
            match res {
                Ok(()) => oks += 1,
                Err(_) => errs += 1,
            }
        }
        assert_eq!(oks, 5);
        assert_eq!(errs, 5);
    }

    #[tokio::test]
    async fn exec_concurrently_handles_empty_rule_set() {
        let executor = Arc::new(Executor::new(no_notifiers(), Default::default(), None));
        let mut results = executor
            .exec_concurrently(&[], CancellationToken::new(), 1000, 4, Duration::ZERO, 0)
            .await;
        assert!(results.recv().await.is_none());
    }
}
