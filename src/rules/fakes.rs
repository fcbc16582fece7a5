//! In-memory doubles for the engine's collaborators: rules, notifiers and
//! the remote-write sink. Used by the crate's own tests and handy for
//! integration testing of outer layers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::Timestamp;
use crate::rules::alerts_error::{AlertsError, AlertsResult};
use crate::rules::datasource::Querier;
use crate::rules::notifier::{Alert, Notifier};
use crate::rules::remote_write::RemoteWriteClient;
use crate::rules::rule::{AlertingRule, Rule, RuleType};
use crate::rules::types::RawTimeSeries;

/// FakeRule is a configurable recording-rule double.
#[derive(Debug, Default)]
pub struct FakeRule {
    id: u64,
    name: String,
    labels: AHashMap<String, String>,
    series: Mutex<Vec<RawTimeSeries>>,
    err: Mutex<Option<AlertsError>>,
    exec_delay: Mutex<Option<Duration>>,
    exec_order: Mutex<Option<Arc<Mutex<Vec<u64>>>>>,
    exec_timestamps: Mutex<Vec<Timestamp>>,
    execs: AtomicUsize,
    closes: AtomicUsize,
    updates: AtomicUsize,
}

impl FakeRule {
    pub fn new(id: u64, name: &str) -> FakeRule {
        FakeRule {
            id,
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_series(self, series: Vec<RawTimeSeries>) -> Self {
        *self.series.lock().unwrap() = series;
        self
    }

    pub fn with_err(self, err: AlertsError) -> Self {
        *self.err.lock().unwrap() = Some(err);
        self
    }

    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *self.exec_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Every exec appends the rule id to `order`, so tests can observe the
    /// scheduling order across a set of rules sharing one log.
    pub fn with_exec_order(self, order: Arc<Mutex<Vec<u64>>>) -> Self {
        *self.exec_order.lock().unwrap() = Some(order);
        self
    }

    pub fn set_series(&self, series: Vec<RawTimeSeries>) {
        *self.series.lock().unwrap() = series;
    }

    pub fn set_err(&self, err: Option<AlertsError>) {
        *self.err.lock().unwrap() = err;
    }

    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// The timestamps the rule was executed with, in execution order.
    pub fn exec_timestamps(&self) -> Vec<Timestamp> {
        self.exec_timestamps.lock().unwrap().clone()
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        ts: Timestamp,
    ) -> AlertsResult<Vec<RawTimeSeries>> {
        if let Some(order) = self.exec_order.lock().unwrap().as_ref() {
            order.lock().unwrap().push(self.id);
        }
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.exec_timestamps.lock().unwrap().push(ts);

        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AlertsError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(err) = self.err.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.series.lock().unwrap().clone())
    }
}

impl fmt::Display for FakeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Rule for FakeRule {
    fn id(&self) -> u64 {
        self.id
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Recording
    }

    fn labels(&self) -> AHashMap<String, String> {
        self.labels.clone()
    }

    async fn exec(
        &self,
        cancel: CancellationToken,
        ts: Timestamp,
        _limit: usize,
    ) -> AlertsResult<Vec<RawTimeSeries>> {
        self.run(cancel, ts).await
    }

    fn update_with(&self, _other: &dyn Rule) -> AlertsResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// FakeAlertingRule extends FakeRule with the alerting capabilities.
#[derive(Debug)]
pub struct FakeAlertingRule {
    inner: FakeRule,
    r#for: Duration,
    debug: bool,
    alerts: Mutex<Vec<Alert>>,
    restores: AtomicUsize,
    execs_at_restore: AtomicUsize,
}

impl FakeAlertingRule {
    pub fn new(id: u64, name: &str) -> FakeAlertingRule {
        FakeAlertingRule {
            inner: FakeRule::new(id, name),
            r#for: Duration::ZERO,
            debug: false,
            alerts: Mutex::new(vec![]),
            restores: AtomicUsize::new(0),
            execs_at_restore: AtomicUsize::new(0),
        }
    }

    pub fn with_for(mut self, r#for: Duration) -> Self {
        self.r#for = r#for;
        self
    }

    pub fn with_alerts(self, alerts: Vec<Alert>) -> Self {
        *self.alerts.lock().unwrap() = alerts;
        self
    }

    pub fn with_series(mut self, series: Vec<RawTimeSeries>) -> Self {
        self.inner = self.inner.with_series(series);
        self
    }

    pub fn exec_count(&self) -> usize {
        self.inner.exec_count()
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count()
    }

    pub fn update_count(&self) -> usize {
        self.inner.update_count()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// How many executions had happened by the time restore was first called.
    pub fn execs_at_restore(&self) -> usize {
        self.execs_at_restore.load(Ordering::SeqCst)
    }
}

impl fmt::Display for FakeAlertingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[async_trait]
impl Rule for FakeAlertingRule {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Alerting
    }

    fn labels(&self) -> AHashMap<String, String> {
        self.inner.labels()
    }

    async fn exec(
        &self,
        cancel: CancellationToken,
        ts: Timestamp,
        _limit: usize,
    ) -> AlertsResult<Vec<RawTimeSeries>> {
        self.inner.run(cancel, ts).await
    }

    fn update_with(&self, other: &dyn Rule) -> AlertsResult<()> {
        self.inner.update_with(other)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn as_alerting(&self) -> Option<&dyn AlertingRule> {
        Some(self)
    }
}

#[async_trait]
impl AlertingRule for FakeAlertingRule {
    fn for_duration(&self) -> Duration {
        self.r#for
    }

    fn debug(&self) -> bool {
        self.debug
    }

    async fn restore(
        &self,
        _querier: Box<dyn Querier>,
        _ts: Timestamp,
        _look_back: Duration,
    ) -> AlertsResult<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        let _ = self.execs_at_restore.compare_exchange(
            0,
            self.inner.exec_count(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    fn alerts_to_send(
        &self,
        _ts: Timestamp,
        _resolve_duration: Duration,
        _resend_delay: Duration,
    ) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

/// FakeNotifier records every delivery it receives.
#[derive(Debug, Default)]
pub struct FakeNotifier {
    addr: String,
    err: Mutex<Option<AlertsError>>,
    sent: Mutex<Vec<Alert>>,
    last_headers: Mutex<AHashMap<String, String>>,
}

impl FakeNotifier {
    pub fn new(addr: &str) -> FakeNotifier {
        FakeNotifier {
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    pub fn set_err(&self, err: Option<AlertsError>) {
        *self.err.lock().unwrap() = err;
    }

    pub fn sent_alerts(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_headers(&self) -> AHashMap<String, String> {
        self.last_headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(
        &self,
        alerts: &[Alert],
        notifier_headers: &AHashMap<String, String>,
    ) -> AlertsResult<()> {
        *self.last_headers.lock().unwrap() = notifier_headers.clone();
        if let Some(err) = self.err.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().extend_from_slice(alerts);
        Ok(())
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }
}

/// FakeWriteClient is a remote-write sink that records every pushed series.
#[derive(Debug, Default)]
pub struct FakeWriteClient {
    series: Mutex<Vec<RawTimeSeries>>,
    err: Mutex<Option<AlertsError>>,
    attempts: AtomicUsize,
}

impl FakeWriteClient {
    pub fn new() -> FakeWriteClient {
        FakeWriteClient::default()
    }

    pub fn set_err(&self, err: Option<AlertsError>) {
        *self.err.lock().unwrap() = err;
    }

    pub fn pushed(&self) -> Vec<RawTimeSeries> {
        self.series.lock().unwrap().clone()
    }

    pub fn pushed_count(&self) -> usize {
        self.series.lock().unwrap().len()
    }

    /// Number of push calls, including the rejected ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.series.lock().unwrap().clear();
    }
}

impl RemoteWriteClient for FakeWriteClient {
    fn push(&self, ts: RawTimeSeries) -> AlertsResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.err.lock().unwrap().clone() {
            return Err(err);
        }
        self.series.lock().unwrap().push(ts);
        Ok(())
    }
}
