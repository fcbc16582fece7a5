use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use scopeguard::defer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::common::{current_time_millis, truncate, Ticker, Timestamp};
use crate::config::get_global_settings;
use crate::rules::alerts_error::{AlertsError, AlertsResult};
use crate::rules::config::{DataSourceType, GroupConfig, RuleConfig};
use crate::rules::datasource::{QuerierBuilder, QuerierParams};
use crate::rules::executor::Executor;
use crate::rules::metrics::GroupMetrics;
use crate::rules::notifier::NotifierProviderFn;
use crate::rules::remote_write::RemoteWriteClient;
use crate::rules::rule::Rule;

static SKIP_RAND_SLEEP_ON_GROUP_START: AtomicBool = AtomicBool::new(false);

/// Disables the random start delay for all groups. Intended for tests and for
/// callers that manage their own start staggering.
pub fn set_skip_rand_sleep_on_group_start(skip: bool) {
    SKIP_RAND_SLEEP_ON_GROUP_START.store(skip, Ordering::Relaxed);
}

fn should_skip_rand_sleep_on_group_start() -> bool {
    SKIP_RAND_SLEEP_ON_GROUP_START.load(Ordering::Relaxed)
}

/// Group is an entity for grouping rules. A running group owns its scheduling
/// loop: `start` evaluates the rules every `interval` until the context is
/// cancelled or `close` is called, and accepts live reconfiguration through
/// `send_update`.
pub struct Group {
    pub name: String,
    pub file: String,
    /// Evaluation cadence. Never changed by `update_with`; an interval change
    /// requires replacing the whole group.
    pub interval: Duration,
    /// Pins evaluation to the given offset within each interval.
    pub eval_offset: Option<Duration>,
    /// eval_alignment will make the timestamp of group query requests be
    /// aligned with interval. Ignored when eval_offset is set.
    pub eval_alignment: Option<bool>,
    pub metrics: GroupMetrics,
    state: RwLock<GroupState>,
    done: CancellationToken,
    finished: CancellationToken,
    update_tx: mpsc::Sender<Group>,
    update_rx: Mutex<Option<mpsc::Receiver<Group>>>,
}

struct GroupState {
    source_type: DataSourceType,
    rules: Vec<Arc<dyn Rule>>,
    limit: usize,
    concurrency: usize,
    checksum: String,
    labels: AHashMap<String, String>,
    params: AHashMap<String, String>,
    headers: AHashMap<String, String>,
    notifier_headers: AHashMap<String, String>,
    last_evaluation: Timestamp,
    /// Cancels the in-flight evaluation. Populated while the group is
    /// running; reissued on every reload.
    eval_cancel: Option<CancellationToken>,
}

impl Group {
    /// from_config builds a group from its configuration. Rules are
    /// constructed through `build_rule` after the external, group and rule
    /// labels have been merged into each rule config.
    pub fn from_config<F>(
        cfg: GroupConfig,
        default_interval: Duration,
        external_labels: &AHashMap<String, String>,
        mut build_rule: F,
    ) -> AlertsResult<Group>
    where
        F: FnMut(RuleConfig) -> Arc<dyn Rule>,
    {
        let mut interval = cfg.interval.unwrap_or_default();
        if interval.is_zero() {
            interval = default_interval;
        }

        let metrics =
            GroupMetrics::new(prometheus::default_registry(), &cfg.name, &cfg.file, interval)?;

        let mut headers = AHashMap::with_capacity(cfg.headers.len());
        for h in cfg.headers {
            headers.insert(h.key, h.value);
        }
        let mut notifier_headers = AHashMap::with_capacity(cfg.notifier_headers.len());
        for h in cfg.notifier_headers {
            notifier_headers.insert(h.key, h.value);
        }

        let mut rules: Vec<Arc<dyn Rule>> = Vec::with_capacity(cfg.rules.len());
        for mut rule in cfg.rules {
            let rule_name = rule.name().to_string();
            let mut extra_labels = AHashMap::new();
            // apply external labels
            if !external_labels.is_empty() {
                extra_labels = external_labels.clone();
            }
            // apply group labels, they have priority over external labels
            if !cfg.labels.is_empty() {
                extra_labels = merge_labels(&cfg.name, &rule_name, &extra_labels, &cfg.labels);
            }
            // apply rule labels, they have priority over the other labels
            if !extra_labels.is_empty() {
                rule.labels = merge_labels(&cfg.name, &rule_name, &extra_labels, &rule.labels);
            }
            rules.push(build_rule(rule));
        }

        let (update_tx, update_rx) = mpsc::channel(1);

        Ok(Group {
            name: cfg.name,
            file: cfg.file,
            interval,
            eval_offset: cfg.eval_offset,
            eval_alignment: cfg.eval_alignment,
            metrics,
            state: RwLock::new(GroupState {
                source_type: cfg.datasource_type,
                rules,
                limit: cfg.limit,
                concurrency: cfg.concurrency.max(1),
                checksum: cfg.checksum,
                labels: cfg.labels,
                params: cfg.params,
                headers,
                notifier_headers,
                last_evaluation: 0,
                eval_cancel: None,
            }),
            done: CancellationToken::new(),
            finished: CancellationToken::new(),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
        })
    }

    /// id returns a unique group id built from the rules file, group name,
    /// type, interval and evaluation offset. The id is stable across reloads
    /// while those fields stay unchanged.
    pub fn id(&self) -> u64 {
        let state = self.state.read().unwrap();
        let mut hash = Fnv1a::new();
        hash.write(self.file.as_bytes());
        hash.write(b"\xff");
        hash.write(self.name.as_bytes());
        hash.write(state.source_type.to_string().as_bytes());
        hash.write(&(self.interval.as_millis() as u64).to_be_bytes());
        if let Some(offset) = self.eval_offset {
            hash.write(&(offset.as_millis() as u64).to_be_bytes());
        }
        hash.finish()
    }

    pub fn rules(&self) -> Vec<Arc<dyn Rule>> {
        self.state.read().unwrap().rules.clone()
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().unwrap().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count() == 0
    }

    pub fn checksum(&self) -> String {
        self.state.read().unwrap().checksum.clone()
    }

    pub fn last_evaluation(&self) -> Timestamp {
        self.state.read().unwrap().last_evaluation
    }

    pub fn notifier_headers(&self) -> AHashMap<String, String> {
        self.state.read().unwrap().notifier_headers.clone()
    }

    /// start runs the group until `ctx` is cancelled or `close` is called.
    /// The finished signal fires on return and no rule evaluation outlives
    /// the call.
    pub async fn start(
        &self,
        ctx: CancellationToken,
        notifiers: NotifierProviderFn,
        rw: Option<Arc<dyn RemoteWriteClient>>,
        restore_querier: Option<Arc<dyn QuerierBuilder>>,
    ) {
        defer! {
            self.finished.cancel();
        }

        let mut eval_ts = current_time_millis();
        // sleep a random duration to spread group rules evaluation over time
        // in order to reduce load on the datasource
        if !should_skip_rand_sleep_on_group_start() {
            let sleep_before_start =
                delay_before_start(eval_ts, self.id(), self.interval, self.eval_offset);
            self.infof(&format!("will start in {:?}", sleep_before_start));
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(sleep_before_start) => {}
            }
            eval_ts += sleep_before_start.as_millis() as i64;
        }

        let mut update_rx = match self.update_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                error!("group {:?}: already started", self.name);
                return;
            }
        };

        let executor = {
            let state = self.state.read().unwrap();
            Arc::new(Executor::new(notifiers, state.notifier_headers.clone(), rw))
        };

        // interrupt the in-flight evaluation on every return path
        defer! {
            if let Some(cancel) = self.state.read().unwrap().eval_cancel.as_ref() {
                cancel.cancel();
            }
        }

        let mut eval_cancel = ctx.child_token();
        self.state.write().unwrap().eval_cancel = Some(eval_cancel.clone());

        self.infof("started");

        self.eval(&executor, eval_cancel.clone(), eval_ts).await;

        let mut ticker = Ticker::new(self.interval);

        // restore the rules state after the first evaluation so only active
        // alerts can be restored
        if let Some(qb) = restore_querier {
            let look_back = get_global_settings().remote_read_look_back;
            if let Err(err) = self.restore(qb.as_ref(), eval_ts, look_back).await {
                error!(
                    "error while restoring ruleState for group {:?}: {}",
                    self.name, err
                );
            }
        }

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("group {:?}: context cancelled", self.name);
                    return;
                }
                _ = self.done.cancelled() => {
                    info!("group {:?}: received stop signal", self.name);
                    return;
                }
                new_group = update_rx.recv() => {
                    let Some(new_group) = new_group else { continue };
                    {
                        let mut state = self.state.write().unwrap();
                        // the sender is expected to have fired the old
                        // eval_cancel through interrupt_eval; reissue a fresh
                        // one so it can be fired again
                        eval_cancel = ctx.child_token();
                        state.eval_cancel = Some(eval_cancel.clone());

                        if let Err(err) = state.update_with(new_group) {
                            error!("group {:?}: failed to update: {}", self.name, err);
                            continue;
                        }

                        // ensure that staleness is tracked for existing rules
                        // only
                        executor.purge_stale_series(&state.rules);
                        executor.set_notifier_headers(state.notifier_headers.clone());
                    }
                    self.infof("re-started");
                }
                _ = ticker.tick() => {
                    let interval_ms = self.interval.as_millis() as i64;
                    let mut missed = (current_time_millis() - eval_ts) / interval_ms - 1;
                    if missed < 0 {
                        // missed can become negative due to irregular delays
                        // during evaluation, when the time since eval_ts is
                        // below the interval
                        missed = 0;
                    }
                    if missed > 0 {
                        self.metrics.iteration_missed.inc_by(missed as u64);
                    }
                    eval_ts += (missed + 1) * interval_ms;

                    self.eval(&executor, eval_cancel.clone(), eval_ts).await;
                }
            }
        }
    }

    async fn eval(&self, executor: &Arc<Executor>, cancel: CancellationToken, ts: Timestamp) {
        self.metrics.iteration_total.inc();

        let start = current_time_millis();
        let started = Instant::now();

        let (rules, concurrency, limit) = {
            let state = self.state.read().unwrap();
            (state.rules.clone(), state.concurrency, state.limit)
        };

        if rules.is_empty() {
            self.metrics
                .iteration_duration
                .observe(started.elapsed().as_secs_f64());
            self.state.write().unwrap().last_evaluation = start;
            return;
        }

        let settings = get_global_settings();
        let resolve_duration = get_resolve_duration(
            self.interval,
            settings.resend_delay,
            settings.max_resolve_duration,
        );
        let ts = self.adjust_req_timestamp(ts);

        let mut errs = Arc::clone(executor)
            .exec_concurrently(&rules, cancel, ts, concurrency, resolve_duration, limit)
            .await;
        while let Some(res) = errs.recv().await {
            if let Err(err) = res {
                error!("group {:?}: {}", self.name, err);
            }
        }

        self.metrics
            .iteration_duration
            .observe(started.elapsed().as_secs_f64());
        self.state.write().unwrap().last_evaluation = start;
    }

    /// adjust_req_timestamp adjusts the timestamp sent to the datasource. The
    /// evaluation offset wins over alignment; with neither configured the
    /// timestamp is aligned to the interval.
    pub(crate) fn adjust_req_timestamp(&self, timestamp: Timestamp) -> Timestamp {
        if let Some(offset) = self.eval_offset {
            // calculate the min timestamp of the evaluation interval
            let interval_start = truncate(timestamp, self.interval);
            let ts = interval_start + offset.as_millis() as i64;
            if timestamp < ts {
                // the passed timestamp is before the expected evaluation
                // offset, adjust it to the previous evaluation round. E.g.
                // with interval=1h and offset=30m a request at 11:20 is moved
                // to 10:30
                return ts - self.interval.as_millis() as i64;
            }
            // eval_offset shouldn't interfere with eval_alignment, return
            // immediately
            return ts;
        }
        if self.eval_alignment.unwrap_or(true) {
            // align the query time with the interval to get the same results
            // as graphing tools plotting the produced series
            return truncate(timestamp, self.interval);
        }
        timestamp
    }

    /// restore recovers the active-alerts state of the group's alerting rules
    /// from the remote read source. Runs once, after the first evaluation, so
    /// only alerts that are still firing get re-hydrated.
    pub async fn restore(
        &self,
        qb: &dyn QuerierBuilder,
        ts: Timestamp,
        look_back: Duration,
    ) -> AlertsResult<()> {
        let (rules, source_type, params, headers) = {
            let state = self.state.read().unwrap();
            (
                state.rules.clone(),
                state.source_type.clone(),
                state.params.clone(),
                state.headers.clone(),
            )
        };
        for rule in rules {
            let Some(alerting_rule) = rule.as_alerting() else {
                continue;
            };
            if alerting_rule.for_duration().is_zero() {
                continue;
            }
            let querier = qb.build_with_params(QuerierParams {
                data_source_type: source_type.clone(),
                evaluation_interval: self.interval,
                query_params: params.clone(),
                headers: headers.clone(),
                debug: alerting_rule.debug(),
            });
            alerting_rule
                .restore(querier, ts, look_back)
                .await
                .map_err(|err| {
                    AlertsError::RuleRestoreError(format!(
                        "error while restoring rule {}: {}",
                        rule, err
                    ))
                })?;
        }
        Ok(())
    }

    /// update_with replaces this group's configuration and rules with the
    /// ones from `new_group`, merging per-rule state in place. The evaluation
    /// interval is intentionally left untouched so the caller can detect
    /// interval changes after the merge.
    pub fn update_with(&self, new_group: Group) -> AlertsResult<()> {
        self.state.write().unwrap().update_with(new_group)
    }

    /// interrupt_eval interrupts the in-flight rules evaluation within the
    /// group. The scheduling loop re-arms the cancellation handle when it
    /// receives the follow-up update.
    pub fn interrupt_eval(&self) {
        let state = self.state.read().unwrap();
        if let Some(cancel) = state.eval_cancel.as_ref() {
            cancel.cancel();
        }
    }

    /// send_update hands a fully constructed replacement group to the running
    /// scheduling loop, which merges it in place via `update_with`. Callers
    /// must invoke `interrupt_eval` first to unblock the loop from the
    /// current iteration.
    pub async fn send_update(&self, new_group: Group) -> AlertsResult<()> {
        self.update_tx.send(new_group).await.map_err(|_| {
            AlertsError::Generic(format!("group {:?}: update channel closed", self.name))
        })
    }

    /// close stops the scheduling loop, waits for it to finish and releases
    /// the group's rules and metrics. Must be called at most once, on a
    /// started group.
    pub async fn close(&self) {
        self.done.cancel();
        self.interrupt_eval();
        self.finished.cancelled().await;

        self.metrics.unregister();
        for rule in self.state.read().unwrap().rules.iter() {
            rule.close();
        }
    }

    fn infof(&self, msg: &str) {
        let state = self.state.read().unwrap();
        info!(
            "group {:?} {}; interval={:?}; eval_offset={:?}; concurrency={}",
            self.name, msg, self.interval, self.eval_offset, state.concurrency
        );
    }
}

impl GroupState {
    /// Not concurrency-safe; the caller holds the group write lock.
    fn update_with(&mut self, new_group: Group) -> AlertsResult<()> {
        let new_state = match new_group.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut rules_registry: HashMap<u64, Arc<dyn Rule>> = new_state
            .rules
            .into_iter()
            .map(|rule| (rule.id(), rule))
            .collect();

        let mut new_rules: Vec<Arc<dyn Rule>> = Vec::with_capacity(self.rules.len());
        for old_rule in self.rules.iter() {
            match rules_registry.remove(&old_rule.id()) {
                Some(new_rule) => {
                    old_rule.update_with(new_rule.as_ref())?;
                    new_rules.push(Arc::clone(old_rule));
                }
                None => {
                    // the old rule is not present in the new list, release it
                    old_rule.close();
                }
            }
        }
        // add the brand-new rules left in the registry
        new_rules.extend(rules_registry.into_values());
        self.rules = new_rules;

        // note that the interval is not updated here so the value can be
        // compared by the manager after the merge
        self.source_type = new_state.source_type;
        self.concurrency = new_state.concurrency;
        self.params = new_state.params;
        self.headers = new_state.headers;
        self.notifier_headers = new_state.notifier_headers;
        self.labels = new_state.labels;
        self.limit = new_state.limit;
        self.checksum = new_state.checksum;
        Ok(())
    }
}

/// merge_labels merges `set2` into `set1` producing a fresh map, with `set2`
/// taking precedence on conflicts. Conflicts are logged with the group and
/// rule names.
pub(crate) fn merge_labels(
    group_name: &str,
    rule_name: &str,
    set1: &AHashMap<String, String>,
    set2: &AHashMap<String, String>,
) -> AHashMap<String, String> {
    let mut merged = set1.clone();
    for (key, value) in set2 {
        if let Some(prev) = merged.get(key) {
            info!(
                "label {:?}={:?} for rule {:?}.{:?} overwritten with external label {:?}={:?}",
                key, prev, group_name, rule_name, key, value
            );
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// get_resolve_duration returns the duration after which a firing alert can
/// be considered resolved.
fn get_resolve_duration(
    group_interval: Duration,
    delta: Duration,
    max_duration: Duration,
) -> Duration {
    let mut delta = delta;
    if group_interval > delta {
        delta = group_interval;
    }
    let mut resolve_duration = delta * 4;
    if !max_duration.is_zero() && resolve_duration > max_duration {
        resolve_duration = max_duration;
    }
    resolve_duration
}

/// delay_before_start returns a duration in `[0, interval)` such that groups
/// with distinct keys spread their first evaluation across the interval while
/// each stays phase-locked to its own slot in every subsequent interval.
/// Accounts for `offset`, so the first evaluation never lands before the
/// configured intra-interval slot.
pub(crate) fn delay_before_start(
    ts: Timestamp,
    key: u64,
    interval: Duration,
    offset: Option<Duration>,
) -> Duration {
    let interval_ms = interval.as_millis() as i64;
    let mut rand_sleep =
        Duration::from_millis((interval_ms as f64 * (key as f64 / 2f64.powi(64))) as u64);
    let sleep_offset = Duration::from_millis(ts.rem_euclid(interval_ms) as u64);
    if rand_sleep < sleep_offset {
        rand_sleep += interval;
    }
    rand_sleep -= sleep_offset;
    // if `ts` plus the computed sleep still lands before `offset` within its
    // interval, push it past the offset
    if let Some(offset) = offset {
        let tmp_eval_ts = ts + rand_sleep.as_millis() as i64;
        if tmp_eval_ts < truncate(tmp_eval_ts, interval) + offset.as_millis() as i64 {
            rand_sleep += offset;
        }
    }
    rand_sleep
}

/// 64-bit FNV-1a, as in the Go standard library `hash/fnv`.
struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Fnv1a {
        Fnv1a(0xcbf29ce484222325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}
