// src/monitoring/collector.rs
//! Isolation metrics collector
//!
//! Tracks active and completed requests, stores violation events, and every
//! aggregation interval recomputes a [`SystemIsolationHealth`] snapshot and
//! evaluates alert conditions.
//!
//! All mutable state sits behind one `parking_lot::Mutex` that is only held
//! for in-memory map work, never across an `.await`. Recording methods do
//! not return errors: a failure inside the collector is logged and the
//! event is dropped.

use crate::monitoring::alert::{Alert, AlertDecision, AlertDispatcher, AlertSink, AlertSource, AlertStats};
use crate::monitoring::history::BoundedHistory;
use crate::monitoring::registry::{InstanceGuard, InstanceRegistry, COLLECTOR_INSTANCE};
use crate::monitoring::request_metrics::RequestIsolationMetrics;
use crate::monitoring::snapshot::{SystemIsolationHealth, UserIsolationSummary};
use crate::monitoring::status::HealthSeverity;
use crate::monitoring::violation::{IsolationViolation, ViolationSeverity, ViolationType};
use crate::observability as obs;
use crate::utils::config::CollectorSettings;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for background tasks on stop
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CollectorState {
    active: HashMap<String, RequestIsolationMetrics>,
    completed: BoundedHistory<RequestIsolationMetrics>,
    user_active: HashMap<String, usize>,
    violations: BoundedHistory<IsolationViolation>,
    violation_counts: HashMap<String, u64>,
    creation_times: BoundedHistory<f64>,
    health_history: BoundedHistory<SystemIsolationHealth>,
    total_completed: u64,
    isolated_completed: u64,
    failed_requests: u64,
    contained_failures: u64,
    total_violations: u64,
}

impl CollectorState {
    fn new(settings: &CollectorSettings) -> Self {
        let history_samples = (settings.health_retention_hours * 3600
            / settings.aggregation_interval_secs.max(1)) as usize;

        Self {
            active: HashMap::new(),
            completed: BoundedHistory::new(settings.max_completed_requests),
            user_active: HashMap::new(),
            violations: BoundedHistory::new(settings.max_violations),
            violation_counts: HashMap::new(),
            creation_times: BoundedHistory::new(settings.max_creation_samples),
            health_history: BoundedHistory::new(history_samples),
            total_completed: 0,
            isolated_completed: 0,
            failed_requests: 0,
            contained_failures: 0,
            total_violations: 0,
        }
    }

    fn isolation_score(&self) -> f64 {
        let active_isolated = self.active.values().filter(|m| m.is_isolated()).count() as u64;
        let total = self.total_completed + self.active.len() as u64;
        if total == 0 {
            return 100.0;
        }
        (self.isolated_completed + active_isolated) as f64 / total as f64 * 100.0
    }

    fn failure_containment_rate(&self) -> f64 {
        if self.failed_requests == 0 {
            100.0
        } else {
            self.contained_failures as f64 / self.failed_requests as f64 * 100.0
        }
    }

    fn average_creation_ms(&self) -> Option<f64> {
        if self.creation_times.is_empty() {
            return None;
        }
        Some(self.creation_times.iter().sum::<f64>() / self.creation_times.len() as f64)
    }

    fn violations_within(&self, window: ChronoDuration) -> impl Iterator<Item = &IsolationViolation> {
        let cutoff = Utc::now() - window;
        self.violations.iter().filter(move |v| v.timestamp >= cutoff)
    }
}

/// Collector of per-request and system-wide isolation metrics
pub struct IsolationMetricsCollector {
    settings: CollectorSettings,
    state: Mutex<CollectorState>,
    alerts: Arc<AlertDispatcher>,
    /// Replaced on every start so the services can be restarted
    stop: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _instance: Option<InstanceGuard>,
}

impl IsolationMetricsCollector {
    pub fn new(settings: CollectorSettings, sink: Arc<dyn AlertSink>) -> Self {
        let alerts = Arc::new(AlertDispatcher::new(
            AlertSource::Collector,
            sink,
            Duration::from_secs(settings.alert_cooldown_secs),
            settings.cooldown_scope,
            settings.alert_queue_capacity,
        ));

        Self {
            state: Mutex::new(CollectorState::new(&settings)),
            settings,
            alerts,
            stop: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            _instance: None,
        }
    }

    /// Count this collector in `registry` (it is declared a singleton there)
    pub fn registered_in(mut self, registry: &Arc<InstanceRegistry>) -> Self {
        self._instance = Some(registry.register(COLLECTOR_INSTANCE, None));
        self
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Register a new active request
    pub fn start_request(
        &self,
        user_id: &str,
        request_id: &str,
        thread_id: Option<&str>,
        run_id: Option<&str>,
    ) {
        let (users, active) = {
            let mut state = self.state.lock();
            if state.active.contains_key(request_id) {
                drop(state);
                warn!(request_id, user_id, "Request already active, ignoring duplicate start");
                return;
            }
            state.active.insert(
                request_id.to_string(),
                RequestIsolationMetrics::new(request_id, user_id, thread_id, run_id),
            );
            *state.user_active.entry(user_id.to_string()).or_insert(0) += 1;
            (state.user_active.len(), state.active.len())
        };

        metrics::gauge!(obs::CONCURRENT_USERS).set(users as f64);
        metrics::gauge!(obs::ACTIVE_REQUESTS).set(active as f64);
        debug!(request_id, user_id, "Request isolation tracking started");
    }

    /// Finalize a request; unknown ids are ignored with a warning
    pub fn complete_request(&self, request_id: &str, success: bool) -> Option<RequestIsolationMetrics> {
        let finished = {
            let mut state = self.state.lock();
            match state.active.remove(request_id) {
                None => None,
                Some(mut record) => {
                    record.finalize(success);

                    state.total_completed += 1;
                    if record.isolation_score >= 100.0 {
                        state.isolated_completed += 1;
                    }
                    if !success {
                        state.failed_requests += 1;
                        if record.failure_contained {
                            state.contained_failures += 1;
                        }
                    }

                    if let Some(count) = state.user_active.get_mut(&record.user_id) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            state.user_active.remove(&record.user_id);
                        }
                    }

                    state.completed.push(record.clone());
                    Some((record, state.user_active.len(), state.active.len()))
                }
            }
        };

        let Some((record, users, active)) = finished else {
            warn!(request_id, "complete_request for unknown request");
            return None;
        };

        metrics::gauge!(obs::CONCURRENT_USERS).set(users as f64);
        metrics::gauge!(obs::ACTIVE_REQUESTS).set(active as f64);
        debug!(
            request_id,
            user_id = %record.user_id,
            score = record.isolation_score,
            success,
            "Request isolation tracking completed"
        );
        Some(record)
    }

    /// Record how long it took to mint an isolated instance
    pub fn record_instance_creation_time(&self, request_id: &str, ms: f64) {
        let user_id = {
            let mut state = self.state.lock();
            state.creation_times.push(ms);
            state.active.get_mut(request_id).map(|record| {
                record.instance_creation_time_ms = Some(ms);
                record.user_id.clone()
            })
        };

        metrics::histogram!(obs::INSTANCE_CREATION_MS).record(ms);

        if ms > self.settings.slow_creation_threshold_ms {
            self.record_isolation_violation(
                ViolationType::SlowInstanceCreation,
                ViolationSeverity::Warning,
                Some(request_id),
                user_id.as_deref(),
                &format!(
                    "instance creation took {:.1}ms (threshold {:.0}ms)",
                    ms, self.settings.slow_creation_threshold_ms
                ),
            );
        }
    }

    /// Store a violation; never panics or returns an error into the caller
    pub fn record_isolation_violation(
        &self,
        violation_type: impl Into<ViolationType>,
        severity: ViolationSeverity,
        request_id: Option<&str>,
        user_id: Option<&str>,
        description: &str,
    ) {
        let violation_type = violation_type.into();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.store_violation(violation_type.clone(), severity, request_id, user_id, description)
        }));

        if outcome.is_err() {
            error!(
                violation_type = %violation_type,
                severity = %severity,
                "Dropping isolation violation after internal collector failure"
            );
        }
    }

    fn store_violation(
        &self,
        violation_type: ViolationType,
        severity: ViolationSeverity,
        request_id: Option<&str>,
        user_id: Option<&str>,
        description: &str,
    ) {
        let mut violation =
            IsolationViolation::new(violation_type, severity, user_id, request_id, description);

        {
            let mut state = self.state.lock();
            if let Some(record) = request_id.and_then(|id| state.active.get_mut(id)) {
                if violation.user_id.is_none() {
                    violation.user_id = Some(record.user_id.clone());
                }
                record.apply_violation(violation.clone());
            }
            *state
                .violation_counts
                .entry(violation.violation_type.as_str().to_string())
                .or_insert(0) += 1;
            state.total_violations += 1;
            state.violations.push(violation.clone());
        }

        metrics::counter!(
            obs::VIOLATIONS_TOTAL,
            "type" => violation.violation_type.as_str().to_string(),
            "severity" => severity.as_str()
        )
        .increment(1);

        let user = violation.user_id.as_deref().unwrap_or("-");
        let request = violation.request_id.as_deref().unwrap_or("-");
        match severity {
            ViolationSeverity::Critical => error!(
                violation_type = %violation.violation_type,
                user_id = user,
                request_id = request,
                "CRITICAL isolation violation: {}",
                description
            ),
            ViolationSeverity::Error => error!(
                violation_type = %violation.violation_type,
                user_id = user,
                request_id = request,
                "Isolation violation: {}",
                description
            ),
            ViolationSeverity::Warning => warn!(
                violation_type = %violation.violation_type,
                user_id = user,
                request_id = request,
                "Isolation warning: {}",
                description
            ),
            ViolationSeverity::Info => info!(
                violation_type = %violation.violation_type,
                user_id = user,
                request_id = request,
                "Isolation notice: {}",
                description
            ),
        }
    }

    /// One aggregation pass: expire, snapshot, store, evaluate alerts
    pub fn aggregate_once(&self) -> SystemIsolationHealth {
        let snapshot = {
            let mut state = self.state.lock();

            let violation_cutoff =
                Utc::now() - ChronoDuration::hours(self.settings.violation_retention_hours as i64);
            let expired = state.violations.expire_while(|v| v.timestamp < violation_cutoff);
            if expired > 0 {
                debug!(expired, "Expired old isolation violations");
            }

            let health_cutoff =
                Utc::now() - ChronoDuration::hours(self.settings.health_retention_hours as i64);
            state.health_history.expire_while(|h| h.timestamp < health_cutoff);

            let snapshot = self.snapshot_locked(&state);
            state.health_history.push(snapshot.clone());
            snapshot
        };

        metrics::gauge!(obs::ISOLATION_SCORE).set(snapshot.isolation_score);
        metrics::gauge!(obs::CONCURRENT_USERS).set(snapshot.concurrent_users as f64);
        metrics::gauge!(obs::ACTIVE_REQUESTS).set(snapshot.active_requests as f64);

        let conditions = self.alert_conditions(&snapshot);
        if !conditions.is_empty() {
            let severity = HealthSeverity::worst(conditions.iter().map(|(s, _)| *s));
            let messages: Vec<String> = conditions.into_iter().map(|(_, m)| m).collect();
            let alert = Alert::new(
                AlertSource::Collector,
                severity,
                format!("{} isolation condition(s) detected", messages.len()),
                messages,
                serde_json::to_value(&snapshot).unwrap_or_default(),
            );
            if self.alerts.raise(alert) == AlertDecision::Queued {
                info!(severity = %severity, "Isolation alert queued");
            }
        }

        snapshot
    }

    fn snapshot_locked(&self, state: &CollectorState) -> SystemIsolationHealth {
        let window = ChronoDuration::hours(self.settings.violation_retention_hours as i64);
        let mut violations_by_category = BTreeMap::new();
        let mut critical = 0;
        for v in state.violations_within(window) {
            *violations_by_category
                .entry(v.violation_type.as_str().to_string())
                .or_insert(0) += 1;
            if v.severity == ViolationSeverity::Critical {
                critical += 1;
            }
        }

        let active_isolated = state.active.values().filter(|m| m.is_isolated()).count() as u64;
        let mut snapshot = SystemIsolationHealth {
            timestamp: Utc::now(),
            total_requests: state.total_completed + state.active.len() as u64,
            isolated_requests: state.isolated_completed + active_isolated,
            isolation_score: state.isolation_score(),
            failure_containment_rate: state.failure_containment_rate(),
            concurrent_users: state.user_active.len(),
            active_requests: state.active.len(),
            violations_by_category,
            avg_instance_creation_ms: state.average_creation_ms().unwrap_or(0.0),
            critical_violations_24h: critical,
            status: HealthSeverity::Healthy,
        };
        snapshot.status =
            HealthSeverity::worst(self.alert_conditions(&snapshot).into_iter().map(|(s, _)| s));
        snapshot
    }

    fn alert_conditions(&self, snapshot: &SystemIsolationHealth) -> Vec<(HealthSeverity, String)> {
        let mut conditions = Vec::new();

        if snapshot.isolation_score < 100.0 {
            conditions.push((
                HealthSeverity::Critical,
                format!("isolation score {:.1}% is below 100%", snapshot.isolation_score),
            ));
        }

        let contamination = snapshot.violation_count(ViolationType::WebsocketContamination.as_str())
            + snapshot.violation_count(ViolationType::CrossUserEvent.as_str());
        if contamination > 0 {
            conditions.push((
                HealthSeverity::Critical,
                format!("{} cross-user event contamination(s)", contamination),
            ));
        }

        let singleton = snapshot.violation_count(ViolationType::SingletonViolation.as_str());
        if singleton > 0 {
            conditions.push((
                HealthSeverity::Critical,
                format!("{} shared singleton instance violation(s)", singleton),
            ));
        }

        if snapshot.avg_instance_creation_ms > self.settings.slow_creation_threshold_ms {
            conditions.push((
                HealthSeverity::Warning,
                format!(
                    "average instance creation {:.1}ms exceeds {:.0}ms",
                    snapshot.avg_instance_creation_ms, self.settings.slow_creation_threshold_ms
                ),
            ));
        }

        conditions
    }

    /// Launch the aggregation loop and alert delivery task
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Isolation metrics collector already started");
            return;
        }

        info!(
            interval_secs = self.settings.aggregation_interval_secs,
            "Starting isolation metrics aggregation"
        );

        let stop = CancellationToken::new();
        *self.stop.lock() = stop.clone();
        tasks.push(self.alerts.spawn(stop.child_token()));

        let collector = Arc::clone(self);
        let period = Duration::from_secs(self.settings.aggregation_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = collector.aggregate_once();
                        debug!(
                            score = snapshot.isolation_score,
                            active = snapshot.active_requests,
                            status = %snapshot.status,
                            "Isolation snapshot"
                        );
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("Isolation aggregation loop stopped");
        }));
    }

    /// Signal the background tasks and wait a bounded time for them
    pub async fn stop(&self) {
        self.stop.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Collector task did not stop in time, aborting");
                task.abort();
            }
        }
        info!("Isolation metrics collector stopped");
    }

    /// Deliver queued alerts now
    pub async fn flush_alerts(&self) -> usize {
        self.alerts.flush().await
    }

    pub fn get_isolation_score(&self) -> f64 {
        self.state.lock().isolation_score()
    }

    pub fn get_failure_containment_rate(&self) -> f64 {
        self.state.lock().failure_containment_rate()
    }

    pub fn get_concurrent_users(&self) -> usize {
        self.state.lock().user_active.len()
    }

    pub fn get_active_requests(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn get_recent_violations(&self, hours: u64) -> Vec<IsolationViolation> {
        let state = self.state.lock();
        state
            .violations_within(ChronoDuration::hours(hours as i64))
            .cloned()
            .collect()
    }

    /// Lifetime violation counts by type
    pub fn get_violation_counts(&self) -> HashMap<String, u64> {
        self.state.lock().violation_counts.clone()
    }

    pub fn total_violations(&self) -> u64 {
        self.state.lock().total_violations
    }

    /// Violations of the given kinds recorded within `window`
    pub fn count_violations(&self, kinds: &[ViolationType], window: Duration) -> u64 {
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::hours(24));
        let state = self.state.lock();
        state
            .violations_within(window)
            .filter(|v| kinds.contains(&v.violation_type))
            .count() as u64
    }

    pub fn get_critical_violation_count(&self, hours: u64) -> u64 {
        let state = self.state.lock();
        state
            .violations_within(ChronoDuration::hours(hours as i64))
            .filter(|v| v.severity == ViolationSeverity::Critical)
            .count() as u64
    }

    pub fn get_health_history(&self, hours: u64) -> Vec<SystemIsolationHealth> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours as i64);
        let state = self.state.lock();
        state
            .health_history
            .iter()
            .filter(|h| h.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Snapshot of the current state without storing it
    pub fn current_snapshot(&self) -> SystemIsolationHealth {
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    pub fn get_average_instance_creation_ms(&self) -> Option<f64> {
        self.state.lock().average_creation_ms()
    }

    /// Active or recently completed request record
    pub fn get_request_metrics(&self, request_id: &str) -> Option<RequestIsolationMetrics> {
        let state = self.state.lock();
        state.active.get(request_id).cloned().or_else(|| {
            state
                .completed
                .iter()
                .rev()
                .find(|m| m.request_id == request_id)
                .cloned()
        })
    }

    /// Per-user view over the active requests and the retained completed history
    pub fn get_user_metrics(&self, user_id: &str) -> UserIsolationSummary {
        let state = self.state.lock();
        let records: Vec<&RequestIsolationMetrics> = state
            .active
            .values()
            .chain(state.completed.iter())
            .filter(|m| m.user_id == user_id)
            .collect();

        let average_isolation_score = if records.is_empty() {
            100.0
        } else {
            records.iter().map(|m| m.compute_score()).sum::<f64>() / records.len() as f64
        };

        UserIsolationSummary {
            user_id: user_id.to_string(),
            active_requests: state.user_active.get(user_id).copied().unwrap_or(0),
            total_requests: records.len() as u64,
            violations: state
                .violations
                .iter()
                .filter(|v| v.user_id.as_deref() == Some(user_id))
                .count(),
            average_isolation_score,
        }
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alerts.stats()
    }
}
