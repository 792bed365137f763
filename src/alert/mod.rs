//! Threshold alerting over freshly collected samples and deltas.
//!
//! Each evaluation produces a set of met conditions keyed by
//! `kind[:bucket]`. A condition raises one event when it becomes met and
//! stays silent while it remains met; once it stops being met the event is
//! closed and the next occurrence raises a new one.

mod notifier;

pub use notifier::*;

use crate::db::{AlertEvent, AlertKind, AlertRule, MetricDelta, RawSample, Store};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Wait types that starve the whole instance when they pile up.
pub const POISON_WAITS: [&str; 3] = ["THREADPOOL", "RESOURCE_SEMAPHORE", "RESOURCE_SEMAPHORE_QUERY_COMPILE"];

const DEFAULT_JOB_MULTIPLIER: f64 = 3.0;

/// Everything one server cycle hands to the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub server_id: i64,
    pub deltas: &'a [MetricDelta],
    pub samples: &'a [RawSample],
    /// `Some(false)` when every collector in the cycle failed to connect,
    /// `Some(true)` when at least one reached the server, `None` if nothing ran.
    pub reachable: Option<bool>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertOutcome {
    pub raised: Vec<AlertEvent>,
    pub cleared: Vec<AlertEvent>,
}

impl AlertOutcome {
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.cleared.is_empty()
    }
}

/// A condition met during one evaluation.
#[derive(Debug, Clone, PartialEq)]
struct Occurrence {
    kind: AlertKind,
    key: String,
    details: String,
}

fn dedup_key(kind: AlertKind, bucket: Option<&str>) -> String {
    match bucket {
        Some(b) => format!("{}:{}", kind, b),
        None => kind.to_string(),
    }
}

pub struct AlertEvaluator {
    store: Arc<Store>,
    /// Open events per server, keyed by dedup key.
    active: Mutex<HashMap<i64, BTreeMap<String, AlertEvent>>>,
}

impl AlertEvaluator {
    /// Create an evaluator, reopening events that were still open at shutdown.
    pub fn load(store: Arc<Store>) -> Result<Self, crate::db::DbError> {
        let mut active: HashMap<i64, BTreeMap<String, AlertEvent>> = HashMap::new();
        for event in store.open_alert_events()? {
            active
                .entry(event.server_id)
                .or_default()
                .insert(event.dedup_key.clone(), event);
        }
        if !active.is_empty() {
            tracing::info!(
                "AlertEvaluator: restored {} open alerts",
                active.values().map(|m| m.len()).sum::<usize>()
            );
        }
        Ok(Self {
            store,
            active: Mutex::new(active),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, BTreeMap<String, AlertEvent>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open events for every server.
    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        let active = self.lock();
        let mut events: Vec<AlertEvent> = active.values().flat_map(|m| m.values().cloned()).collect();
        events.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at).then(a.id.cmp(&b.id)));
        events
    }

    /// Drop the in-memory windows of a deleted server.
    pub fn forget_server(&self, server_id: i64) {
        self.lock().remove(&server_id);
    }

    /// Open a window for a process-level alert that has no rule.
    ///
    /// Returns the event when the window is new. A failure to persist is
    /// logged and the event is still returned, so a failing store reaches
    /// the notifiers.
    pub fn escalate(
        &self,
        server_id: i64,
        kind: AlertKind,
        bucket: &str,
        details: String,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let key = dedup_key(kind, Some(bucket));
        let mut active = self.lock();
        let server_active = active.entry(server_id).or_default();
        if server_active.contains_key(&key) {
            return None;
        }
        let mut event = AlertEvent {
            id: 0,
            server_id,
            kind,
            triggered_at: now,
            dedup_key: key,
            details,
            cleared_at: None,
        };
        if let Err(e) = self.store.add_alert_event(&mut event) {
            tracing::error!("AlertEvaluator: failed to record {} for server {}: {}", event.dedup_key, server_id, e);
        }
        tracing::info!("AlertEvaluator: {} raised on server {}: {}", event.dedup_key, server_id, event.details);
        server_active.insert(event.dedup_key.clone(), event.clone());
        Some(event)
    }

    /// Close a process-level window opened by [`escalate`](Self::escalate).
    pub fn resolve(&self, server_id: i64, kind: AlertKind, bucket: &str, now: DateTime<Utc>) -> Option<AlertEvent> {
        self.resolve_key(server_id, &dedup_key(kind, Some(bucket)), now)
    }

    fn resolve_key(&self, server_id: i64, key: &str, now: DateTime<Utc>) -> Option<AlertEvent> {
        let mut active = self.lock();
        let mut event = active.get_mut(&server_id)?.remove(key)?;
        if event.id > 0 {
            if let Err(e) = self.store.clear_alert_event(event.id, now) {
                tracing::error!("AlertEvaluator: failed to close alert {}: {}", event.id, e);
            }
        }
        event.cleared_at = Some(now);
        tracing::info!("AlertEvaluator: {} cleared on server {}", event.dedup_key, server_id);
        Some(event)
    }

    /// `(server_id, bucket)` of every open window of `kind`.
    pub fn open_buckets(&self, kind: AlertKind) -> Vec<(i64, String)> {
        let prefix = format!("{}:", kind);
        let active = self.lock();
        let mut buckets = Vec::new();
        for (server_id, events) in active.iter() {
            for (key, event) in events {
                if event.kind != kind {
                    continue;
                }
                if let Some(bucket) = key.strip_prefix(&prefix) {
                    buckets.push((*server_id, bucket.to_string()));
                }
            }
        }
        buckets
    }

    /// Evaluate one cycle's data for a server.
    ///
    /// Only kinds whose inputs are present in `input` are evaluated; open
    /// windows of other kinds are left untouched.
    pub fn evaluate(&self, input: &EvaluationInput<'_>, rules: &[AlertRule]) -> AlertOutcome {
        let rule = |kind: AlertKind| rules.iter().find(|r| r.kind == kind && r.enabled);
        let mut evaluated: HashSet<AlertKind> = HashSet::new();
        let mut met: Vec<Occurrence> = Vec::new();

        let mut mark = |kind: AlertKind, found: Vec<Occurrence>| {
            evaluated.insert(kind);
            met.extend(found);
        };

        let has_sample = |category: &str| input.samples.iter().any(|s| s.category == category);
        let has_delta = |category: &str| input.deltas.iter().any(|d| d.category == category);

        if has_sample("cpu") {
            mark(AlertKind::Cpu, rule(AlertKind::Cpu).map(|r| cpu(input, r)).unwrap_or_default());
        }
        if has_sample("blocking") {
            mark(
                AlertKind::Blocking,
                rule(AlertKind::Blocking).map(|r| blocking(input, r)).unwrap_or_default(),
            );
        }
        if has_delta("deadlocks") {
            mark(
                AlertKind::Deadlock,
                rule(AlertKind::Deadlock).map(|r| deadlocks(input, r)).unwrap_or_default(),
            );
        }
        if has_delta("waits") {
            mark(
                AlertKind::PoisonWait,
                rule(AlertKind::PoisonWait).map(|r| poison_waits(input, r)).unwrap_or_default(),
            );
        }
        if has_sample("queries") {
            mark(
                AlertKind::LongRunningQuery,
                rule(AlertKind::LongRunningQuery)
                    .map(|r| long_running_queries(input, r))
                    .unwrap_or_default(),
            );
        }
        if has_sample("tempdb") {
            mark(
                AlertKind::TempDbSpace,
                rule(AlertKind::TempDbSpace).map(|r| tempdb(input, r)).unwrap_or_default(),
            );
        }
        if has_sample("jobs") {
            mark(
                AlertKind::LongRunningJob,
                rule(AlertKind::LongRunningJob)
                    .map(|r| long_running_jobs(input, r))
                    .unwrap_or_default(),
            );
        }

        let mut active = self.lock();
        let server_active = active.entry(input.server_id).or_default();

        if let Some(reachable) = input.reachable {
            let offline_key = dedup_key(AlertKind::ConnectionChange, Some("offline"));
            let was_offline = server_active.contains_key(&offline_key);
            let found = match rule(AlertKind::ConnectionChange) {
                None => Vec::new(),
                Some(_) if !reachable => vec![Occurrence {
                    kind: AlertKind::ConnectionChange,
                    key: offline_key,
                    details: "server unreachable: every collector failed to connect".to_string(),
                }],
                Some(_) if was_offline => vec![Occurrence {
                    kind: AlertKind::ConnectionChange,
                    key: dedup_key(AlertKind::ConnectionChange, Some("restored")),
                    details: "server reachable again".to_string(),
                }],
                Some(_) => Vec::new(),
            };
            mark(AlertKind::ConnectionChange, found);
        }

        let mut outcome = AlertOutcome::default();

        let met_keys: HashSet<&str> = met.iter().map(|o| o.key.as_str()).collect();
        let closing: Vec<String> = server_active
            .iter()
            .filter(|(key, event)| evaluated.contains(&event.kind) && !met_keys.contains(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in closing {
            let Some(mut event) = server_active.remove(&key) else {
                continue;
            };
            if let Err(e) = self.store.clear_alert_event(event.id, input.now) {
                tracing::error!("AlertEvaluator: failed to close alert {}: {}", event.id, e);
                server_active.insert(key, event);
                continue;
            }
            event.cleared_at = Some(input.now);
            tracing::debug!("AlertEvaluator: {} cleared on server {}", event.dedup_key, event.server_id);
            outcome.cleared.push(event);
        }

        for occurrence in met {
            if server_active.contains_key(&occurrence.key) {
                continue;
            }
            let mut event = AlertEvent {
                id: 0,
                server_id: input.server_id,
                kind: occurrence.kind,
                triggered_at: input.now,
                dedup_key: occurrence.key,
                details: occurrence.details,
                cleared_at: None,
            };
            if let Err(e) = self.store.add_alert_event(&mut event) {
                tracing::error!(
                    "AlertEvaluator: failed to record {} for server {}: {}",
                    event.dedup_key,
                    event.server_id,
                    e
                );
                continue;
            }
            tracing::info!(
                "AlertEvaluator: {} raised on server {}: {}",
                event.dedup_key,
                event.server_id,
                event.details
            );
            server_active.insert(event.dedup_key.clone(), event.clone());
            outcome.raised.push(event);
        }

        outcome
    }
}

fn sample_values<'a>(input: &'a EvaluationInput<'_>, category: &'a str) -> impl Iterator<Item = (&'a str, f64)> + 'a {
    input
        .samples
        .iter()
        .filter(move |s| s.category == category)
        .flat_map(|s| s.counters.iter().map(|(k, v)| (k.as_str(), *v)))
}

fn cpu(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    sample_values(input, "cpu")
        .filter(|(name, value)| *name == "cpu_percent" && *value >= rule.threshold)
        .take(1)
        .map(|(_, value)| Occurrence {
            kind: AlertKind::Cpu,
            key: dedup_key(AlertKind::Cpu, None),
            details: format!("CPU at {:.1}% (threshold {:.1}%)", value, rule.threshold),
        })
        .collect()
}

fn blocking(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    let blocked: Vec<(&str, f64)> = sample_values(input, "blocking")
        .filter_map(|(name, value)| name.strip_prefix("blocked_session:").map(|id| (id, value)))
        .collect();
    if blocked.is_empty() || (blocked.len() as f64) < rule.threshold {
        return Vec::new();
    }
    blocked
        .into_iter()
        .map(|(session, seconds)| Occurrence {
            kind: AlertKind::Blocking,
            key: dedup_key(AlertKind::Blocking, Some(session)),
            details: format!("session {} blocked for {:.0}s", session, seconds),
        })
        .collect()
}

fn deadlocks(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    input
        .deltas
        .iter()
        .filter(|d| d.category == "deadlocks" && d.counter_name == "deadlock_count" && d.is_valid)
        .filter(|d| d.delta_value > 0.0 && d.delta_value >= rule.threshold)
        .map(|d| {
            let minute = d.interval_end.format("%Y-%m-%dT%H:%M").to_string();
            Occurrence {
                kind: AlertKind::Deadlock,
                key: dedup_key(AlertKind::Deadlock, Some(&minute)),
                details: format!("{} deadlocks between {} and {}", d.delta_value, d.interval_start, d.interval_end),
            }
        })
        .collect()
}

fn poison_waits(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    let valid = |name: String| {
        input
            .deltas
            .iter()
            .find(|d| d.category == "waits" && d.is_valid && d.counter_name == name)
            .map(|d| d.delta_value)
    };
    POISON_WAITS
        .iter()
        .filter_map(|wait| {
            let ms = valid(format!("wait_ms:{}", wait))?;
            let tasks = valid(format!("waiting_tasks:{}", wait))?;
            if tasks <= 0.0 {
                return None;
            }
            let avg = ms / tasks;
            (avg >= rule.threshold).then(|| Occurrence {
                kind: AlertKind::PoisonWait,
                key: dedup_key(AlertKind::PoisonWait, Some(wait)),
                details: format!("{} averaging {:.0} ms over {} waits", wait, avg, tasks),
            })
        })
        .collect()
}

fn long_running_queries(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    let limit = rule.threshold * 60.0;
    sample_values(input, "queries")
        .filter_map(|(name, value)| name.strip_prefix("elapsed_seconds:").map(|id| (id, value)))
        .filter(|(_, seconds)| *seconds >= limit)
        .map(|(session, seconds)| Occurrence {
            kind: AlertKind::LongRunningQuery,
            key: dedup_key(AlertKind::LongRunningQuery, Some(session)),
            details: format!("session {} running for {:.1} minutes", session, seconds / 60.0),
        })
        .collect()
}

fn tempdb(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    sample_values(input, "tempdb")
        .filter(|(name, value)| *name == "used_percent" && *value >= rule.threshold)
        .take(1)
        .map(|(_, value)| Occurrence {
            kind: AlertKind::TempDbSpace,
            key: dedup_key(AlertKind::TempDbSpace, None),
            details: format!("tempdb {:.1}% full (threshold {:.1}%)", value, rule.threshold),
        })
        .collect()
}

fn long_running_jobs(input: &EvaluationInput<'_>, rule: &AlertRule) -> Vec<Occurrence> {
    let multiplier = rule.multiplier.unwrap_or(DEFAULT_JOB_MULTIPLIER);
    let values: BTreeMap<&str, f64> = sample_values(input, "jobs").collect();
    values
        .iter()
        .filter_map(|(name, current)| {
            let job = name.strip_prefix("current_seconds:")?;
            let avg = *values.get(format!("avg_seconds:{}", job).as_str())?;
            let current = *current;
            (avg > 0.0 && current >= multiplier * avg && current >= rule.threshold * 60.0).then(|| Occurrence {
                kind: AlertKind::LongRunningJob,
                key: dedup_key(AlertKind::LongRunningJob, Some(job)),
                details: format!(
                    "job {} running {:.0}s, {:.1}x its {:.0}s average",
                    job,
                    current,
                    current / avg,
                    avg
                ),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RowFilter, ServerTarget, TimeRange};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    fn setup() -> (NamedTempFile, Arc<Store>, AlertEvaluator, Vec<AlertRule>, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut server = ServerTarget {
            name: "db1".to_string(),
            connection_ref: "db1:9400".to_string(),
            ..Default::default()
        };
        let server_id = store.add_server(&mut server).unwrap();
        let rules = store.get_alert_rules().unwrap();
        let evaluator = AlertEvaluator::load(store.clone()).unwrap();
        (tmp, store, evaluator, rules, server_id)
    }

    fn sample(server_id: i64, category: &str, min: i64, counters: &[(&str, f64)]) -> RawSample {
        RawSample {
            server_id,
            category: category.to_string(),
            collected_at: at(min),
            counters: counters.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn delta(server_id: i64, category: &str, name: &str, min: i64, value: f64) -> MetricDelta {
        MetricDelta {
            server_id,
            category: category.to_string(),
            counter_name: name.to_string(),
            interval_start: at(min - 1),
            interval_end: at(min),
            delta_value: value,
            is_valid: true,
        }
    }

    fn eval_samples(
        evaluator: &AlertEvaluator,
        rules: &[AlertRule],
        samples: &[RawSample],
        min: i64,
    ) -> AlertOutcome {
        let input = EvaluationInput {
            server_id: samples[0].server_id,
            deltas: &[],
            samples,
            reachable: Some(true),
            now: at(min),
        };
        evaluator.evaluate(&input, rules)
    }

    #[test]
    fn test_cpu_fires_once_per_window() {
        let (_tmp, store, evaluator, rules, id) = setup();

        let first = eval_samples(&evaluator, &rules, &[sample(id, "cpu", 0, &[("cpu_percent", 85.0)])], 0);
        assert_eq!(first.raised.len(), 1);
        assert_eq!(first.raised[0].kind, AlertKind::Cpu);
        for (i, cpu) in [(1, 90.0), (2, 97.0)] {
            let sustained = eval_samples(&evaluator, &rules, &[sample(id, "cpu", i, &[("cpu_percent", cpu)])], i);
            assert!(sustained.is_empty());
        }
        let dropped = eval_samples(&evaluator, &rules, &[sample(id, "cpu", 3, &[("cpu_percent", 70.0)])], 3);
        assert!(dropped.raised.is_empty());
        assert_eq!(dropped.cleared.len(), 1);
        assert_eq!(dropped.cleared[0].cleared_at, Some(at(3)));

        let events = store
            .query_alert_events(&RowFilter::default(), TimeRange::new(at(-1), at(10)))
            .unwrap();
        assert_eq!(events.len(), 1);

        let again = eval_samples(&evaluator, &rules, &[sample(id, "cpu", 4, &[("cpu_percent", 88.0)])], 4);
        assert_eq!(again.raised.len(), 1);
        assert_ne!(again.raised[0].id, first.raised[0].id);
    }

    #[test]
    fn test_escalations_dedup_until_resolved() {
        let (_tmp, store, evaluator, rules, id) = setup();
        let first = evaluator.escalate(id, AlertKind::CollectorSuspended, "7", "agent_jobs suspended".into(), at(0));
        assert!(first.is_some());
        assert!(evaluator
            .escalate(id, AlertKind::CollectorSuspended, "7", "agent_jobs suspended".into(), at(1))
            .is_none());

        // Rule evaluation leaves process-level windows alone.
        eval_samples(&evaluator, &rules, &[sample(id, "cpu", 2, &[("cpu_percent", 10.0)])], 2);
        assert_eq!(evaluator.open_buckets(AlertKind::CollectorSuspended), vec![(id, "7".to_string())]);

        let cleared = evaluator.resolve(id, AlertKind::CollectorSuspended, "7", at(3)).unwrap();
        assert_eq!(cleared.cleared_at, Some(at(3)));
        assert!(store.open_alert_events().unwrap().is_empty());
        assert!(evaluator
            .escalate(id, AlertKind::CollectorSuspended, "7", "agent_jobs suspended".into(), at(4))
            .is_some());
    }

    #[test]
    fn test_unrelated_cycle_keeps_window_open() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        eval_samples(&evaluator, &rules, &[sample(id, "cpu", 0, &[("cpu_percent", 95.0)])], 0);

        let other = eval_samples(&evaluator, &rules, &[sample(id, "tempdb", 1, &[("used_percent", 10.0)])], 1);
        assert!(other.is_empty());
        assert_eq!(evaluator.active_alerts().len(), 1);

        let again = eval_samples(&evaluator, &rules, &[sample(id, "cpu", 2, &[("cpu_percent", 96.0)])], 2);
        assert!(again.raised.is_empty());
    }

    #[test]
    fn test_open_alerts_survive_restart() {
        let (_tmp, store, evaluator, rules, id) = setup();
        eval_samples(&evaluator, &rules, &[sample(id, "cpu", 0, &[("cpu_percent", 95.0)])], 0);
        drop(evaluator);

        let reloaded = AlertEvaluator::load(store).unwrap();
        assert_eq!(reloaded.active_alerts().len(), 1);
        let again = eval_samples(&reloaded, &rules, &[sample(id, "cpu", 1, &[("cpu_percent", 97.0)])], 1);
        assert!(again.raised.is_empty());
    }

    #[test]
    fn test_blocking_one_event_per_session() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        let s = sample(id, "blocking", 0, &[("blocked_session:51", 12.0), ("blocked_session:64", 3.0)]);
        let outcome = eval_samples(&evaluator, &rules, &[s], 0);
        let mut keys: Vec<_> = outcome.raised.iter().map(|e| e.dedup_key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["blocking:51", "blocking:64"]);

        let s = sample(id, "blocking", 1, &[("blocked_session:64", 63.0)]);
        let outcome = eval_samples(&evaluator, &rules, &[s], 1);
        assert!(outcome.raised.is_empty());
        assert_eq!(outcome.cleared.len(), 1);
        assert_eq!(outcome.cleared[0].dedup_key, "blocking:51");
    }

    #[test]
    fn test_poison_wait_average() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        let deltas = vec![
            delta(id, "waits", "wait_ms:THREADPOOL", 5, 6000.0),
            delta(id, "waits", "waiting_tasks:THREADPOOL", 5, 10.0),
            delta(id, "waits", "wait_ms:RESOURCE_SEMAPHORE", 5, 100.0),
            delta(id, "waits", "waiting_tasks:RESOURCE_SEMAPHORE", 5, 10.0),
            delta(id, "waits", "wait_ms:LCK_M_X", 5, 900_000.0),
            delta(id, "waits", "waiting_tasks:LCK_M_X", 5, 1.0),
        ];
        let input = EvaluationInput { server_id: id, deltas: &deltas, samples: &[], reachable: Some(true), now: at(5) };
        let outcome = evaluator.evaluate(&input, &rules);
        assert_eq!(outcome.raised.len(), 1);
        assert_eq!(outcome.raised[0].dedup_key, "poison_wait:THREADPOOL");
    }

    #[test]
    fn test_deadlocks_bucket_by_minute() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        let first = vec![delta(id, "deadlocks", "deadlock_count", 1, 2.0)];
        let input = EvaluationInput { server_id: id, deltas: &first, samples: &[], reachable: Some(true), now: at(1) };
        assert_eq!(evaluator.evaluate(&input, &rules).raised.len(), 1);

        let second = vec![delta(id, "deadlocks", "deadlock_count", 2, 1.0)];
        let input = EvaluationInput { server_id: id, deltas: &second, samples: &[], reachable: Some(true), now: at(2) };
        let outcome = evaluator.evaluate(&input, &rules);
        assert_eq!(outcome.raised.len(), 1);
        assert_eq!(outcome.cleared.len(), 1);

        let mut reset = delta(id, "deadlocks", "deadlock_count", 3, 0.0);
        reset.is_valid = false;
        let third = vec![reset];
        let input = EvaluationInput { server_id: id, deltas: &third, samples: &[], reachable: Some(true), now: at(3) };
        assert!(evaluator.evaluate(&input, &rules).raised.is_empty());
    }

    #[test]
    fn test_long_running_job_needs_both_limits() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        let s = sample(
            id,
            "jobs",
            0,
            &[
                ("current_seconds:nightly_etl", 3600.0),
                ("avg_seconds:nightly_etl", 900.0),
                ("current_seconds:log_backup", 200.0),
                ("avg_seconds:log_backup", 20.0),
                ("current_seconds:new_job", 9000.0),
                ("avg_seconds:new_job", 0.0),
            ],
        );
        let outcome = eval_samples(&evaluator, &rules, &[s], 0);
        assert_eq!(outcome.raised.len(), 1);
        assert_eq!(outcome.raised[0].dedup_key, "long_running_job:nightly_etl");
    }

    #[test]
    fn test_connection_offline_then_restored() {
        let (_tmp, _store, evaluator, rules, id) = setup();
        let offline = EvaluationInput { server_id: id, deltas: &[], samples: &[], reachable: Some(false), now: at(0) };
        let outcome = evaluator.evaluate(&offline, &rules);
        assert_eq!(outcome.raised[0].dedup_key, "connection_change:offline");
        assert!(evaluator.evaluate(&EvaluationInput { now: at(1), ..offline.clone() }, &rules).is_empty());

        let online = EvaluationInput { reachable: Some(true), now: at(2), ..offline.clone() };
        let outcome = evaluator.evaluate(&online, &rules);
        assert_eq!(outcome.raised.len(), 1);
        assert_eq!(outcome.raised[0].dedup_key, "connection_change:restored");
        assert_eq!(outcome.cleared[0].dedup_key, "connection_change:offline");

        let steady = evaluator.evaluate(&EvaluationInput { now: at(3), ..online }, &rules);
        assert!(steady.raised.is_empty());
        assert_eq!(steady.cleared[0].dedup_key, "connection_change:restored");
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let (_tmp, _store, evaluator, mut rules, id) = setup();
        for rule in rules.iter_mut().filter(|r| r.kind == AlertKind::TempDbSpace) {
            rule.enabled = false;
        }
        let outcome = eval_samples(&evaluator, &rules, &[sample(id, "tempdb", 0, &[("used_percent", 99.0)])], 0);
        assert!(outcome.is_empty());
    }
}
