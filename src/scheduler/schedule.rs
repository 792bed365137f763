//! Collector definitions and per (server, collector) schedule state.

use crate::db::{CollectorDefinition, DbError, RunStatus, ScheduleState, ServerTarget, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown collector {0}")]
    UnknownCollector(i64),
    #[error("server {0} is already being polled")]
    Busy(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A collector that has been `Running` far longer than its interval.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HungCollector {
    pub server_id: i64,
    pub collector_id: i64,
    pub collector_name: String,
    pub running_since: DateTime<Utc>,
    pub interval_minutes: i64,
}

struct Inner {
    collectors: BTreeMap<i64, CollectorDefinition>,
    states: HashMap<(i64, i64), ScheduleState>,
}

/// Decides which collectors are due and tracks their run state.
///
/// State is kept in memory and written through to the store on every
/// transition. The in-memory copy is authoritative for the single-`Running`
/// invariant.
pub struct ScheduleManager {
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

impl ScheduleManager {
    /// Load definitions and state. Pairs left `Running` by a previous process
    /// are marked `Skipped` and become due immediately.
    pub fn load(store: Arc<Store>) -> Result<Self, ScheduleError> {
        let collectors = store
            .get_collectors()?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let mut states = HashMap::new();
        for mut state in store.get_schedule_states()? {
            if state.is_running() {
                tracing::warn!(
                    "Schedule: server {} collector {} was running at shutdown, marking skipped",
                    state.server_id,
                    state.collector_id
                );
                state.last_status = Some(RunStatus::Skipped);
                state.running_since = None;
                state.next_due_at = None;
                store.save_schedule_state(&state)?;
            }
            states.insert((state.server_id, state.collector_id), state);
        }

        Ok(Self {
            store,
            inner: Mutex::new(Inner { collectors, states }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &ScheduleState) {
        if let Err(e) = self.store.save_schedule_state(state) {
            tracing::error!(
                "Schedule: failed to persist state for server {} collector {}: {}",
                state.server_id,
                state.collector_id,
                e
            );
        }
    }

    pub fn collectors(&self) -> Vec<CollectorDefinition> {
        self.lock().collectors.values().cloned().collect()
    }

    pub fn collector(&self, id: i64) -> Option<CollectorDefinition> {
        self.lock().collectors.get(&id).cloned()
    }

    pub fn state(&self, server_id: i64, collector_id: i64) -> Option<ScheduleState> {
        self.lock().states.get(&(server_id, collector_id)).cloned()
    }

    /// Enabled collectors whose next run is due and that are neither running
    /// nor suspended. Empty for disabled or deleted servers.
    pub fn due_collectors(&self, server: &ServerTarget, now: DateTime<Utc>) -> Vec<CollectorDefinition> {
        if !server.is_active() {
            return Vec::new();
        }
        let inner = self.lock();
        inner
            .collectors
            .values()
            .filter(|c| c.enabled)
            .filter(|c| match inner.states.get(&(server.id, c.id)) {
                None => true,
                Some(state) => {
                    !state.is_running()
                        && state.suspended_reason.is_none()
                        && state.next_due_at.map_or(true, |due| due <= now)
                }
            })
            .cloned()
            .collect()
    }

    /// Enabled collectors that may be started on demand, ignoring due time.
    pub fn runnable_collectors(&self, server: &ServerTarget) -> Vec<CollectorDefinition> {
        if !server.is_active() {
            return Vec::new();
        }
        let inner = self.lock();
        inner
            .collectors
            .values()
            .filter(|c| c.enabled)
            .filter(|c| {
                inner
                    .states
                    .get(&(server.id, c.id))
                    .map_or(true, |s| !s.is_running() && s.suspended_reason.is_none())
            })
            .cloned()
            .collect()
    }

    /// Transition a pair to `Running`. Returns false if it already is.
    pub fn mark_running(&self, server_id: i64, collector_id: i64, at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let state = inner
            .states
            .entry((server_id, collector_id))
            .or_insert_with(|| ScheduleState::new(server_id, collector_id));
        if state.is_running() {
            return false;
        }
        state.last_status = Some(RunStatus::Running);
        state.running_since = Some(at);
        let snapshot = state.clone();
        drop(inner);

        self.persist(&snapshot);
        true
    }

    /// Record a terminal status for a run that started at `started_at`.
    ///
    /// The next run is due one interval after the start, except after a
    /// timeout, which leaves the pair due immediately.
    pub fn mark_completed(
        &self,
        server_id: i64,
        collector_id: i64,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) -> Option<ScheduleState> {
        if status == RunStatus::Running {
            tracing::error!("Schedule: refusing to complete a run with status running");
            return None;
        }
        let mut inner = self.lock();
        let interval = inner
            .collectors
            .get(&collector_id)
            .map(|c| c.interval_minutes)
            .unwrap_or(1);
        let state = inner
            .states
            .entry((server_id, collector_id))
            .or_insert_with(|| ScheduleState::new(server_id, collector_id));

        state.last_run_at = Some(started_at);
        state.last_status = Some(status);
        state.running_since = None;
        state.next_due_at = Some(match status {
            RunStatus::Timeout => started_at,
            _ => started_at + ChronoDuration::minutes(interval),
        });
        match status {
            RunStatus::Success => state.consecutive_failures = 0,
            RunStatus::Error | RunStatus::Timeout => state.consecutive_failures += 1,
            RunStatus::Skipped | RunStatus::Running => {}
        }
        let snapshot = state.clone();
        drop(inner);

        self.persist(&snapshot);
        Some(snapshot)
    }

    /// Pairs stuck in `Running` for longer than `multiplier` intervals.
    pub fn hung_collectors(&self, now: DateTime<Utc>, multiplier: f64) -> Vec<HungCollector> {
        let inner = self.lock();
        let mut hung: Vec<HungCollector> = inner
            .states
            .values()
            .filter(|s| s.is_running())
            .filter_map(|s| {
                let def = inner.collectors.get(&s.collector_id)?;
                let since = s.running_since?;
                let limit = ChronoDuration::milliseconds((def.interval_minutes as f64 * 60_000.0 * multiplier) as i64);
                (now - since > limit).then(|| HungCollector {
                    server_id: s.server_id,
                    collector_id: s.collector_id,
                    collector_name: def.name.clone(),
                    running_since: since,
                    interval_minutes: def.interval_minutes,
                })
            })
            .collect();
        hung.sort_by_key(|h| (h.server_id, h.collector_id));
        hung
    }

    /// Change a collector's interval. Rejects anything below one minute.
    pub fn update_interval(&self, collector_id: i64, minutes: i64) -> Result<CollectorDefinition, ScheduleError> {
        if minutes < 1 {
            return Err(ScheduleError::Validation(format!(
                "interval must be at least 1 minute, got {}",
                minutes
            )));
        }
        let mut inner = self.lock();
        let def = inner
            .collectors
            .get_mut(&collector_id)
            .ok_or(ScheduleError::UnknownCollector(collector_id))?;
        let mut updated = def.clone();
        updated.interval_minutes = minutes;
        self.store.update_collector(&updated)?;
        *def = updated.clone();

        let mut changed = Vec::new();
        for state in inner.states.values_mut().filter(|s| s.collector_id == collector_id) {
            if let (false, Some(last)) = (state.is_running(), state.last_run_at) {
                if state.last_status != Some(RunStatus::Timeout) {
                    state.next_due_at = Some(last + ChronoDuration::minutes(minutes));
                    changed.push(state.clone());
                }
            }
        }
        drop(inner);

        for state in &changed {
            self.persist(state);
        }
        tracing::info!("Schedule: collector {} interval set to {} minutes", updated.name, minutes);
        Ok(updated)
    }

    /// Register a new collector for an adapter-provided category.
    pub fn add_collector(&self, mut def: CollectorDefinition) -> Result<CollectorDefinition, ScheduleError> {
        if def.interval_minutes < 1 {
            return Err(ScheduleError::Validation(format!(
                "interval must be at least 1 minute, got {}",
                def.interval_minutes
            )));
        }
        if def.name.trim().is_empty() || def.category.trim().is_empty() {
            return Err(ScheduleError::Validation("collector name and category are required".into()));
        }
        let mut inner = self.lock();
        if inner.collectors.values().any(|c| c.name == def.name) {
            return Err(ScheduleError::Validation(format!("collector {} already exists", def.name)));
        }
        self.store.add_collector(&mut def)?;
        inner.collectors.insert(def.id, def.clone());
        tracing::info!("Schedule: added collector {} ({})", def.name, def.category);
        Ok(def)
    }

    pub fn set_enabled(&self, collector_id: i64, enabled: bool) -> Result<CollectorDefinition, ScheduleError> {
        let mut inner = self.lock();
        let def = inner
            .collectors
            .get_mut(&collector_id)
            .ok_or(ScheduleError::UnknownCollector(collector_id))?;
        let mut updated = def.clone();
        updated.enabled = enabled;
        self.store.update_collector(&updated)?;
        *def = updated.clone();
        Ok(updated)
    }

    /// Stop scheduling a pair until an operator resumes it.
    pub fn suspend(&self, server_id: i64, collector_id: i64, reason: &str) {
        let mut inner = self.lock();
        let state = inner
            .states
            .entry((server_id, collector_id))
            .or_insert_with(|| ScheduleState::new(server_id, collector_id));
        state.suspended_reason = Some(reason.to_string());
        let snapshot = state.clone();
        drop(inner);
        self.persist(&snapshot);
    }

    /// Clear a suspension; the pair becomes due immediately.
    pub fn resume(&self, server_id: i64, collector_id: i64) -> bool {
        let mut inner = self.lock();
        let Some(state) = inner.states.get_mut(&(server_id, collector_id)) else {
            return false;
        };
        if state.suspended_reason.take().is_none() {
            return false;
        }
        state.next_due_at = None;
        state.consecutive_failures = 0;
        let snapshot = state.clone();
        drop(inner);
        self.persist(&snapshot);
        true
    }

    /// Forget in-memory state for a deleted server. Persisted rows remain.
    pub fn deactivate_server(&self, server_id: i64) {
        self.lock().states.retain(|(id, _), _| *id != server_id);
    }

    /// Number of pairs currently `Running`.
    #[cfg(test)]
    pub fn running_count(&self) -> usize {
        self.lock().states.values().filter(|s| s.is_running()).count()
    }
}
