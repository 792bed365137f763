//! Scheduler module for running collectors and storing their results.

mod retention;
mod schedule;

pub use retention::*;
pub use schedule::*;

use crate::alert::{AlertEvaluator, AlertOutcome, EvaluationInput};
use crate::collector::{CollectorAdapter, CollectorError, ErrorClass};
use crate::db::{
    AlertEvent, AlertKind, CollectionRun, CollectorDefinition, DbError, MetricDelta, RawSample, RunBatch, RunStatus, ServerTarget, Store,
};
use crate::delta::DeltaEngine;
use crate::events::{EventBus, MonitorEvent};
use crate::settings::Settings;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

/// Consecutive transient failures after which every further failure is logged at warn.
const FAILURE_WARN_THRESHOLD: i64 = 3;

const WRITE_QUEUE_SIZE: usize = 1000;

/// Result of one server cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub server_id: i64,
    pub runs: Vec<CollectionRun>,
    pub alerts: AlertOutcome,
}

impl CycleReport {
    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }
}

/// A batch for the writer task and the channel its commit result goes back on.
struct WriteRequest {
    batch: RunBatch,
    ack: oneshot::Sender<Result<i64, String>>,
}

/// Servers currently being polled, with the abort handle of their cycle.
type PollingMap = HashMap<i64, Option<AbortHandle>>;

/// Size of the permit pool and the permits still owed from a shrink.
///
/// A shrink forgets idle permits at once. Permits held by running cycles
/// cannot be forgotten, so they are recorded as debt and retired as they
/// come back.
#[derive(Debug, Default)]
struct Pool {
    size: usize,
    debt: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a server as Polling for as long as it lives.
///
/// Dropping the guard, including when the cycle task is aborted, returns
/// the server to Idle.
struct PollingGuard {
    server_id: i64,
    polling: Arc<Mutex<PollingMap>>,
    idle: Arc<Notify>,
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        let mut polling = lock(&self.polling);
        polling.remove(&self.server_id);
        if polling.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Runs due collectors against every enabled server.
pub struct Orchestrator {
    store: Arc<Store>,
    schedule: Arc<ScheduleManager>,
    deltas: Arc<DeltaEngine>,
    alerts: Arc<AlertEvaluator>,
    adapter: Arc<dyn CollectorAdapter>,
    settings: watch::Receiver<Arc<Settings>>,
    bus: EventBus,
    semaphore: Arc<Semaphore>,
    pool: Mutex<Pool>,
    polling: Arc<Mutex<PollingMap>>,
    idle: Arc<Notify>,
    paused: AtomicBool,
    stopping: AtomicBool,
    /// Deleted servers; ids are never reused.
    retired: Mutex<HashSet<i64>>,
    writer_tx: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: broadcast::Sender<()>,
}

impl Orchestrator {
    /// Create an orchestrator and start its writer task.
    pub fn new(
        store: Arc<Store>,
        schedule: Arc<ScheduleManager>,
        deltas: Arc<DeltaEngine>,
        alerts: Arc<AlertEvaluator>,
        adapter: Arc<dyn CollectorAdapter>,
        settings: watch::Receiver<Arc<Settings>>,
        bus: EventBus,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));
        let pool_size = settings.borrow().max_concurrency;
        let (stop_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            store,
            schedule,
            deltas,
            alerts,
            adapter,
            settings,
            bus,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            pool: Mutex::new(Pool { size: pool_size, debt: 0 }),
            polling: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            retired: Mutex::new(HashSet::new()),
            writer_tx: Mutex::new(Some(tx)),
            writer_handle: Mutex::new(Some(writer)),
            loop_handle: Mutex::new(None),
            stop_tx,
        })
    }

    pub fn schedule(&self) -> &Arc<ScheduleManager> {
        &self.schedule
    }

    pub fn alerts(&self) -> &Arc<AlertEvaluator> {
        &self.alerts
    }

    /// Start the tick loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut settings_rx = self.settings.clone();

        let handle = tokio::spawn(async move {
            let mut period = settings_rx.borrow().tick_interval();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("Orchestrator: started, ticking every {:?}", period);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    changed = settings_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = settings_rx.borrow().tick_interval();
                        if next != period {
                            tracing::info!("Orchestrator: tick interval changed to {:?}", next);
                            period = next;
                            interval = tokio::time::interval(period);
                            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        }
                    }
                    _ = interval.tick() => {
                        this.tick(Utc::now());
                    }
                }
            }
            tracing::info!("Orchestrator: tick loop stopped");
        });
        *lock(&self.loop_handle) = Some(handle);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Orchestrator: paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("Orchestrator: resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Servers with a cycle in flight.
    pub fn polling_servers(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.polling).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Dispatch one cycle per idle server that has due collectors.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<CycleReport>> {
        if self.is_paused() || self.stopping.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.resize_pool();
        self.report_hung(now);

        let servers = match self.store.get_servers() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Orchestrator: failed to load servers: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for server in servers.into_iter().filter(|s| s.is_active()) {
            let due = self.schedule.due_collectors(&server, now);
            if due.is_empty() {
                continue;
            }
            match self.spawn_cycle(server, due, now) {
                Some(handle) => handles.push(handle),
                None => tracing::debug!("Orchestrator: server still polling, skipping this tick"),
            }
        }
        handles
    }

    /// Run every enabled, non-suspended collector for a server now,
    /// regardless of due time or pause.
    pub fn run_now(self: &Arc<Self>, server_id: i64) -> Result<JoinHandle<CycleReport>, ScheduleError> {
        let server = self.store.get_server(server_id)?;
        if !server.is_active() {
            return Err(ScheduleError::Db(DbError::NotFound));
        }
        let collectors = self.schedule.runnable_collectors(&server);
        tracing::info!("Orchestrator: manual run of {} collectors on {}", collectors.len(), server.name);
        self.spawn_cycle(server, collectors, Utc::now())
            .ok_or(ScheduleError::Busy(server_id))
    }

    /// Drop all in-memory state held for a deleted server.
    ///
    /// A cycle already in flight for the server stops before its next
    /// collector and evicts again on the way out.
    pub fn forget_server(&self, server_id: i64) {
        lock(&self.retired).insert(server_id);
        self.evict(server_id);
    }

    fn evict(&self, server_id: i64) {
        self.deltas.evict_server(server_id);
        self.schedule.deactivate_server(server_id);
        self.alerts.forget_server(server_id);
    }

    fn is_retired(&self, server_id: i64) -> bool {
        lock(&self.retired).contains(&server_id)
    }

    /// Clear a suspended collector and close its suspension alert.
    pub fn resume_collector(&self, server_id: i64, collector_id: i64) -> bool {
        if !self.schedule.resume(server_id, collector_id) {
            return false;
        }
        self.settle(server_id, AlertKind::CollectorSuspended, &collector_id.to_string());
        true
    }

    /// Open a process-level alert and hand it to the notifiers.
    fn escalate(&self, server_id: i64, kind: AlertKind, bucket: &str, details: String) -> Option<AlertEvent> {
        let event = self.alerts.escalate(server_id, kind, bucket, details, Utc::now())?;
        self.bus.publish(MonitorEvent::AlertRaised(event.clone()));
        Some(event)
    }

    fn settle(&self, server_id: i64, kind: AlertKind, bucket: &str) {
        if let Some(event) = self.alerts.resolve(server_id, kind, bucket, Utc::now()) {
            self.bus.publish(MonitorEvent::AlertCleared(event));
        }
    }

    fn spawn_cycle(
        self: &Arc<Self>,
        server: ServerTarget,
        collectors: Vec<CollectorDefinition>,
        scheduled_at: DateTime<Utc>,
    ) -> Option<JoinHandle<CycleReport>> {
        let writer = lock(&self.writer_tx).clone()?;
        {
            let mut polling = lock(&self.polling);
            if polling.contains_key(&server.id) {
                return None;
            }
            polling.insert(server.id, None);
        }
        let guard = PollingGuard {
            server_id: server.id,
            polling: self.polling.clone(),
            idle: self.idle.clone(),
        };

        let server_id = server.id;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let report = this.run_cycle(server, collectors, scheduled_at, writer).await;
            if this.is_retired(server_id) {
                this.evict(server_id);
            }
            report
        });

        if let Some(slot) = lock(&self.polling).get_mut(&server_id) {
            *slot = Some(handle.abort_handle());
        }
        Some(handle)
    }

    async fn run_cycle(
        &self,
        server: ServerTarget,
        collectors: Vec<CollectorDefinition>,
        scheduled_at: DateTime<Utc>,
        writer: mpsc::Sender<WriteRequest>,
    ) -> CycleReport {
        let mut report = CycleReport {
            server_id: server.id,
            ..Default::default()
        };
        let Some(_permit) = self.acquire_slot().await else {
            return report;
        };
        let settings = self.settings.borrow().clone();

        let mut samples: Vec<RawSample> = Vec::new();
        let mut deltas: Vec<MetricDelta> = Vec::new();
        let mut attempted = 0;
        let mut connectivity_failures = 0;
        let mut escalated: Vec<AlertEvent> = Vec::new();

        for def in collectors {
            if self.is_retired(server.id) {
                break;
            }
            if !self.schedule.mark_running(server.id, def.id, scheduled_at) {
                continue;
            }
            attempted += 1;

            let started_at = Utc::now();
            let clock = Instant::now();
            let result = tokio::time::timeout(settings.run_timeout(), self.adapter.collect(&server, &def.category)).await;
            let duration_ms = clock.elapsed().as_millis() as i64;

            let mut run = CollectionRun {
                id: 0,
                server_id: server.id,
                collector_id: def.id,
                started_at,
                ended_at: Utc::now(),
                status: RunStatus::Success,
                duration_ms,
                error_message: None,
            };
            let mut batch_sample = None;
            let mut batch_deltas = Vec::new();
            let mut failure: Option<CollectorError> = None;

            match result {
                Ok(Ok(mut sample)) => {
                    sample.server_id = server.id;
                    sample.category = def.category.clone();
                    batch_deltas = self.deltas.observe(&sample, def.counter_kind);
                    tracing::debug!(
                        "Orchestrator: {} on {} returned {} counters, {} deltas",
                        def.name,
                        server.name,
                        sample.counters.len(),
                        batch_deltas.len()
                    );
                    batch_sample = Some(sample);
                }
                Ok(Err(e)) => {
                    tracing::error!("Orchestrator: {} failed on {}: {}", def.name, server.name, e);
                    run.status = RunStatus::Error;
                    run.error_message = Some(e.to_string());
                    if e.is_connectivity() {
                        connectivity_failures += 1;
                    }
                    failure = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Orchestrator: {} on {} timed out after {:?}",
                        def.name,
                        server.name,
                        settings.run_timeout()
                    );
                    run.status = RunStatus::Timeout;
                    run.error_message = Some(format!("timed out after {}s", settings.run_timeout_secs));
                }
            }

            if self.is_retired(server.id) {
                tracing::debug!("Orchestrator: server {} deleted mid-cycle, dropping {} run", server.id, def.name);
                break;
            }

            let batch = RunBatch {
                run: run.clone(),
                sample: batch_sample,
                deltas: batch_deltas,
            };
            match submit(&writer, batch).await {
                Ok((id, batch)) => {
                    run.id = id;
                    samples.extend(batch.sample);
                    deltas.extend(batch.deltas);
                    self.settle(server.id, AlertKind::StoreWriteFailure, &def.id.to_string());
                }
                Err(e) => {
                    tracing::error!("Orchestrator: failed to store {} run for {}: {}", def.name, server.name, e);
                    let details = format!("results of {} could not be stored: {}", def.name, e);
                    escalated.extend(self.escalate(
                        server.id,
                        AlertKind::StoreWriteFailure,
                        &def.id.to_string(),
                        details,
                    ));
                    self.bus.publish(MonitorEvent::StoreWriteFailed {
                        server_id: server.id,
                        collector_id: def.id,
                        error: e,
                    });
                }
            }

            let state = self.schedule.mark_completed(server.id, def.id, run.status, scheduled_at);

            if let Some(e) = failure {
                match e.class() {
                    ErrorClass::Configuration => {
                        let reason = e.to_string();
                        tracing::warn!(
                            "Orchestrator: suspending {} on {} until resumed: {}",
                            def.name,
                            server.name,
                            reason
                        );
                        self.schedule.suspend(server.id, def.id, &reason);
                        let details = format!("{} suspended until resumed: {}", def.name, reason);
                        escalated.extend(self.escalate(
                            server.id,
                            AlertKind::CollectorSuspended,
                            &def.id.to_string(),
                            details,
                        ));
                        self.bus.publish(MonitorEvent::CollectorSuspended {
                            server_id: server.id,
                            collector_id: def.id,
                            reason,
                        });
                    }
                    ErrorClass::Transient => {
                        if let Some(state) = state.filter(|s| s.consecutive_failures >= FAILURE_WARN_THRESHOLD) {
                            tracing::warn!(
                                "Orchestrator: {} on {} has failed {} times in a row",
                                def.name,
                                server.name,
                                state.consecutive_failures
                            );
                        }
                    }
                }
            }

            self.bus.publish(MonitorEvent::RunCompleted {
                server_id: server.id,
                collector_id: def.id,
                status: run.status,
            });
            report.runs.push(run);
        }

        if self.is_retired(server.id) {
            return report;
        }

        let reachable = (attempted > 0).then(|| connectivity_failures < attempted);
        let input = EvaluationInput {
            server_id: server.id,
            deltas: &deltas,
            samples: &samples,
            reachable,
            now: Utc::now(),
        };
        let mut outcome = self.alerts.evaluate(&input, &settings.alert_rules);
        for event in &outcome.raised {
            self.bus.publish(MonitorEvent::AlertRaised(event.clone()));
        }
        for event in &outcome.cleared {
            self.bus.publish(MonitorEvent::AlertCleared(event.clone()));
        }
        escalated.append(&mut outcome.raised);
        outcome.raised = escalated;
        report.alerts = outcome;
        report
    }

    /// Grow or shrink the global permit pool to match settings.
    fn resize_pool(&self) {
        let wanted = self.settings.borrow().max_concurrency;
        let mut pool = lock(&self.pool);
        if wanted == pool.size {
            return;
        }
        if wanted > pool.size {
            let grow = wanted - pool.size;
            let repaid = grow.min(pool.debt);
            pool.debt -= repaid;
            self.semaphore.add_permits(grow - repaid);
        } else {
            let shrink = pool.size - wanted;
            let forgotten = self.semaphore.forget_permits(shrink);
            pool.debt += shrink - forgotten;
        }
        tracing::info!("Orchestrator: concurrency limit {} -> {}", pool.size, wanted);
        pool.size = wanted;
    }

    /// Take a permit, retiring any that a shrink still owes.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        loop {
            let permit = self.semaphore.clone().acquire_owned().await.ok()?;
            {
                let mut pool = lock(&self.pool);
                if pool.debt == 0 {
                    return Some(permit);
                }
                pool.debt -= 1;
            }
            permit.forget();
        }
    }

    /// Raise one alert per stuck run and close the alerts of runs that ended.
    fn report_hung(&self, now: DateTime<Utc>) {
        let multiplier = self.settings.borrow().hung_multiplier;
        let hung = self.schedule.hung_collectors(now, multiplier);
        let current: HashSet<(i64, String)> = hung
            .iter()
            .map(|h| (h.server_id, hung_bucket(h.collector_id, h.running_since)))
            .collect();

        for (server_id, bucket) in self.alerts.open_buckets(AlertKind::CollectorHung) {
            if !current.contains(&(server_id, bucket.clone())) {
                self.settle(server_id, AlertKind::CollectorHung, &bucket);
            }
        }

        for h in &hung {
            let details = format!(
                "{} running since {}, interval {} min",
                h.collector_name, h.running_since, h.interval_minutes
            );
            let bucket = hung_bucket(h.collector_id, h.running_since);
            if self.escalate(h.server_id, AlertKind::CollectorHung, &bucket, details).is_none() {
                continue;
            }
            tracing::warn!(
                "Orchestrator: {} on server {} has been running since {} (interval {} min)",
                h.collector_name,
                h.server_id,
                h.running_since,
                h.interval_minutes
            );
            self.bus.publish(MonitorEvent::HungCollector {
                server_id: h.server_id,
                collector_id: h.collector_id,
                running_since: h.running_since,
            });
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if lock(&self.polling).is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop ticking, give in-flight cycles one run timeout to finish, abort
    /// the rest and drain the writer queue.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
        let loop_handle = lock(&self.loop_handle).take();
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }

        let grace = self.settings.borrow().run_timeout();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            let handles: Vec<AbortHandle> = lock(&self.polling).values().flatten().cloned().collect();
            tracing::warn!("Orchestrator: aborting {} cycles still running after {:?}", handles.len(), grace);
            for handle in handles {
                handle.abort();
            }
            self.wait_idle().await;
        }

        lock(&self.writer_tx).take();
        let writer = lock(&self.writer_handle).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        tracing::info!("Orchestrator: shut down");
    }
}

fn hung_bucket(collector_id: i64, running_since: DateTime<Utc>) -> String {
    format!("{}@{}", collector_id, running_since.timestamp_millis())
}

/// Hand a batch to the writer and wait until it is committed.
async fn submit(writer: &mpsc::Sender<WriteRequest>, batch: RunBatch) -> Result<(i64, RunBatch), String> {
    let (ack_tx, ack_rx) = oneshot::channel();
    let request = WriteRequest {
        batch: batch.clone(),
        ack: ack_tx,
    };
    writer
        .send(request)
        .await
        .map_err(|_| "writer queue closed".to_string())?;
    let id = ack_rx.await.map_err(|_| "writer dropped the batch".to_string())??;
    Ok((id, batch))
}

/// Single writer: every collection batch is committed here, one transaction each.
async fn run_batch_writer(mut rx: mpsc::Receiver<WriteRequest>, store: Arc<Store>) {
    while let Some(request) = rx.recv().await {
        let result = store.append_run_batch(&request.batch).map_err(|e| e.to_string());
        if let Err(e) = &result {
            tracing::error!("Writer: failed to append batch: {}", e);
        }
        let _ = request.ack.send(result);
    }
    tracing::debug!("Writer: queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{spawn_dispatcher, Notifier, NotifyError};
    use crate::db::{RowFilter, TimeRange};
    use crate::settings::SettingsHandle;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct FakeAdapter {
        calls: AtomicU64,
        fail: Mutex<Option<CollectorError>>,
        hang: AtomicBool,
        /// Hang only on this category.
        hang_on: Mutex<Option<String>>,
        /// Hold every call until released.
        gated: AtomicBool,
        release: Notify,
        delay_ms: AtomicU64,
        in_flight: AtomicU64,
        peak_in_flight: AtomicU64,
        cpu_percent: Mutex<f64>,
    }

    #[async_trait]
    impl CollectorAdapter for FakeAdapter {
        async fn collect(&self, server: &ServerTarget, category: &str) -> Result<RawSample, CollectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let result = self.respond(n, server, category).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl FakeAdapter {
        async fn respond(&self, n: u64, server: &ServerTarget, category: &str) -> Result<RawSample, CollectorError> {
            let hang_here = lock(&self.hang_on).as_deref() == Some(category);
            if self.hang.load(Ordering::SeqCst) || hang_here {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.gated.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Some(e) = lock(&self.fail).clone() {
                return Err(e);
            }
            let mut counters = std::collections::BTreeMap::new();
            counters.insert("wait_ms:LCK_M_S".to_string(), (n * 100) as f64);
            counters.insert("cpu_percent".to_string(), *lock(&self.cpu_percent));
            Ok(RawSample {
                server_id: server.id,
                category: category.to_string(),
                collected_at: Utc::now(),
                counters,
            })
        }
    }

    struct Fixture {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        settings: SettingsHandle,
        adapter: Arc<FakeAdapter>,
        deltas: Arc<DeltaEngine>,
        orchestrator: Arc<Orchestrator>,
        bus: EventBus,
        server_id: i64,
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    /// One server with only the named collectors enabled.
    fn fixture(enabled: &[&str]) -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut server = ServerTarget {
            name: "db1".to_string(),
            connection_ref: "db1:9400".to_string(),
            ..Default::default()
        };
        let server_id = store.add_server(&mut server).unwrap();

        let schedule = Arc::new(ScheduleManager::load(store.clone()).unwrap());
        for def in schedule.collectors() {
            schedule.set_enabled(def.id, enabled.contains(&def.name.as_str())).unwrap();
        }
        let settings = SettingsHandle::load(store.clone()).unwrap();
        let adapter = Arc::new(FakeAdapter::default());
        let bus = EventBus::new();
        let deltas = Arc::new(DeltaEngine::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            schedule,
            deltas.clone(),
            Arc::new(AlertEvaluator::load(store.clone()).unwrap()),
            adapter.clone(),
            settings.subscribe(),
            bus.clone(),
        );
        Fixture { _tmp: tmp, store, settings, adapter, deltas, orchestrator, bus, server_id }
    }

    async fn run_tick(orchestrator: &Arc<Orchestrator>, now: DateTime<Utc>) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for handle in orchestrator.tick(now) {
            reports.push(handle.await.unwrap());
        }
        reports
    }

    fn collector_id(f: &Fixture, name: &str) -> i64 {
        f.orchestrator.schedule().collectors().into_iter().find(|c| c.name == name).unwrap().id
    }

    #[tokio::test]
    async fn test_thirty_minutes_of_ticks_runs_every_five_minutes() {
        let f = fixture(&["wait_stats"]);
        for i in 0..60 {
            run_tick(&f.orchestrator, at(i * 30)).await;
        }
        let waits = collector_id(&f, "wait_stats");
        assert_eq!(f.store.count_runs(f.server_id, waits, RunStatus::Success).unwrap(), 6);
        assert_eq!(f.adapter.calls.load(Ordering::SeqCst), 6);

        // First sample is the baseline, each later one yields a delta.
        let deltas = f
            .store
            .query_deltas(&RowFilter::default(), TimeRange::new(at(-86_400), Utc::now() + ChronoDuration::days(1)))
            .unwrap();
        assert_eq!(deltas.iter().filter(|d| d.counter_name == "wait_ms:LCK_M_S").count(), 5);
        assert!(deltas.iter().all(|d| d.delta_value == 100.0 || d.counter_name != "wait_ms:LCK_M_S"));
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_polling_server_not_dispatched_twice() {
        let f = fixture(&["cpu_utilization"]);
        f.adapter.hang.store(true, Ordering::SeqCst);

        let first = f.orchestrator.tick(at(0));
        assert_eq!(first.len(), 1);
        tokio::task::yield_now().await;
        assert!(f.orchestrator.tick(at(60)).is_empty());
        assert_eq!(f.orchestrator.polling_servers(), vec![f.server_id]);
        let busy = tokio_test::assert_err!(f.orchestrator.run_now(f.server_id));
        assert!(matches!(busy, ScheduleError::Busy(_)));

        f.settings.update(|s| s.run_timeout_secs = 1).unwrap();
        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.polling_servers().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_records_run_and_is_due_again() {
        let f = fixture(&["cpu_utilization"]);
        f.settings.update(|s| s.run_timeout_secs = 1).unwrap();
        f.adapter.hang.store(true, Ordering::SeqCst);

        let reports = run_tick(&f.orchestrator, at(0)).await;
        assert_eq!(reports[0].count(RunStatus::Timeout), 1);

        let cpu = collector_id(&f, "cpu_utilization");
        let state = f.orchestrator.schedule().state(f.server_id, cpu).unwrap();
        assert_eq!(state.last_status, Some(RunStatus::Timeout));
        assert_eq!(state.next_due_at, Some(at(0)));
        assert_eq!(f.store.count_runs(f.server_id, cpu, RunStatus::Timeout).unwrap(), 1);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_connectivity_failure_records_error_and_alerts() {
        let f = fixture(&["wait_stats", "cpu_utilization"]);
        *lock(&f.adapter.fail) = Some(CollectorError::Connectivity("connection refused".into()));
        let mut events = f.bus.subscribe();

        let reports = run_tick(&f.orchestrator, at(0)).await;
        assert_eq!(reports[0].count(RunStatus::Error), 2);
        assert_eq!(reports[0].alerts.raised.len(), 1);
        assert_eq!(reports[0].alerts.raised[0].kind, AlertKind::ConnectionChange);

        let waits = collector_id(&f, "wait_stats");
        let state = f.orchestrator.schedule().state(f.server_id, waits).unwrap();
        assert_eq!(state.next_due_at, Some(at(300)));
        assert_eq!(state.consecutive_failures, 1);

        let mut raised = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MonitorEvent::AlertRaised(_)) {
                raised += 1;
            }
        }
        assert_eq!(raised, 1);

        *lock(&f.adapter.fail) = None;
        let reports = run_tick(&f.orchestrator, at(300)).await;
        assert!(reports[0]
            .alerts
            .raised
            .iter()
            .any(|e| e.dedup_key == "connection_change:restored"));
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_permission_error_suspends_collector() {
        let f = fixture(&["agent_jobs"]);
        *lock(&f.adapter.fail) = Some(CollectorError::Permission("msdb access denied".into()));
        let mut events = f.bus.subscribe();

        run_tick(&f.orchestrator, at(0)).await;
        let jobs = collector_id(&f, "agent_jobs");
        let state = f.orchestrator.schedule().state(f.server_id, jobs).unwrap();
        assert!(state.suspended_reason.unwrap().contains("msdb"));

        let mut suspended = false;
        while let Ok(event) = events.try_recv() {
            suspended |= matches!(event, MonitorEvent::CollectorSuspended { .. });
        }
        assert!(suspended);

        assert!(run_tick(&f.orchestrator, at(3600)).await.is_empty());
        assert_eq!(f.orchestrator.alerts().open_buckets(AlertKind::CollectorSuspended), vec![(f.server_id, jobs.to_string())]);
        assert!(f.orchestrator.resume_collector(f.server_id, jobs));
        assert!(f.orchestrator.alerts().open_buckets(AlertKind::CollectorSuspended).is_empty());
        *lock(&f.adapter.fail) = None;
        let reports = run_tick(&f.orchestrator, at(3660)).await;
        assert_eq!(reports[0].count(RunStatus::Success), 1);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_stops_ticks_but_not_manual_runs() {
        let f = fixture(&["cpu_utilization"]);
        f.orchestrator.pause();
        assert!(f.orchestrator.tick(at(0)).is_empty());

        let handle = tokio_test::assert_ok!(f.orchestrator.run_now(f.server_id));
        let report = handle.await.unwrap();
        assert_eq!(report.count(RunStatus::Success), 1);

        f.orchestrator.resume();
        assert!(!f.orchestrator.is_paused());
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cpu_alert_raised_once_across_cycles() {
        let f = fixture(&["cpu_utilization"]);
        let mut raised = Vec::new();
        for (i, cpu) in [85.0, 90.0, 95.0, 70.0, 92.0].into_iter().enumerate() {
            *lock(&f.adapter.cpu_percent) = cpu;
            let reports = run_tick(&f.orchestrator, at(i as i64 * 60)).await;
            raised.push(reports[0].alerts.raised.iter().filter(|e| e.kind == AlertKind::Cpu).count());
        }
        assert_eq!(raised, vec![1, 0, 0, 0, 1]);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_limit_bounds_polling_servers() {
        let f = fixture(&["cpu_utilization"]);
        for name in ["db2", "db3"] {
            let mut server = ServerTarget {
                name: name.to_string(),
                connection_ref: format!("{}:9400", name),
                ..Default::default()
            };
            f.store.add_server(&mut server).unwrap();
        }
        f.settings.update(|s| s.max_concurrency = 1).unwrap();
        f.adapter.delay_ms.store(50, Ordering::SeqCst);

        let handles = f.orchestrator.tick(at(0));
        assert_eq!(handles.len(), 3);
        for handle in handles {
            assert_eq!(handle.await.unwrap().count(RunStatus::Success), 1);
        }
        assert_eq!(f.adapter.peak_in_flight.load(Ordering::SeqCst), 1);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_collector_does_not_block_the_next() {
        let f = fixture(&["cpu_utilization", "wait_stats"]);
        f.settings.update(|s| s.run_timeout_secs = 1).unwrap();
        *lock(&f.adapter.hang_on) = Some("waits".to_string());

        let reports = run_tick(&f.orchestrator, at(0)).await;
        let statuses: Vec<RunStatus> = reports[0].runs.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RunStatus::Timeout, RunStatus::Success]);

        let cpu = collector_id(&f, "cpu_utilization");
        let state = f.orchestrator.schedule().state(f.server_id, cpu).unwrap();
        assert_eq!(state.last_status, Some(RunStatus::Success));
        assert_eq!(state.next_due_at, Some(at(60)));
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shrunk_pool_stays_at_limit_after_growing_again() {
        let f = fixture(&["cpu_utilization"]);
        let initial = f.settings.current().max_concurrency;
        let held = f.orchestrator.semaphore.clone().acquire_many_owned(initial as u32).await.unwrap();

        f.settings.update(|s| s.max_concurrency = 1).unwrap();
        f.orchestrator.resize_pool();
        f.settings.update(|s| s.max_concurrency = 2).unwrap();
        f.orchestrator.resize_pool();
        drop(held);

        let slot = f.orchestrator.acquire_slot().await.unwrap();
        assert_eq!(f.orchestrator.semaphore.available_permits(), 1);
        assert_eq!(lock(&f.orchestrator.pool).debt, 0);
        drop(slot);
        assert_eq!(f.orchestrator.semaphore.available_permits(), 2);
        f.orchestrator.shutdown().await;
    }

    struct RecordingNotifier {
        kinds: Mutex<Vec<AlertKind>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
            lock(&self.kinds).push(event.kind);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hung_suspended_and_unstored_runs_reach_notifiers() {
        let f = fixture(&["cpu_utilization"]);
        let recorder = Arc::new(RecordingNotifier { kinds: Mutex::new(Vec::new()) });
        let notifiers: Vec<Arc<dyn Notifier>> = vec![recorder.clone()];
        let dispatcher = spawn_dispatcher(&f.bus, notifiers);

        // A run stuck far past three one-minute intervals.
        f.settings.update(|s| s.run_timeout_secs = 1).unwrap();
        f.adapter.hang.store(true, Ordering::SeqCst);
        let stuck = f.orchestrator.tick(at(0));
        while f.adapter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(f.orchestrator.tick(at(3600)).is_empty());
        assert!(f.orchestrator.tick(at(3630)).is_empty());
        for handle in stuck {
            assert_eq!(handle.await.unwrap().count(RunStatus::Timeout), 1);
        }

        // Next run is refused by the server and its row cannot be stored.
        f.adapter.hang.store(false, Ordering::SeqCst);
        *lock(&f.adapter.fail) = Some(CollectorError::Permission("VIEW SERVER STATE denied".into()));
        rusqlite::Connection::open(f._tmp.path())
            .unwrap()
            .execute_batch("DROP TABLE collection_runs")
            .unwrap();
        let reports = run_tick(&f.orchestrator, at(3660)).await;
        let escalated: Vec<AlertKind> = reports[0].alerts.raised.iter().map(|e| e.kind).collect();
        assert_eq!(escalated, vec![AlertKind::StoreWriteFailure, AlertKind::CollectorSuspended]);
        assert!(f.orchestrator.alerts().open_buckets(AlertKind::CollectorHung).is_empty());

        for _ in 0..100 {
            if lock(&recorder.kinds).len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut delivered = lock(&recorder.kinds).clone();
        delivered.sort();
        assert_eq!(
            delivered,
            vec![AlertKind::CollectorHung, AlertKind::CollectorSuspended, AlertKind::StoreWriteFailure]
        );

        dispatcher.abort();
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_mid_cycle_leaves_no_state_behind() {
        let f = fixture(&["wait_stats"]);
        f.adapter.gated.store(true, Ordering::SeqCst);

        let handles = f.orchestrator.tick(at(0));
        while f.adapter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        f.store.delete_server(f.server_id, Utc::now()).unwrap();
        f.orchestrator.forget_server(f.server_id);
        f.adapter.release.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        let waits = collector_id(&f, "wait_stats");
        assert_eq!(f.deltas.cached_len(), 0);
        assert!(f.orchestrator.schedule().state(f.server_id, waits).is_none());
        assert!(f.orchestrator.alerts().active_alerts().is_empty());
        for status in [RunStatus::Success, RunStatus::Error, RunStatus::Timeout] {
            assert_eq!(f.store.count_runs(f.server_id, waits, status).unwrap(), 0);
        }
        assert!(f.orchestrator.tick(at(600)).is_empty());
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticks() {
        let f = fixture(&["cpu_utilization"]);
        f.orchestrator.start();
        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.tick(at(0)).is_empty());
    }
}
