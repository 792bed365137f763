//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Name of the table refinery records applied migrations in.
pub const SCHEMA_HISTORY_TABLE: &str = "refinery_schema_history";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database schema version {found} is newer than the {supported} this build supports")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("Not found")]
    NotFound,
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive encoding error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("archive batch error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Bring the schema up to the newest embedded migration.
    ///
    /// Safe on every startup: migrations only create missing objects, and
    /// already-applied versions are skipped. Fails if the database was
    /// written by a newer build.
    pub fn init(&self) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let runner = embedded::migrations::runner();

        let supported = runner
            .get_migrations()
            .iter()
            .map(|m| i64::from(m.version()))
            .max()
            .unwrap_or(0);
        if let Some(found) = applied_version(&conn)? {
            if found > supported {
                return Err(DbError::SchemaTooNew { found, supported });
            }
        }

        let report = runner
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!("Store: applied migration {}", migration);
        }
        Ok(())
    }

    /// Highest applied schema migration, if any.
    pub fn schema_version(&self) -> Result<Option<i64>, DbError> {
        let conn = self.lock()?;
        applied_version(&conn)
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Servers ---

    /// Add a new server and return its ID.
    pub fn add_server(&self, server: &mut ServerTarget) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO servers (name, connection_ref, enabled, favorite, description) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                server.name,
                server.connection_ref,
                server.enabled,
                server.favorite,
                server.description,
            ],
        )?;
        let id = conn.last_insert_rowid();
        server.id = id;
        Ok(id)
    }

    /// Update an existing server's editable fields.
    pub fn update_server(&self, server: &ServerTarget) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE servers SET name=?1, connection_ref=?2, enabled=?3, favorite=?4, description=?5
             WHERE id=?6 AND deleted_at IS NULL",
            params![
                server.name,
                server.connection_ref,
                server.enabled,
                server.favorite,
                server.description,
                server.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all servers that have not been deleted.
    pub fn get_servers(&self) -> Result<Vec<ServerTarget>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, connection_ref, enabled, favorite, description, deleted_at
             FROM servers WHERE deleted_at IS NULL ORDER BY id",
        )?;
        let servers = stmt
            .query_map([], row_to_server)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(servers)
    }

    /// Get a server by ID, including deleted ones.
    pub fn get_server(&self, id: i64) -> Result<ServerTarget, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, connection_ref, enabled, favorite, description, deleted_at
             FROM servers WHERE id = ?1",
            params![id],
            row_to_server,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Soft-delete a server. History stays until [`Store::purge_server`].
    pub fn delete_server(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE servers SET deleted_at = ?1, enabled = 0 WHERE id = ?2 AND deleted_at IS NULL",
            params![fmt_time(&at), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Permanently remove a server and everything recorded for it.
    pub fn purge_server(&self, id: i64) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for table in [
            "raw_samples",
            "metric_deltas",
            "collection_runs",
            "alert_events",
            "schedule_state",
        ] {
            tx.execute(&format!("DELETE FROM {} WHERE server_id = ?1", table), params![id])?;
        }
        tx.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Collectors ---

    /// Get all collector definitions.
    pub fn get_collectors(&self) -> Result<Vec<CollectorDefinition>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, category, counter_kind, interval_minutes, enabled FROM collectors ORDER BY id",
        )?;
        let collectors = stmt
            .query_map([], row_to_collector)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(collectors)
    }

    /// Add a collector definition and return its ID.
    pub fn add_collector(&self, def: &mut CollectorDefinition) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO collectors (name, category, counter_kind, interval_minutes, enabled) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                def.name,
                def.category,
                def.counter_kind.as_str(),
                def.interval_minutes,
                def.enabled,
            ],
        )?;
        def.id = conn.last_insert_rowid();
        Ok(def.id)
    }

    /// Persist the mutable fields of a collector definition.
    pub fn update_collector(&self, def: &CollectorDefinition) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE collectors SET interval_minutes = ?1, enabled = ?2 WHERE id = ?3",
            params![def.interval_minutes, def.enabled, def.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Schedule state ---

    /// Get every persisted schedule state.
    pub fn get_schedule_states(&self) -> Result<Vec<ScheduleState>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT server_id, collector_id, last_run_at, last_status, next_due_at, running_since,
                    suspended_reason, consecutive_failures
             FROM schedule_state",
        )?;
        let states = stmt
            .query_map([], |row| {
                Ok(ScheduleState {
                    server_id: row.get(0)?,
                    collector_id: row.get(1)?,
                    last_run_at: opt_time_col(row, 2)?,
                    last_status: opt_enum_col(row, 3)?,
                    next_due_at: opt_time_col(row, 4)?,
                    running_since: opt_time_col(row, 5)?,
                    suspended_reason: row.get(6)?,
                    consecutive_failures: row.get(7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(states)
    }

    /// Insert or replace the state of one (server, collector) pair.
    pub fn save_schedule_state(&self, state: &ScheduleState) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO schedule_state (server_id, collector_id, last_run_at, last_status, next_due_at,
                                         running_since, suspended_reason, consecutive_failures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(server_id, collector_id) DO UPDATE SET
                last_run_at=excluded.last_run_at, last_status=excluded.last_status,
                next_due_at=excluded.next_due_at, running_since=excluded.running_since,
                suspended_reason=excluded.suspended_reason,
                consecutive_failures=excluded.consecutive_failures",
            params![
                state.server_id,
                state.collector_id,
                state.last_run_at.as_ref().map(fmt_time),
                state.last_status.map(|s| s.as_str()),
                state.next_due_at.as_ref().map(fmt_time),
                state.running_since.as_ref().map(fmt_time),
                state.suspended_reason,
                state.consecutive_failures,
            ],
        )?;
        Ok(())
    }

    // --- Collection writes ---

    /// Write a run together with its sample and deltas in one transaction.
    ///
    /// Returns the ID of the inserted run.
    pub fn append_run_batch(&self, batch: &RunBatch) -> Result<i64, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let run = &batch.run;
        tx.execute(
            "INSERT INTO collection_runs (server_id, collector_id, started_at, ended_at, status, duration_ms, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.server_id,
                run.collector_id,
                fmt_time(&run.started_at),
                fmt_time(&run.ended_at),
                run.status.as_str(),
                run.duration_ms,
                run.error_message,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        if let Some(sample) = &batch.sample {
            tx.execute(
                "INSERT INTO raw_samples (server_id, category, collected_at, counters) VALUES (?1, ?2, ?3, ?4)",
                params![
                    sample.server_id,
                    sample.category,
                    fmt_time(&sample.collected_at),
                    serde_json::to_string(&sample.counters)?,
                ],
            )?;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_deltas (server_id, category, counter_name, interval_start, interval_end, delta_value, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for d in &batch.deltas {
                stmt.execute(params![
                    d.server_id,
                    d.category,
                    d.counter_name,
                    fmt_time(&d.interval_start),
                    fmt_time(&d.interval_end),
                    d.delta_value,
                    d.is_valid,
                ])?;
            }
        }

        tx.commit()?;
        Ok(run_id)
    }

    /// Add metric deltas in batch.
    #[cfg(test)]
    pub fn add_deltas(&self, deltas: &[MetricDelta]) -> Result<(), DbError> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_deltas (server_id, category, counter_name, interval_start, interval_end, delta_value, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for d in deltas {
                stmt.execute(params![
                    d.server_id,
                    d.category,
                    d.counter_name,
                    fmt_time(&d.interval_start),
                    fmt_time(&d.interval_end),
                    d.delta_value,
                    d.is_valid,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Count runs for a (server, collector) pair with the given status.
    #[cfg(test)]
    pub fn count_runs(&self, server_id: i64, collector_id: i64, status: RunStatus) -> Result<i64, DbError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM collection_runs WHERE server_id = ?1 AND collector_id = ?2 AND status = ?3",
            params![server_id, collector_id, status.as_str()],
            |r| r.get(0),
        )?)
    }

    // --- Queries ---

    /// Time-ranged read of one table class, ordered by collection time.
    pub fn query(&self, table: TableClass, filter: &RowFilter, range: TimeRange) -> Result<Vec<StoredRow>, DbError> {
        Ok(match table {
            TableClass::Samples => self
                .query_samples(filter, range)?
                .into_iter()
                .map(StoredRow::Sample)
                .collect(),
            TableClass::Deltas => self
                .query_deltas(filter, range)?
                .into_iter()
                .map(StoredRow::Delta)
                .collect(),
            TableClass::Runs => self
                .query_runs(filter, range)?
                .into_iter()
                .map(StoredRow::Run)
                .collect(),
            TableClass::AlertEvents => self
                .query_alert_events(filter, range)?
                .into_iter()
                .map(StoredRow::AlertEvent)
                .collect(),
        })
    }

    /// Get raw samples within a time range.
    pub fn query_samples(&self, filter: &RowFilter, range: TimeRange) -> Result<Vec<RawSample>, DbError> {
        let (sql, args) = filtered_select(
            "SELECT server_id, category, collected_at, counters FROM raw_samples",
            TableClass::Samples,
            filter,
            None,
            range,
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_sample)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get metric deltas within a time range. `filter.key` selects a counter.
    pub fn query_deltas(&self, filter: &RowFilter, range: TimeRange) -> Result<Vec<MetricDelta>, DbError> {
        let (sql, args) = filtered_select(
            "SELECT server_id, category, counter_name, interval_start, interval_end, delta_value, is_valid
             FROM metric_deltas",
            TableClass::Deltas,
            filter,
            Some("counter_name"),
            range,
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_delta)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get collection runs within a time range. `filter.key` selects a collector ID.
    pub fn query_runs(&self, filter: &RowFilter, range: TimeRange) -> Result<Vec<CollectionRun>, DbError> {
        let (sql, args) = filtered_select(
            "SELECT id, server_id, collector_id, started_at, ended_at, status, duration_ms, error_message
             FROM collection_runs",
            TableClass::Runs,
            filter,
            Some("CAST(collector_id AS TEXT)"),
            range,
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_run)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get alert events within a time range. `filter.key` selects a rule kind.
    pub fn query_alert_events(&self, filter: &RowFilter, range: TimeRange) -> Result<Vec<AlertEvent>, DbError> {
        let (sql, args) = filtered_select(
            "SELECT id, server_id, kind, triggered_at, dedup_key, details, cleared_at FROM alert_events",
            TableClass::AlertEvents,
            filter,
            Some("kind"),
            range,
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_alert_event)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Per (server, collector) health summary for active servers and collectors.
    pub fn health(&self, now: DateTime<Utc>, hung_multiplier: f64) -> Result<Vec<HealthEntry>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT sv.id, sv.name, c.id, c.name, c.interval_minutes,
                    s.last_run_at, s.last_status, s.next_due_at, s.running_since, s.suspended_reason
             FROM servers sv
             CROSS JOIN collectors c
             LEFT JOIN schedule_state s ON s.server_id = sv.id AND s.collector_id = c.id
             WHERE sv.deleted_at IS NULL AND sv.enabled = 1 AND c.enabled = 1
             ORDER BY sv.id, c.id",
        )?;
        let entries = stmt
            .query_map([], |row| {
                let interval_minutes: i64 = row.get(4)?;
                let last_status: Option<RunStatus> = opt_enum_col(row, 6)?;
                let running_since = opt_time_col(row, 8)?;
                let suspended_reason: Option<String> = row.get(9)?;
                let condition = health_condition(
                    last_status,
                    running_since,
                    suspended_reason.is_some(),
                    interval_minutes,
                    hung_multiplier,
                    now,
                );
                Ok(HealthEntry {
                    server_id: row.get(0)?,
                    server_name: row.get(1)?,
                    collector_id: row.get(2)?,
                    collector_name: row.get(3)?,
                    last_run_at: opt_time_col(row, 5)?,
                    last_status,
                    next_due_at: opt_time_col(row, 7)?,
                    running_since,
                    suspended_reason,
                    condition,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entries)
    }

    // --- Alerts ---

    /// Get all alert rules.
    pub fn get_alert_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT kind, enabled, threshold, multiplier FROM alert_rules ORDER BY kind")?;
        let rules = stmt
            .query_map([], |row| {
                Ok(AlertRule {
                    kind: enum_col(row, 0)?,
                    enabled: row.get(1)?,
                    threshold: row.get(2)?,
                    multiplier: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    /// Insert or replace an alert rule.
    pub fn save_alert_rule(&self, rule: &AlertRule) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alert_rules (kind, enabled, threshold, multiplier) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind) DO UPDATE SET
                enabled=excluded.enabled, threshold=excluded.threshold, multiplier=excluded.multiplier",
            params![rule.kind.as_str(), rule.enabled, rule.threshold, rule.multiplier],
        )?;
        Ok(())
    }

    /// Record a fired alert and return its ID.
    pub fn add_alert_event(&self, event: &mut AlertEvent) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alert_events (server_id, kind, triggered_at, dedup_key, details, cleared_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.server_id,
                event.kind.as_str(),
                fmt_time(&event.triggered_at),
                event.dedup_key,
                event.details,
                event.cleared_at.as_ref().map(fmt_time),
            ],
        )?;
        event.id = conn.last_insert_rowid();
        Ok(event.id)
    }

    /// Close the active window of an alert.
    pub fn clear_alert_event(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alert_events SET cleared_at = ?1 WHERE id = ?2 AND cleared_at IS NULL",
            params![fmt_time(&at), id],
        )?;
        Ok(())
    }

    /// Alerts whose condition still held on the latest evaluation.
    pub fn open_alert_events(&self) -> Result<Vec<AlertEvent>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, server_id, kind, triggered_at, dedup_key, details, cleared_at
             FROM alert_events WHERE cleared_at IS NULL ORDER BY triggered_at ASC",
        )?;
        let events = stmt
            .query_map([], row_to_alert_event)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Settings ---

    /// Get all stored settings as raw JSON text.
    pub fn get_settings(&self) -> Result<BTreeMap<String, String>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let settings = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<BTreeMap<_, _>>>()?;
        Ok(settings)
    }

    /// Store several settings atomically.
    pub fn put_settings(&self, values: &BTreeMap<String, String>) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            )?;
            for (key, value) in values {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Status ---

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.lock()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }
}

fn applied_version(conn: &Connection) -> Result<Option<i64>, DbError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![SCHEMA_HISTORY_TABLE],
        |r| r.get(0),
    )?;
    if !exists {
        return Ok(None);
    }
    let version: Option<i64> = conn.query_row(
        &format!("SELECT MAX(version) FROM {}", SCHEMA_HISTORY_TABLE),
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

fn health_condition(
    last_status: Option<RunStatus>,
    running_since: Option<DateTime<Utc>>,
    suspended: bool,
    interval_minutes: i64,
    hung_multiplier: f64,
    now: DateTime<Utc>,
) -> HealthCondition {
    if last_status == Some(RunStatus::Running) {
        let limit = ChronoDuration::seconds((interval_minutes as f64 * 60.0 * hung_multiplier) as i64);
        return match running_since {
            Some(since) if now - since > limit => HealthCondition::Hung,
            _ => HealthCondition::Running,
        };
    }
    if suspended {
        return HealthCondition::Suspended;
    }
    match last_status {
        Some(RunStatus::Error) | Some(RunStatus::Timeout) => HealthCondition::Failing,
        Some(_) => HealthCondition::Healthy,
        None => HealthCondition::NeverRun,
    }
}

/// Build a time-ranged select with optional server, category and key filters.
fn filtered_select(
    base: &str,
    table: TableClass,
    filter: &RowFilter,
    key_column: Option<&str>,
    range: TimeRange,
) -> (String, Vec<Value>) {
    let time_col = table.time_column();
    let mut sql = format!("{} WHERE {} >= ?1 AND {} < ?2", base, time_col, time_col);
    let mut args = vec![
        Value::Text(fmt_time(&range.start)),
        Value::Text(fmt_time(&range.end)),
    ];

    if let Some(server_id) = filter.server_id {
        args.push(Value::Integer(server_id));
        sql.push_str(&format!(" AND server_id = ?{}", args.len()));
    }
    if let (Some(category), true) = (&filter.category, matches!(table, TableClass::Samples | TableClass::Deltas)) {
        args.push(Value::Text(category.clone()));
        sql.push_str(&format!(" AND category = ?{}", args.len()));
    }
    if let (Some(key), Some(column)) = (&filter.key, key_column) {
        args.push(Value::Text(key.clone()));
        sql.push_str(&format!(" AND {} = ?{}", column, args.len()));
    }

    args.push(Value::Integer(filter.limit.unwrap_or(-1)));
    sql.push_str(&format!(" ORDER BY {} ASC LIMIT ?{}", time_col, args.len()));
    (sql, args)
}

pub(super) fn row_to_server(row: &Row<'_>) -> SqlResult<ServerTarget> {
    Ok(ServerTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        connection_ref: row.get(2)?,
        enabled: row.get(3)?,
        favorite: row.get(4)?,
        description: row.get(5)?,
        deleted_at: opt_time_col(row, 6)?,
    })
}

fn row_to_collector(row: &Row<'_>) -> SqlResult<CollectorDefinition> {
    Ok(CollectorDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        counter_kind: enum_col(row, 3)?,
        interval_minutes: row.get(4)?,
        enabled: row.get(5)?,
    })
}

pub(super) fn row_to_sample(row: &Row<'_>) -> SqlResult<RawSample> {
    let counters: String = row.get(3)?;
    Ok(RawSample {
        server_id: row.get(0)?,
        category: row.get(1)?,
        collected_at: time_col(row, 2)?,
        counters: serde_json::from_str(&counters)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
    })
}

pub(super) fn row_to_delta(row: &Row<'_>) -> SqlResult<MetricDelta> {
    Ok(MetricDelta {
        server_id: row.get(0)?,
        category: row.get(1)?,
        counter_name: row.get(2)?,
        interval_start: time_col(row, 3)?,
        interval_end: time_col(row, 4)?,
        delta_value: row.get(5)?,
        is_valid: row.get(6)?,
    })
}

pub(super) fn row_to_run(row: &Row<'_>) -> SqlResult<CollectionRun> {
    Ok(CollectionRun {
        id: row.get(0)?,
        server_id: row.get(1)?,
        collector_id: row.get(2)?,
        started_at: time_col(row, 3)?,
        ended_at: time_col(row, 4)?,
        status: enum_col(row, 5)?,
        duration_ms: row.get(6)?,
        error_message: row.get(7)?,
    })
}

pub(super) fn row_to_alert_event(row: &Row<'_>) -> SqlResult<AlertEvent> {
    Ok(AlertEvent {
        id: row.get(0)?,
        server_id: row.get(1)?,
        kind: enum_col(row, 2)?,
        triggered_at: time_col(row, 3)?,
        dedup_key: row.get(4)?,
        details: row.get(5)?,
        cleared_at: opt_time_col(row, 6)?,
    })
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| text_error(idx, format!("invalid timestamp: {}", s)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| text_error(idx, format!("invalid timestamp: {}", s))),
        None => Ok(None),
    }
}

fn enum_col<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| text_error(idx, e))
}

fn opt_enum_col<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse().map_err(|e| text_error(idx, e))).transpose()
}

fn text_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

/// Format a datetime the way it is stored; lexical order matches time order.
pub fn fmt_time(dt: &DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    fn delta(server_id: i64, counter: &str, end_min: i64, value: f64) -> MetricDelta {
        MetricDelta {
            server_id,
            category: "waits".to_string(),
            counter_name: counter.to_string(),
            interval_start: t(end_min - 5),
            interval_end: t(end_min),
            delta_value: value,
            is_valid: true,
        }
    }

    fn schema_sql(store: &Store) -> Vec<String> {
        let conn = store.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT COALESCE(sql, '') FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<SqlResult<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_server_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut server = ServerTarget {
            name: "Primary".to_string(),
            connection_ref: "http://db1:9400".to_string(),
            ..Default::default()
        };
        let id = store.add_server(&mut server).unwrap();
        assert!(id > 0);

        let mut fetched = store.get_server(id).unwrap();
        assert_eq!(fetched.name, "Primary");
        assert!(fetched.is_active());

        fetched.favorite = true;
        store.update_server(&fetched).unwrap();
        assert!(store.get_server(id).unwrap().favorite);

        store.delete_server(id, t(0)).unwrap();
        assert!(store.get_servers().unwrap().is_empty());
        let deleted = store.get_server(id).unwrap();
        assert!(!deleted.is_active());
        assert_eq!(deleted.deleted_at, Some(t(0)));

        store.purge_server(id).unwrap();
        assert!(matches!(store.get_server(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_init_is_idempotent() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.add_deltas(&[delta(1, "wait_ms:LCK_M_X", 5, 10.0)]).unwrap();
        let version = store.schema_version().unwrap();
        assert!(version.is_some());
        let before = schema_sql(&store);

        store.init().unwrap();
        drop(store);
        let reopened = Store::new(tmp.path()).unwrap();

        assert_eq!(schema_sql(&reopened), before);
        assert_eq!(reopened.schema_version().unwrap(), version);
        let rows = reopened
            .query_deltas(&RowFilter::default(), TimeRange::new(t(-60), t(60)))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(reopened.get_collectors().unwrap().len(), 11);
        assert_eq!(reopened.get_alert_rules().unwrap().len(), AlertKind::ALL.len());
    }

    #[test]
    fn test_init_rejects_newer_schema() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let current = store.schema_version().unwrap().unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                &format!(
                    "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'future', '', '0')",
                    SCHEMA_HISTORY_TABLE
                ),
                params![current + 1],
            )
            .unwrap();
        }
        drop(store);

        match Store::new(tmp.path()) {
            Err(DbError::SchemaTooNew { found, supported }) => {
                assert_eq!(found, current + 1);
                assert_eq!(supported, current);
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("store opened a newer schema"),
        }
    }

    #[test]
    fn test_run_batch_and_ordered_queries() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut counters = BTreeMap::new();
        counters.insert("wait_ms:LCK_M_X".to_string(), 1500.0);
        let batch = RunBatch {
            run: CollectionRun {
                id: 0,
                server_id: 1,
                collector_id: 1,
                started_at: t(10),
                ended_at: t(10),
                status: RunStatus::Success,
                duration_ms: 12,
                error_message: None,
            },
            sample: Some(RawSample {
                server_id: 1,
                category: "waits".to_string(),
                collected_at: t(10),
                counters,
            }),
            deltas: vec![
                delta(1, "wait_ms:LCK_M_X", 10, 20.0),
                delta(1, "wait_ms:PAGEIOLATCH_SH", 10, 5.0),
            ],
        };
        let run_id = store.append_run_batch(&batch).unwrap();
        assert!(run_id > 0);
        store
            .add_deltas(&[delta(1, "wait_ms:LCK_M_X", 5, 7.0), delta(2, "wait_ms:LCK_M_X", 5, 1.0)])
            .unwrap();

        let range = TimeRange::new(t(0), t(60));
        let filter = RowFilter {
            server_id: Some(1),
            category: Some("waits".to_string()),
            key: Some("wait_ms:LCK_M_X".to_string()),
            limit: None,
        };
        let rows = store.query_deltas(&filter, range).unwrap();
        let values: Vec<f64> = rows.iter().map(|d| d.delta_value).collect();
        assert_eq!(values, vec![7.0, 20.0]);

        let samples = store.query(TableClass::Samples, &RowFilter::default(), range).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(store.count_runs(1, 1, RunStatus::Success).unwrap(), 1);

        let runs = store
            .query_runs(&RowFilter { key: Some("1".to_string()), ..Default::default() }, range)
            .unwrap();
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].duration_ms, 12);
    }

    #[test]
    fn test_health_view_conditions() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut server = ServerTarget {
            name: "db1".to_string(),
            connection_ref: "x".to_string(),
            ..Default::default()
        };
        store.add_server(&mut server).unwrap();
        let collectors = store.get_collectors().unwrap();
        let cpu = collectors.iter().find(|c| c.name == "cpu_utilization").unwrap();
        let waits = collectors.iter().find(|c| c.name == "wait_stats").unwrap();

        let mut running = ScheduleState::new(server.id, cpu.id);
        running.last_status = Some(RunStatus::Running);
        running.running_since = Some(t(0));
        store.save_schedule_state(&running).unwrap();

        let mut failed = ScheduleState::new(server.id, waits.id);
        failed.last_status = Some(RunStatus::Error);
        failed.last_run_at = Some(t(0));
        store.save_schedule_state(&failed).unwrap();

        let health = store.health(t(10), 3.0).unwrap();
        assert_eq!(health.len(), collectors.len());
        let cpu_entry = health.iter().find(|h| h.collector_id == cpu.id).unwrap();
        assert_eq!(cpu_entry.condition, HealthCondition::Hung);
        let wait_entry = health.iter().find(|h| h.collector_id == waits.id).unwrap();
        assert_eq!(wait_entry.condition, HealthCondition::Failing);
        assert!(health
            .iter()
            .filter(|h| h.collector_id != cpu.id && h.collector_id != waits.id)
            .all(|h| h.condition == HealthCondition::NeverRun));
    }

    #[test]
    fn test_alert_events_open_and_clear() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut event = AlertEvent {
            id: 0,
            server_id: 3,
            kind: AlertKind::Cpu,
            triggered_at: t(0),
            dedup_key: "3:cpu:".to_string(),
            details: "CPU 95%".to_string(),
            cleared_at: None,
        };
        store.add_alert_event(&mut event).unwrap();
        assert_eq!(store.open_alert_events().unwrap(), vec![event.clone()]);

        store.clear_alert_event(event.id, t(5)).unwrap();
        assert!(store.open_alert_events().unwrap().is_empty());
        let history = store
            .query_alert_events(&RowFilter { key: Some("cpu".to_string()), ..Default::default() }, TimeRange::new(t(-1), t(1)))
            .unwrap();
        assert_eq!(history[0].cleared_at, Some(t(5)));
    }

    #[test]
    fn test_parse_db_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(parse_db_time("2024-01-01 12:34:56"), Some(expected));
        assert_eq!(parse_db_time(&fmt_time(&expected)), Some(expected));
        assert_eq!(parse_db_time("2024-01-01T12:34:56Z"), Some(expected));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
