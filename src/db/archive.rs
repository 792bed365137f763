//! Archival of expired rows to Parquet files.
//!
//! Each batch is selected, exported and deleted while holding one immediate
//! transaction, so a row is either still live or present in exactly one
//! archive file.

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rusqlite::{params, OptionalExtension, Result as SqlResult, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::models::*;
use super::store::{fmt_time, row_to_alert_event, row_to_delta, row_to_run, row_to_sample, DbError, Store};

/// Maximum rows exported into a single archive file.
pub const ARCHIVE_BATCH_ROWS: i64 = 10_000;

/// One archive file written by [`Store::archive_and_purge`].
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedFile {
    pub table: TableClass,
    pub server_id: i64,
    pub path: PathBuf,
    pub rows: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Summary of one archival pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    pub files: Vec<ArchivedFile>,
}

impl ArchiveReport {
    pub fn rows_archived(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// Rows selected for one archive batch, with the rowids to delete.
struct Selected {
    rowids: Vec<i64>,
    batch: RecordBatch,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl Store {
    /// Move rows older than each policy's age limit into Parquet files.
    ///
    /// Files land at `{archive_dir}/{table}/server-{id}/`. Export success is a
    /// precondition for delete; if the delete cannot be committed the file is
    /// removed again.
    pub fn archive_and_purge(
        &self,
        policies: &[RetentionPolicy],
        archive_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<ArchiveReport, DbError> {
        let mut report = ArchiveReport::default();

        for policy in policies {
            if policy.max_age_days < 1 {
                continue;
            }
            let cutoff = now - ChronoDuration::days(policy.max_age_days);

            while let Some(file) = self.archive_batch(policy.table, cutoff, archive_dir)? {
                tracing::info!(
                    "Archive: moved {} {} rows for server {} to {}",
                    file.rows,
                    policy.table,
                    file.server_id,
                    file.path.display()
                );
                report.files.push(file);
            }
        }

        Ok(report)
    }

    fn archive_batch(
        &self,
        table: TableClass,
        cutoff: DateTime<Utc>,
        archive_dir: &Path,
    ) -> Result<Option<ArchivedFile>, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired = expired_condition(table);
        let cutoff_text = fmt_time(&cutoff);
        let server_id: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT server_id FROM {} WHERE {} ORDER BY server_id LIMIT 1",
                    table.table_name(),
                    expired
                ),
                params![cutoff_text],
                |r| r.get(0),
            )
            .optional()?;
        let Some(server_id) = server_id else {
            return Ok(None);
        };

        let selected = select_expired(&tx, table, server_id, cutoff)?;
        let path = write_archive(archive_dir, table, server_id, &selected)?;

        let purge = || -> Result<(), DbError> {
            let mut stmt = tx.prepare(&format!("DELETE FROM {} WHERE rowid = ?1", table.table_name()))?;
            for rowid in &selected.rowids {
                stmt.execute(params![rowid])?;
            }
            Ok(())
        };
        if let Err(e) = purge().and_then(|_| tx.commit().map_err(DbError::from)) {
            if let Err(rm) = fs::remove_file(&path) {
                tracing::error!("Archive: failed to remove {} after aborted purge: {}", path.display(), rm);
            }
            return Err(e);
        }

        Ok(Some(ArchivedFile {
            table,
            server_id,
            path,
            rows: selected.rowids.len(),
            from: selected.from,
            to: selected.to,
        }))
    }
}

/// Rows of `table` past the cutoff. Open alerts stay live until cleared.
fn expired_condition(table: TableClass) -> String {
    let base = format!("{} < ?1", table.time_column());
    match table {
        TableClass::AlertEvents => format!("{} AND cleared_at IS NOT NULL", base),
        _ => base,
    }
}

fn select_expired(
    tx: &Transaction<'_>,
    table: TableClass,
    server_id: i64,
    cutoff: DateTime<Utc>,
) -> Result<Selected, DbError> {
    let columns = match table {
        TableClass::Samples => "server_id, category, collected_at, counters",
        TableClass::Deltas => {
            "server_id, category, counter_name, interval_start, interval_end, delta_value, is_valid"
        }
        TableClass::Runs => {
            "id, server_id, collector_id, started_at, ended_at, status, duration_ms, error_message"
        }
        TableClass::AlertEvents => "id, server_id, kind, triggered_at, dedup_key, details, cleared_at",
    };
    let sql = format!(
        "SELECT {}, rowid FROM {} WHERE {} AND server_id = ?2 ORDER BY {} ASC, rowid ASC LIMIT ?3",
        columns,
        table.table_name(),
        expired_condition(table),
        table.time_column()
    );
    let cutoff_text = fmt_time(&cutoff);
    let mut stmt = tx.prepare(&sql)?;
    let args = params![cutoff_text, server_id, ARCHIVE_BATCH_ROWS];

    fn with_rowid<T>(
        row: &Row<'_>,
        idx: usize,
        f: fn(&Row<'_>) -> SqlResult<T>,
    ) -> SqlResult<(i64, T)> {
        Ok((row.get(idx)?, f(row)?))
    }

    let (rowids, batch, times) = match table {
        TableClass::Samples => {
            let rows = stmt
                .query_map(args, |r| with_rowid(r, 4, row_to_sample))?
                .collect::<SqlResult<Vec<_>>>()?;
            let (ids, rows): (Vec<i64>, Vec<RawSample>) = rows.into_iter().unzip();
            let times = rows.iter().map(|r| r.collected_at).collect::<Vec<_>>();
            (ids, samples_batch(&rows)?, times)
        }
        TableClass::Deltas => {
            let rows = stmt
                .query_map(args, |r| with_rowid(r, 7, row_to_delta))?
                .collect::<SqlResult<Vec<_>>>()?;
            let (ids, rows): (Vec<i64>, Vec<MetricDelta>) = rows.into_iter().unzip();
            let times = rows.iter().map(|r| r.interval_end).collect::<Vec<_>>();
            (ids, deltas_batch(&rows)?, times)
        }
        TableClass::Runs => {
            let rows = stmt
                .query_map(args, |r| with_rowid(r, 8, row_to_run))?
                .collect::<SqlResult<Vec<_>>>()?;
            let (ids, rows): (Vec<i64>, Vec<CollectionRun>) = rows.into_iter().unzip();
            let times = rows.iter().map(|r| r.started_at).collect::<Vec<_>>();
            (ids, runs_batch(&rows)?, times)
        }
        TableClass::AlertEvents => {
            let rows = stmt
                .query_map(args, |r| with_rowid(r, 7, row_to_alert_event))?
                .collect::<SqlResult<Vec<_>>>()?;
            let (ids, rows): (Vec<i64>, Vec<AlertEvent>) = rows.into_iter().unzip();
            let times = rows.iter().map(|r| r.triggered_at).collect::<Vec<_>>();
            (ids, alert_events_batch(&rows)?, times)
        }
    };

    let from = times.first().copied().unwrap_or(cutoff);
    let to = times.last().copied().unwrap_or(cutoff);
    Ok(Selected { rowids, batch, from, to })
}

/// Write a batch to a temp file, fsync it, then rename into place.
fn write_archive(
    archive_dir: &Path,
    table: TableClass,
    server_id: i64,
    selected: &Selected,
) -> Result<PathBuf, DbError> {
    let dir = archive_dir
        .join(table.as_str())
        .join(format!("server-{}", server_id));
    fs::create_dir_all(&dir)?;

    let first_rowid = selected.rowids.first().copied().unwrap_or(0);
    let name = format!(
        "{}_{}_{}_{}_{}.parquet",
        table.as_str(),
        server_id,
        selected.from.format("%Y%m%dT%H%M%S"),
        selected.to.format("%Y%m%dT%H%M%S"),
        first_rowid
    );
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!(".{}.tmp", name));

    // A temp file left by an interrupted pass is overwritten.
    let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let written = (|| -> Result<(), DbError> {
        let mut writer = ArrowWriter::try_new(file, selected.batch.schema(), Some(props))?;
        writer.write(&selected.batch)?;
        writer.close()?;
        OpenOptions::new().write(true).open(&tmp_path)?.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    #[cfg(unix)]
    File::open(&dir)?.sync_all()?;

    Ok(final_path)
}

fn ts_field(name: &str, nullable: bool) -> Field {
    Field::new(name, DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())), nullable)
}

fn ts_array(values: impl Iterator<Item = DateTime<Utc>>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values.map(|t| t.timestamp_micros()).collect::<Vec<_>>()).with_timezone("UTC"))
}

fn opt_ts_array(values: impl Iterator<Item = Option<DateTime<Utc>>>) -> ArrayRef {
    Arc::new(
        TimestampMicrosecondArray::from(values.map(|t| t.map(|t| t.timestamp_micros())).collect::<Vec<_>>())
            .with_timezone("UTC"),
    )
}

fn int_array(values: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values.collect::<Vec<_>>()))
}

fn str_array<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn samples_batch(rows: &[RawSample]) -> Result<RecordBatch, DbError> {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("server_id", DataType::Int64, false),
        Field::new("category", DataType::Utf8, false),
        ts_field("collected_at", false),
        Field::new("counters", DataType::Utf8, false),
    ]));
    let counters = rows
        .iter()
        .map(|r| serde_json::to_string(&r.counters))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(
        schema,
        vec![
            int_array(rows.iter().map(|r| r.server_id)),
            str_array(rows.iter().map(|r| r.category.as_str())),
            ts_array(rows.iter().map(|r| r.collected_at)),
            str_array(counters.iter().map(String::as_str)),
        ],
    )?)
}

fn deltas_batch(rows: &[MetricDelta]) -> Result<RecordBatch, DbError> {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("server_id", DataType::Int64, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("counter_name", DataType::Utf8, false),
        ts_field("interval_start", false),
        ts_field("interval_end", false),
        Field::new("delta_value", DataType::Float64, false),
        Field::new("is_valid", DataType::Boolean, false),
    ]));
    Ok(RecordBatch::try_new(
        schema,
        vec![
            int_array(rows.iter().map(|r| r.server_id)),
            str_array(rows.iter().map(|r| r.category.as_str())),
            str_array(rows.iter().map(|r| r.counter_name.as_str())),
            ts_array(rows.iter().map(|r| r.interval_start)),
            ts_array(rows.iter().map(|r| r.interval_end)),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.delta_value).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(rows.iter().map(|r| r.is_valid).collect::<Vec<_>>())),
        ],
    )?)
}

fn runs_batch(rows: &[CollectionRun]) -> Result<RecordBatch, DbError> {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("server_id", DataType::Int64, false),
        Field::new("collector_id", DataType::Int64, false),
        ts_field("started_at", false),
        ts_field("ended_at", false),
        Field::new("status", DataType::Utf8, false),
        Field::new("duration_ms", DataType::Int64, false),
        Field::new("error_message", DataType::Utf8, true),
    ]));
    Ok(RecordBatch::try_new(
        schema,
        vec![
            int_array(rows.iter().map(|r| r.id)),
            int_array(rows.iter().map(|r| r.server_id)),
            int_array(rows.iter().map(|r| r.collector_id)),
            ts_array(rows.iter().map(|r| r.started_at)),
            ts_array(rows.iter().map(|r| r.ended_at)),
            str_array(rows.iter().map(|r| r.status.as_str())),
            int_array(rows.iter().map(|r| r.duration_ms)),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.error_message.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )?)
}

fn alert_events_batch(rows: &[AlertEvent]) -> Result<RecordBatch, DbError> {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("server_id", DataType::Int64, false),
        Field::new("kind", DataType::Utf8, false),
        ts_field("triggered_at", false),
        Field::new("dedup_key", DataType::Utf8, false),
        Field::new("details", DataType::Utf8, false),
        ts_field("cleared_at", true),
    ]));
    Ok(RecordBatch::try_new(
        schema,
        vec![
            int_array(rows.iter().map(|r| r.id)),
            int_array(rows.iter().map(|r| r.server_id)),
            str_array(rows.iter().map(|r| r.kind.as_str())),
            ts_array(rows.iter().map(|r| r.triggered_at)),
            str_array(rows.iter().map(|r| r.dedup_key.as_str())),
            str_array(rows.iter().map(|r| r.details.as_str())),
            opt_ts_array(rows.iter().map(|r| r.cleared_at)),
        ],
    )?)
}
