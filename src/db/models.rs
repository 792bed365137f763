//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A monitored database server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerTarget {
    pub id: i64,
    pub name: String,
    /// Opaque reference the collector adapter uses to reach the server.
    pub connection_ref: String,
    pub enabled: bool,
    pub favorite: bool,
    pub description: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for ServerTarget {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            connection_ref: String::new(),
            enabled: true,
            favorite: false,
            description: String::new(),
            deleted_at: None,
        }
    }
}

impl ServerTarget {
    /// Whether the scheduler should poll this server at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// How successive values of a counter relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Cumulative since service start; only differences are meaningful.
    Monotonic,
    /// A gauge; each sample stands on its own.
    PointInTime,
}

/// A named unit of work gathering one category of counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorDefinition {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub counter_kind: CounterKind,
    pub interval_minutes: i64,
    pub enabled: bool,
}

/// Status of a collection run or of a schedule slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
    Skipped,
    Running,
}

/// Per (server, collector) scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleState {
    pub server_id: i64,
    pub collector_id: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
    /// Set when the collector failed in a way that retrying cannot fix.
    pub suspended_reason: Option<String>,
    pub consecutive_failures: i64,
}

impl ScheduleState {
    pub fn new(server_id: i64, collector_id: i64) -> Self {
        Self {
            server_id,
            collector_id,
            last_run_at: None,
            last_status: None,
            next_due_at: None,
            running_since: None,
            suspended_reason: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.last_status == Some(RunStatus::Running)
    }
}

/// A snapshot of raw counter values for one server and category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSample {
    pub server_id: i64,
    pub category: String,
    pub collected_at: DateTime<Utc>,
    pub counters: BTreeMap<String, f64>,
}

/// Activity of one counter over the interval between two samples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDelta {
    pub server_id: i64,
    pub category: String,
    pub counter_name: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub delta_value: f64,
    /// False when a counter reset was detected and the value suppressed.
    pub is_valid: bool,
}

impl MetricDelta {
    /// Delta normalized by the elapsed time of its interval.
    #[cfg(test)]
    pub fn rate_per_second(&self) -> Option<f64> {
        let elapsed = (self.interval_end - self.interval_start).num_milliseconds();
        if elapsed <= 0 {
            return None;
        }
        Some(self.delta_value / (elapsed as f64 / 1000.0))
    }
}

/// Append-only record of one collector execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRun {
    pub id: i64,
    pub server_id: i64,
    pub collector_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// Everything one successful (or failed) run persists, written atomically.
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub run: CollectionRun,
    pub sample: Option<RawSample>,
    pub deltas: Vec<MetricDelta>,
}

/// Alert rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Cpu,
    Blocking,
    Deadlock,
    PoisonWait,
    LongRunningQuery,
    #[serde(rename = "tempdb_space")]
    TempDbSpace,
    LongRunningJob,
    ConnectionChange,
    /// Raised by the orchestrator, not by a rule.
    CollectorHung,
    CollectorSuspended,
    StoreWriteFailure,
}

impl AlertKind {
    /// Kinds driven by an operator-configured rule.
    pub const ALL: [AlertKind; 8] = [
        AlertKind::Cpu,
        AlertKind::Blocking,
        AlertKind::Deadlock,
        AlertKind::PoisonWait,
        AlertKind::LongRunningQuery,
        AlertKind::TempDbSpace,
        AlertKind::LongRunningJob,
        AlertKind::ConnectionChange,
    ];

    /// Process-level kinds that always fire and have no rule.
    pub const ESCALATIONS: [AlertKind; 3] = [
        AlertKind::CollectorHung,
        AlertKind::CollectorSuspended,
        AlertKind::StoreWriteFailure,
    ];

    pub fn has_rule(&self) -> bool {
        !Self::ESCALATIONS.contains(self)
    }
}

/// Operator-configured alert rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub kind: AlertKind,
    pub enabled: bool,
    pub threshold: f64,
    pub multiplier: Option<f64>,
}

/// A fired alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub id: i64,
    pub server_id: i64,
    pub kind: AlertKind,
    pub triggered_at: DateTime<Utc>,
    pub dedup_key: String,
    pub details: String,
    /// Set when the condition stopped holding.
    pub cleared_at: Option<DateTime<Utc>>,
}

/// Classes of time-series tables subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableClass {
    Samples,
    Deltas,
    Runs,
    AlertEvents,
}

impl TableClass {
    pub const ALL: [TableClass; 4] = [
        TableClass::Samples,
        TableClass::Deltas,
        TableClass::Runs,
        TableClass::AlertEvents,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            TableClass::Samples => "raw_samples",
            TableClass::Deltas => "metric_deltas",
            TableClass::Runs => "collection_runs",
            TableClass::AlertEvents => "alert_events",
        }
    }

    /// Column holding the row's collection time.
    pub fn time_column(&self) -> &'static str {
        match self {
            TableClass::Samples => "collected_at",
            TableClass::Deltas => "interval_end",
            TableClass::Runs => "started_at",
            TableClass::AlertEvents => "triggered_at",
        }
    }
}

/// How long rows of one table class stay in the live store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionPolicy {
    pub table: TableClass,
    pub max_age_days: i64,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Row filters accepted by [`crate::db::Store::query`].
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub server_id: Option<i64>,
    pub category: Option<String>,
    /// Counter name for deltas, collector id (as text) for runs, kind for alerts.
    pub key: Option<String>,
    pub limit: Option<i64>,
}

/// A row returned by the generic query surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum StoredRow {
    Sample(RawSample),
    Delta(MetricDelta),
    Run(CollectionRun),
    AlertEvent(AlertEvent),
}

/// Per (server, collector) entry of the health view.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthEntry {
    pub server_id: i64,
    pub server_name: String,
    pub collector_id: i64,
    pub collector_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
    pub suspended_reason: Option<String>,
    pub condition: HealthCondition,
}

/// What the health view shows for a collector, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCondition {
    Hung,
    Suspended,
    Failing,
    Running,
    Healthy,
    NeverRun,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(CounterKind {
    CounterKind::Monotonic => "monotonic",
    CounterKind::PointInTime => "point_in_time",
});

text_enum!(RunStatus {
    RunStatus::Success => "success",
    RunStatus::Error => "error",
    RunStatus::Timeout => "timeout",
    RunStatus::Skipped => "skipped",
    RunStatus::Running => "running",
});

text_enum!(AlertKind {
    AlertKind::Cpu => "cpu",
    AlertKind::Blocking => "blocking",
    AlertKind::Deadlock => "deadlock",
    AlertKind::PoisonWait => "poison_wait",
    AlertKind::LongRunningQuery => "long_running_query",
    AlertKind::TempDbSpace => "tempdb_space",
    AlertKind::LongRunningJob => "long_running_job",
    AlertKind::ConnectionChange => "connection_change",
    AlertKind::CollectorHung => "collector_hung",
    AlertKind::CollectorSuspended => "collector_suspended",
    AlertKind::StoreWriteFailure => "store_write_failure",
});

text_enum!(TableClass {
    TableClass::Samples => "samples",
    TableClass::Deltas => "deltas",
    TableClass::Runs => "runs",
    TableClass::AlertEvents => "alert_events",
});

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_text_enums_round_trip_serde_names() {
        for kind in AlertKind::ALL.into_iter().chain(AlertKind::ESCALATIONS) {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<AlertKind>().unwrap(), kind);
        }
        assert_eq!("point_in_time".parse::<CounterKind>().unwrap(), CounterKind::PointInTime);
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_rate_per_second() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let delta = MetricDelta {
            server_id: 1,
            category: "waits".to_string(),
            counter_name: "wait_ms:CXPACKET".to_string(),
            interval_start: start,
            interval_end: start + chrono::Duration::seconds(50),
            delta_value: 100.0,
            is_valid: true,
        };
        assert_eq!(delta.rate_per_second(), Some(2.0));

        let empty = MetricDelta { interval_end: start, ..delta };
        assert_eq!(empty.rate_per_second(), None);
    }
}
