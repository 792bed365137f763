//! HTTP request handlers.

use super::AppState;
use crate::db::{
    AlertKind, AlertRule, CollectorDefinition, CounterKind, DbError, RetentionPolicy, RowFilter, ServerTarget, TableClass,
    TimeRange,
};
use crate::scheduler::ScheduleError;
use crate::settings::SettingsError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn db_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn schedule_error(e: ScheduleError) -> Response {
    match e {
        ScheduleError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        ScheduleError::UnknownCollector(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        ScheduleError::Busy(_) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        ScheduleError::Db(e) => db_error(e),
    }
}

fn settings_error(e: SettingsError) -> Response {
    match e {
        SettingsError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        SettingsError::Db(e) => db_error(e),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Servers
// ============================================================================

pub async fn handle_get_servers(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_servers() {
        Ok(servers) => Json(servers).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    pub connection_ref: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

fn validate_server(req: &ServerRequest) -> Result<(), &'static str> {
    if req.name.trim().is_empty() {
        return Err("Server name is required");
    }
    if req.connection_ref.trim().is_empty() {
        return Err("Connection reference is required");
    }
    Ok(())
}

pub async fn handle_create_server(
    State(state): State<AppState>,
    Json(req): Json<ServerRequest>,
) -> impl IntoResponse {
    if let Err(msg) = validate_server(&req) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let mut server = ServerTarget {
        id: 0,
        name: req.name,
        connection_ref: req.connection_ref,
        enabled: req.enabled,
        favorite: req.favorite,
        description: req.description,
        deleted_at: None,
    };

    match state.store.add_server(&mut server) {
        Ok(_) => {
            tracing::info!("Added server {} ({})", server.name, server.id);
            (StatusCode::CREATED, Json(server)).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn handle_update_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ServerRequest>,
) -> impl IntoResponse {
    if let Err(msg) = validate_server(&req) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    let updated = ServerTarget {
        id,
        name: req.name,
        connection_ref: req.connection_ref,
        enabled: req.enabled,
        favorite: req.favorite,
        description: req.description,
        deleted_at: None,
    };

    match state.store.update_server(&updated) {
        Ok(_) => Json(updated).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Also remove every stored row for the server.
    #[serde(default)]
    pub purge: bool,
}

pub async fn handle_delete_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> impl IntoResponse {
    let result = if query.purge {
        state.store.purge_server(id)
    } else {
        state.store.delete_server(id, Utc::now())
    };
    match result {
        Ok(_) => {
            state.orchestrator.forget_server(id);
            tracing::info!("Deleted server {} (purge: {})", id, query.purge);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub server_id: i64,
    pub started_at: DateTime<Utc>,
}

pub async fn handle_run_now(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.orchestrator.run_now(id) {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(RunAccepted {
                server_id: id,
                started_at: Utc::now(),
            }),
        )
            .into_response(),
        Err(e) => schedule_error(e),
    }
}

pub async fn handle_resume_collector(
    State(state): State<AppState>,
    Path((id, collector_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    if state.orchestrator.resume_collector(id, collector_id) {
        tracing::info!("Resumed collector {} on server {}", collector_id, id);
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Collector is not suspended on this server").into_response()
    }
}

// ============================================================================
// API: Collectors, alert rules, settings
// ============================================================================

pub async fn handle_get_collectors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.schedule().collectors())
}

#[derive(Debug, Deserialize)]
pub struct CollectorRequest {
    pub name: String,
    pub category: String,
    pub counter_kind: CounterKind,
    pub interval_minutes: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

pub async fn handle_create_collector(
    State(state): State<AppState>,
    Json(req): Json<CollectorRequest>,
) -> impl IntoResponse {
    let def = CollectorDefinition {
        id: 0,
        name: req.name,
        category: req.category,
        counter_kind: req.counter_kind,
        interval_minutes: req.interval_minutes,
        enabled: req.enabled,
    };
    match state.orchestrator.schedule().add_collector(def) {
        Ok(def) => (StatusCode::CREATED, Json(def)).into_response(),
        Err(e) => schedule_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CollectorUpdate {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i64>,
}

pub async fn handle_update_collector(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CollectorUpdate>,
) -> impl IntoResponse {
    let schedule = state.orchestrator.schedule();
    if let Some(minutes) = req.interval_minutes {
        if let Err(e) = schedule.update_interval(id, minutes) {
            return schedule_error(e);
        }
    }
    if let Some(enabled) = req.enabled {
        if let Err(e) = schedule.set_enabled(id, enabled) {
            return schedule_error(e);
        }
    }
    match schedule.collector(id) {
        Some(def) => Json(def).into_response(),
        None => schedule_error(ScheduleError::UnknownCollector(id)),
    }
}

pub async fn handle_get_alert_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.current().alert_rules.clone())
}

#[derive(Debug, Deserialize)]
pub struct AlertRuleUpdate {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub multiplier: Option<f64>,
}

pub async fn handle_update_alert_rule(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(req): Json<AlertRuleUpdate>,
) -> impl IntoResponse {
    let kind = match AlertKind::from_str(&kind) {
        Ok(k) if k.has_rule() => k,
        Ok(k) => return (StatusCode::NOT_FOUND, format!("{} alerts have no rule", k)).into_response(),
        Err(e) => return (StatusCode::NOT_FOUND, e).into_response(),
    };

    let result = state.settings.update(|s| {
        if !s.alert_rules.iter().any(|r| r.kind == kind) {
            s.alert_rules.push(AlertRule {
                kind,
                enabled: true,
                threshold: 0.0,
                multiplier: None,
            });
        }
        if let Some(rule) = s.alert_rules.iter_mut().find(|r| r.kind == kind) {
            if let Some(enabled) = req.enabled {
                rule.enabled = enabled;
            }
            if let Some(threshold) = req.threshold {
                rule.threshold = threshold;
            }
            if req.multiplier.is_some() {
                rule.multiplier = req.multiplier;
            }
        }
    });

    match result {
        Ok(settings) => match settings.rule(kind) {
            Some(rule) => Json(rule.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Err(e) => settings_error(e),
    }
}

pub async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json((*state.settings.current()).clone())
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub tick_interval_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub run_timeout_secs: Option<u64>,
    pub hung_multiplier: Option<f64>,
    pub archive_interval_secs: Option<u64>,
    pub retention: Option<Vec<RetentionPolicy>>,
}

pub async fn handle_update_settings(
    State(state): State<AppState>,
    Json(req): Json<SettingsUpdate>,
) -> impl IntoResponse {
    let result = state.settings.update(|s| {
        if let Some(v) = req.tick_interval_secs {
            s.tick_interval_secs = v;
        }
        if let Some(v) = req.max_concurrency {
            s.max_concurrency = v;
        }
        if let Some(v) = req.run_timeout_secs {
            s.run_timeout_secs = v;
        }
        if let Some(v) = req.hung_multiplier {
            s.hung_multiplier = v;
        }
        if let Some(v) = req.archive_interval_secs {
            s.archive_interval_secs = v;
        }
        if let Some(policies) = req.retention {
            for policy in policies {
                match s.retention.iter_mut().find(|p| p.table == policy.table) {
                    Some(existing) => existing.max_age_days = policy.max_age_days,
                    None => s.retention.push(policy),
                }
            }
        }
    });

    match result {
        Ok(settings) => Json((*settings).clone()).into_response(),
        Err(e) => settings_error(e),
    }
}

// ============================================================================
// API: Data
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    #[serde(default)]
    pub server_id: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    /// Counter name, collector ID or alert kind depending on the table.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Parse an RFC 3339 range, defaulting to the last hour.
fn parse_range(start: Option<&str>, end: Option<&str>) -> TimeRange {
    let end = end
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let start = start
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| end - ChronoDuration::hours(1));

    TimeRange::new(start, end)
}

pub async fn handle_query(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<DataQuery>,
) -> impl IntoResponse {
    let table = match TableClass::from_str(&table) {
        Ok(t) => t,
        Err(e) => return (StatusCode::NOT_FOUND, e).into_response(),
    };
    let range = parse_range(query.start.as_deref(), query.end.as_deref());
    if range.start > range.end {
        return (StatusCode::BAD_REQUEST, "start must not be after end").into_response();
    }
    let filter = RowFilter {
        server_id: query.server_id,
        category: query.category,
        key: query.key,
        limit: query.limit,
    };

    match state.store.query(table, &filter, range) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let multiplier = state.settings.current().hung_multiplier;
    match state.store.health(Utc::now(), multiplier) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_active_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.alerts().active_alerts())
}

// ============================================================================
// API: Control
// ============================================================================

pub async fn handle_pause(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.pause();
    StatusCode::NO_CONTENT
}

pub async fn handle_resume(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.resume();
    StatusCode::NO_CONTENT
}

pub async fn handle_archive(State(state): State<AppState>) -> impl IntoResponse {
    match state.retention.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub paused: bool,
    pub polling_servers: Vec<i64>,
    pub active_alerts: usize,
    pub schema_version: Option<i64>,
    pub db_size_bytes: i64,
    pub db_size: String,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let db_size = state.store.get_db_size_bytes().unwrap_or(0);
    Json(StatusResponse {
        paused: state.orchestrator.is_paused(),
        polling_servers: state.orchestrator.polling_servers(),
        active_alerts: state.orchestrator.alerts().active_alerts().len(),
        schema_version: state.store.schema_version().unwrap_or(None),
        db_size_bytes: db_size,
        db_size: format_bytes(db_size),
    })
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
