//! HTTP counter adapter.
//!
//! Reads counters from an exporter that serves
//! `GET {connection_ref}/counters/{category}` as `{"counters": {"name": value}}`.

use super::{CollectorAdapter, CollectorError};
use crate::db::{RawSample, ServerTarget};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CounterResponse {
    #[serde(default)]
    collected_at: Option<DateTime<Utc>>,
    counters: BTreeMap<String, f64>,
}

/// Collector adapter backed by an HTTP/JSON counter exporter.
#[derive(Clone)]
pub struct HttpCounterAdapter {
    client: reqwest::Client,
    jitter_ms: u64,
}

impl HttpCounterAdapter {
    pub fn new(timeout: Duration) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Connectivity(e.to_string()))?;
        Ok(Self { client, jitter_ms: 100 })
    }
}

#[async_trait]
impl CollectorAdapter for HttpCounterAdapter {
    async fn collect(&self, server: &ServerTarget, category: &str) -> Result<RawSample, CollectorError> {
        // Spread simultaneous requests to the same exporter
        if self.jitter_ms > 0 {
            let jitter = rand::random::<u64>() % self.jitter_ms;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let url = counters_url(&server.connection_ref, category);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                CollectorError::QueryTimeout(e.to_string())
            } else {
                CollectorError::Connectivity(e.to_string())
            }
        })?;

        if let Some(err) = classify_status(response.status(), category) {
            return Err(err);
        }

        let body: CounterResponse = response
            .json()
            .await
            .map_err(|e| CollectorError::Connectivity(format!("invalid counter payload: {}", e)))?;

        Ok(RawSample {
            server_id: server.id,
            category: category.to_string(),
            collected_at: body.collected_at.unwrap_or_else(Utc::now),
            counters: body.counters,
        })
    }
}

fn counters_url(base: &str, category: &str) -> String {
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    format!("{}/counters/{}", base.trim_end_matches('/'), category)
}

fn classify_status(status: StatusCode, category: &str) -> Option<CollectorError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CollectorError::Permission(format!("{} denied reading {}", status, category))
        }
        StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => {
            CollectorError::Unsupported(format!("{} not available ({})", category, status))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            CollectorError::QueryTimeout(format!("{} query timed out ({})", category, status))
        }
        other => CollectorError::Connectivity(format!("exporter returned {}", other)),
    })
}
