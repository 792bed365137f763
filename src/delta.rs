//! Conversion of consecutive raw samples into per-interval deltas.

use crate::db::{CounterKind, MetricDelta, RawSample};

use std::collections::HashMap;
use std::sync::Mutex;

/// Compute the deltas between two samples of the same (server, category).
///
/// Monotonic counters need a previous observation; the first sample only
/// establishes a baseline. A value lower than its predecessor is treated as
/// a counter reset and produces an invalid zero delta instead of a negative
/// one. Point-in-time counters pass through unchanged.
pub fn compute_delta(previous: Option<&RawSample>, current: &RawSample, kind: CounterKind) -> Vec<MetricDelta> {
    let interval_start = previous.map(|p| p.collected_at).unwrap_or(current.collected_at);
    let row = |name: &str, value: f64, is_valid: bool| MetricDelta {
        server_id: current.server_id,
        category: current.category.clone(),
        counter_name: name.to_string(),
        interval_start,
        interval_end: current.collected_at,
        delta_value: value,
        is_valid,
    };

    match kind {
        CounterKind::PointInTime => current
            .counters
            .iter()
            .map(|(name, value)| row(name.as_str(), *value, true))
            .collect(),
        CounterKind::Monotonic => {
            let Some(previous) = previous else {
                return Vec::new();
            };
            current
                .counters
                .iter()
                .filter_map(|(name, value)| {
                    let before = previous.counters.get(name)?;
                    if value >= before {
                        Some(row(name.as_str(), value - before, true))
                    } else {
                        tracing::warn!(
                            "DeltaEngine: counter reset on server {} {}/{} ({} -> {}), using new baseline",
                            current.server_id,
                            current.category,
                            name,
                            before,
                            value
                        );
                        Some(row(name.as_str(), 0.0, false))
                    }
                })
                .collect()
        }
    }
}

/// Owns the last observed sample per (server, category).
#[derive(Default)]
pub struct DeltaEngine {
    last: Mutex<HashMap<(i64, String), RawSample>>,
}

impl DeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute deltas against the cached sample and make `sample` the new baseline.
    pub fn observe(&self, sample: &RawSample, kind: CounterKind) -> Vec<MetricDelta> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let key = (sample.server_id, sample.category.clone());
        let deltas = compute_delta(last.get(&key), sample, kind);
        last.insert(key, sample.clone());
        deltas
    }

    /// Drop every cached sample for a server.
    pub fn evict_server(&self, server_id: i64) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.retain(|(id, _), _| *id != server_id);
    }

    #[cfg(test)]
    pub fn cached_len(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
