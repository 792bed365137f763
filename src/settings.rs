//! Operator-editable runtime settings.
//!
//! Components read an immutable [`Settings`] snapshot; [`SettingsHandle::update`]
//! is the only way to change it and publishes the new snapshot to every
//! subscriber after persisting it.

use crate::db::{AlertKind, AlertRule, DbError, RetentionPolicy, Store, TableClass};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid setting: {0}")]
    Validation(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of every runtime setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Scheduler tick period in seconds.
    pub tick_interval_secs: u64,
    /// Maximum servers polled at the same time.
    pub max_concurrency: usize,
    /// Per collector run timeout in seconds.
    pub run_timeout_secs: u64,
    /// A run is hung after this many collector intervals in `Running`.
    pub hung_multiplier: f64,
    /// How often the retention manager archives expired rows, in seconds.
    pub archive_interval_secs: u64,
    pub retention: Vec<RetentionPolicy>,
    pub alert_rules: Vec<AlertRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15,
            max_concurrency: 4,
            run_timeout_secs: 60,
            hung_multiplier: 3.0,
            archive_interval_secs: 3600,
            retention: default_retention(),
            alert_rules: Vec::new(),
        }
    }
}

/// Default retention per table class.
pub fn default_retention() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy { table: TableClass::Samples, max_age_days: 7 },
        RetentionPolicy { table: TableClass::Deltas, max_age_days: 30 },
        RetentionPolicy { table: TableClass::Runs, max_age_days: 30 },
        RetentionPolicy { table: TableClass::AlertEvents, max_age_days: 90 },
    ]
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }

    pub fn rule(&self, kind: AlertKind) -> Option<&AlertRule> {
        self.alert_rules.iter().find(|r| r.kind == kind)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tick_interval_secs == 0 {
            return Err(SettingsError::Validation("tick interval must be at least 1 second".into()));
        }
        if self.max_concurrency == 0 {
            return Err(SettingsError::Validation("max concurrency must be at least 1".into()));
        }
        if self.run_timeout_secs == 0 {
            return Err(SettingsError::Validation("run timeout must be at least 1 second".into()));
        }
        if !(self.hung_multiplier >= 1.0) {
            return Err(SettingsError::Validation("hung multiplier must be at least 1".into()));
        }
        if self.archive_interval_secs == 0 {
            return Err(SettingsError::Validation("archive interval must be at least 1 second".into()));
        }
        for policy in &self.retention {
            if policy.max_age_days < 1 {
                return Err(SettingsError::Validation(format!(
                    "retention for {} must be at least 1 day",
                    policy.table
                )));
            }
        }
        for rule in &self.alert_rules {
            if !rule.threshold.is_finite() || rule.threshold < 0.0 {
                return Err(SettingsError::Validation(format!(
                    "threshold for {} must be a non-negative number",
                    rule.kind
                )));
            }
            if let Some(m) = rule.multiplier {
                if !(m > 0.0) || !m.is_finite() {
                    return Err(SettingsError::Validation(format!(
                        "multiplier for {} must be positive",
                        rule.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

const KEY_TICK: &str = "tick_interval_secs";
const KEY_CONCURRENCY: &str = "max_concurrency";
const KEY_TIMEOUT: &str = "run_timeout_secs";
const KEY_HUNG: &str = "hung_multiplier";
const KEY_ARCHIVE: &str = "archive_interval_secs";
const KEY_RETENTION: &str = "retention";

/// Single writer for [`Settings`]; hands out read-only receivers.
pub struct SettingsHandle {
    store: Arc<Store>,
    tx: watch::Sender<Arc<Settings>>,
    write_lock: Mutex<()>,
}

impl SettingsHandle {
    /// Load persisted settings, falling back to defaults for missing keys.
    pub fn load(store: Arc<Store>) -> Result<Self, SettingsError> {
        let stored = store.get_settings()?;
        let mut settings = Settings::default();

        fn read<T: serde::de::DeserializeOwned>(stored: &BTreeMap<String, String>, key: &str, slot: &mut T) {
            if let Some(raw) = stored.get(key) {
                match serde_json::from_str(raw) {
                    Ok(value) => *slot = value,
                    Err(e) => tracing::warn!("Settings: ignoring unreadable {}: {}", key, e),
                }
            }
        }
        read(&stored, KEY_TICK, &mut settings.tick_interval_secs);
        read(&stored, KEY_CONCURRENCY, &mut settings.max_concurrency);
        read(&stored, KEY_TIMEOUT, &mut settings.run_timeout_secs);
        read(&stored, KEY_HUNG, &mut settings.hung_multiplier);
        read(&stored, KEY_ARCHIVE, &mut settings.archive_interval_secs);
        read(&stored, KEY_RETENTION, &mut settings.retention);
        settings.alert_rules = store.get_alert_rules()?;

        if let Err(e) = settings.validate() {
            tracing::warn!("Settings: stored settings invalid ({}), using defaults", e);
            let alert_rules = settings.alert_rules;
            settings = Settings { alert_rules, ..Settings::default() };
        }

        let (tx, _) = watch::channel(Arc::new(settings));
        Ok(Self {
            store,
            tx,
            write_lock: Mutex::new(()),
        })
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Apply a change: validate, persist, then publish.
    pub fn update<F>(&self, f: F) -> Result<Arc<Settings>, SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.current()).clone();
        f(&mut next);
        next.validate()?;

        let mut values = BTreeMap::new();
        values.insert(KEY_TICK.to_string(), serde_json::to_string(&next.tick_interval_secs)?);
        values.insert(KEY_CONCURRENCY.to_string(), serde_json::to_string(&next.max_concurrency)?);
        values.insert(KEY_TIMEOUT.to_string(), serde_json::to_string(&next.run_timeout_secs)?);
        values.insert(KEY_HUNG.to_string(), serde_json::to_string(&next.hung_multiplier)?);
        values.insert(KEY_ARCHIVE.to_string(), serde_json::to_string(&next.archive_interval_secs)?);
        values.insert(KEY_RETENTION.to_string(), serde_json::to_string(&next.retention)?);
        self.store.put_settings(&values)?;
        for rule in &next.alert_rules {
            self.store.save_alert_rule(rule)?;
        }

        let next = Arc::new(next);
        self.tx.send_replace(next.clone());
        tracing::info!("Settings: updated");
        Ok(next)
    }
}
