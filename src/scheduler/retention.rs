//! Retention manager for archiving and purging old data.

use crate::db::{ArchiveReport, DbError, Store};
use crate::settings::Settings;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Periodically moves rows past their retention age into archive files.
pub struct RetentionManager {
    store: Arc<Store>,
    archive_dir: PathBuf,
    settings: watch::Receiver<Arc<Settings>>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
    running: Arc<Mutex<()>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, archive_dir: PathBuf, settings: watch::Receiver<Arc<Settings>>) -> Self {
        Self {
            store,
            archive_dir,
            settings,
            stop: Arc::new(Mutex::new(None)),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let archive_dir = self.archive_dir.clone();
        let mut settings = self.settings.clone();
        let stop = self.stop.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut period = settings.borrow().archive_interval();
            let mut interval = archive_ticker(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    changed = settings.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = settings.borrow().archive_interval();
                        if next != period {
                            tracing::info!("RetentionManager: archive interval changed to {:?}", next);
                            period = next;
                            interval = archive_ticker(period);
                            // The first tick of a fresh interval fires at once.
                            interval.reset();
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = process_retention(&store, &archive_dir, &settings, &running).await {
                            tracing::error!("RetentionManager: archive pass failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Run one archive pass now.
    pub async fn run_once(&self) -> Result<ArchiveReport, DbError> {
        process_retention(&self.store, &self.archive_dir, &self.settings, &self.running).await
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn archive_ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

async fn process_retention(
    store: &Arc<Store>,
    archive_dir: &Path,
    settings: &watch::Receiver<Arc<Settings>>,
    running: &Mutex<()>,
) -> Result<ArchiveReport, DbError> {
    // One pass at a time, whether timed or manual
    let _pass = running.lock().await;
    let policies = settings.borrow().retention.clone();
    let store = store.clone();
    let dir = archive_dir.to_path_buf();

    let report = tokio::task::spawn_blocking(move || store.archive_and_purge(&policies, &dir, Utc::now()))
        .await
        .map_err(|e| DbError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    if report.rows_archived() > 0 {
        tracing::info!(
            "RetentionManager: archived {} rows into {} files",
            report.rows_archived(),
            report.files.len()
        );
    } else {
        tracing::debug!("RetentionManager: nothing past retention");
    }
    Ok(report)
}
