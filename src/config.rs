//! Configuration module for countertrail.
//!
//! Loads process configuration from environment variables with sensible
//! defaults. Runtime settings live in the database, see [`crate::settings`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "countertrail.db")
    pub db_path: String,
    /// Directory receiving Parquet archives (default: "archive")
    pub archive_dir: PathBuf,
    /// Optional webhook that receives raised alerts as JSON
    pub webhook_url: Option<String>,
    /// Timeout for a single HTTP request to a counter exporter (default: 30s)
    pub adapter_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "countertrail.db".to_string(),
            archive_dir: PathBuf::from("archive"),
            webhook_url: None,
            adapter_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `COUNTERTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `COUNTERTRAIL_DB_PATH`: Database file path (default: "countertrail.db")
    /// - `COUNTERTRAIL_ARCHIVE_DIR`: Archive directory (default: "archive")
    /// - `COUNTERTRAIL_WEBHOOK_URL`: Alert webhook (default: none)
    /// - `COUNTERTRAIL_ADAPTER_TIMEOUT_SECS`: Exporter request timeout (default: 30)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port_str) = lookup("COUNTERTRAIL_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Some(db_path) = lookup("COUNTERTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(dir) = lookup("COUNTERTRAIL_ARCHIVE_DIR") {
            cfg.archive_dir = PathBuf::from(dir);
        }

        cfg.webhook_url = lookup("COUNTERTRAIL_WEBHOOK_URL").filter(|url| !url.trim().is_empty());

        if let Some(secs) = lookup("COUNTERTRAIL_ADAPTER_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            if secs > 0 {
                cfg.adapter_timeout = Duration::from_secs(secs);
            }
        }

        cfg
    }
}
