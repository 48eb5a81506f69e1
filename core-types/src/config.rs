// Copyright (c) James Kassemi, SC, US. All rights reserved.

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

/// Daemon configuration with the operator knobs the stores and the
/// ingestion driver consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the SQLite ledger-entry database.
    pub db_path: String,
    /// Address the JSON-RPC listener binds.
    pub rpc_listen_addr: String,
    /// Unix socket the ledger source publishes close-meta frames on.
    pub ledger_source_socket: String,
    /// Base URL of the history archive.
    pub history_archive_url: String,
    /// Event retention window in ledgers (about 24 hours of history).
    pub event_retention_window: u32,
    /// Transaction retention window in ledgers.
    pub transaction_retention_window: u32,
    /// Deadline for checkpoint bootstrap and ledger-range preparation,
    /// in seconds. Streaming pulls are not bounded by this.
    pub ingestion_timeout_secs: u64,
    /// Ledger entries buffered per write-transaction flush.
    pub max_ledger_entry_batch_size: usize,
    /// Hard cap on events returned by a single getEvents call.
    pub max_events_limit: usize,
    /// Limit applied when a getEvents request does not set one.
    pub default_events_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "meridian.sqlite".to_string(),
            rpc_listen_addr: "127.0.0.1:8000".to_string(),
            ledger_source_socket: "meridian-source.sock".to_string(),
            history_archive_url: "http://localhost:1570".to_string(),
            event_retention_window: 17280,
            transaction_retention_window: 1440,
            ingestion_timeout_secs: 1800,
            max_ledger_entry_batch_size: 150,
            max_events_limit: 10000,
            default_events_limit: 100,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name("meridian.toml").required(false))
            .add_source(config::Environment::with_prefix("MERIDIAN"))
            .build()?;
        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_documentation() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.event_retention_window, 17280);
        assert_eq!(cfg.transaction_retention_window, 1440);
        assert_eq!(cfg.max_ledger_entry_batch_size, 150);
        assert_eq!(cfg.default_events_limit, 100);
    }
}
