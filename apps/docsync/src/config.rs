//! Configuration management for the docsync engine
//!
//! Store-specific settings (database to data-source mapping, vault root) live
//! here and are handed to the store collaborators by the embedding
//! application; nothing reads them from ambient process state.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::conflict::ResolutionStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub remote: RemoteStoreConfig,
    pub local: LocalStoreConfig,
}

/// Engine knobs: queue sizing, concurrency, retry and timeout policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub history_capacity: usize,
    pub emit_timeout_ms: u64,
    pub max_concurrent_tasks: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Timeout for each store client / converter call
    pub io_timeout_ms: u64,
    /// Sanity timeout for acquiring an item lock
    pub lock_timeout_ms: u64,
    pub conflict_history_capacity: usize,
    pub default_strategy: ResolutionStrategy,
    /// Retained failed task records reported by status
    pub failed_task_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            history_capacity: 1000,
            emit_timeout_ms: 250,
            max_concurrent_tasks: 8,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            io_timeout_ms: 30_000,
            lock_timeout_ms: 60_000,
            conflict_history_capacity: 1000,
            default_strategy: ResolutionStrategy::NewerWins,
            failed_task_capacity: 100,
        }
    }
}

/// Remote document store settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteStoreConfig {
    pub api_base: String,
    /// Database id -> data source id
    #[serde(default)]
    pub databases: BTreeMap<String, String>,
    #[serde(default)]
    pub default_database: Option<String>,
}

impl RemoteStoreConfig {
    /// Data source id for a database, falling back to the default database
    pub fn data_source_for(&self, database_id: Option<&str>) -> Option<&str> {
        let database_id = database_id.or(self.default_database.as_deref())?;
        self.databases.get(database_id).map(String::as_str)
    }
}

/// Local file store settings
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStoreConfig {
    pub root: PathBuf,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./vault"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineConfig::default(),
            remote: RemoteStoreConfig {
                api_base: "https://api.example.invalid/v1".to_string(),
                databases: BTreeMap::new(),
                default_database: None,
            },
            local: LocalStoreConfig::default(),
        }
    }
}

impl Config {
    /// Load from `DOCSYNC_*` environment variables (after reading `.env`)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            queue_capacity: parse_or(&lookup, "DOCSYNC_QUEUE_CAPACITY", defaults.queue_capacity)?,
            history_capacity: parse_or(
                &lookup,
                "DOCSYNC_HISTORY_CAPACITY",
                defaults.history_capacity,
            )?,
            emit_timeout_ms: parse_or(&lookup, "DOCSYNC_EMIT_TIMEOUT_MS", defaults.emit_timeout_ms)?,
            max_concurrent_tasks: parse_or(
                &lookup,
                "DOCSYNC_MAX_CONCURRENT_TASKS",
                defaults.max_concurrent_tasks,
            )?,
            max_attempts: parse_or(&lookup, "DOCSYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base_ms: parse_or(&lookup, "DOCSYNC_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parse_or(&lookup, "DOCSYNC_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            io_timeout_ms: parse_or(&lookup, "DOCSYNC_IO_TIMEOUT_MS", defaults.io_timeout_ms)?,
            lock_timeout_ms: parse_or(&lookup, "DOCSYNC_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms)?,
            conflict_history_capacity: parse_or(
                &lookup,
                "DOCSYNC_CONFLICT_HISTORY_CAPACITY",
                defaults.conflict_history_capacity,
            )?,
            default_strategy: parse_or(&lookup, "DOCSYNC_STRATEGY", defaults.default_strategy)?,
            failed_task_capacity: parse_or(
                &lookup,
                "DOCSYNC_FAILED_TASK_CAPACITY",
                defaults.failed_task_capacity,
            )?,
        };

        let mut databases = BTreeMap::new();
        if let Some(raw) = lookup("DOCSYNC_REMOTE_DATABASES") {
            for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (database, source) =
                    pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                        key: "DOCSYNC_REMOTE_DATABASES".to_string(),
                        value: pair.to_string(),
                    })?;
                databases.insert(database.trim().to_string(), source.trim().to_string());
            }
        }

        let default_database = lookup("DOCSYNC_REMOTE_DATABASE_ID").filter(|s| !s.is_empty());
        if let (Some(database), Some(source)) = (
            default_database.as_ref(),
            lookup("DOCSYNC_REMOTE_DATA_SOURCE_ID").filter(|s| !s.is_empty()),
        ) {
            databases.insert(database.clone(), source);
        }

        Ok(Config {
            engine,
            remote: RemoteStoreConfig {
                api_base: lookup("DOCSYNC_REMOTE_API_BASE")
                    .unwrap_or_else(|| "https://api.example.invalid/v1".to_string()),
                databases,
                default_database,
            },
            local: LocalStoreConfig {
                root: lookup("DOCSYNC_LOCAL_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./vault")),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.engine.queue_capacity, 1024);
        assert_eq!(config.engine.history_capacity, 1000);
        assert_eq!(config.engine.default_strategy, ResolutionStrategy::NewerWins);
        assert!(config.remote.databases.is_empty());
    }

    #[test]
    fn test_engine_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DOCSYNC_MAX_ATTEMPTS", "5"),
            ("DOCSYNC_STRATEGY", "manual_choice"),
            ("DOCSYNC_LOCAL_ROOT", "/tmp/vault"),
        ]))
        .unwrap();

        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.engine.default_strategy, ResolutionStrategy::ManualChoice);
        assert_eq!(config.local.root, PathBuf::from("/tmp/vault"));
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("DOCSYNC_QUEUE_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("DOCSYNC_QUEUE_CAPACITY"));
    }

    #[test]
    fn test_database_to_data_source_mapping() {
        let config = Config::from_lookup(lookup_from(&[
            ("DOCSYNC_REMOTE_DATABASES", "analysis=ds-analysis, log=ds-log"),
            ("DOCSYNC_REMOTE_DATABASE_ID", "main"),
            ("DOCSYNC_REMOTE_DATA_SOURCE_ID", "ds-main"),
        ]))
        .unwrap();

        assert_eq!(config.remote.data_source_for(None), Some("ds-main"));
        assert_eq!(config.remote.data_source_for(Some("log")), Some("ds-log"));
        assert_eq!(config.remote.data_source_for(Some("missing")), None);
    }
}
