use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use trellis_core::config::{KeyCollisionPolicy, RetryConfig, WorkerConfig};

use crate::util::parse_bool;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub queue: FileQueueConfig,
    pub workers: Option<WorkerConfig>,
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub datasets: FileDatasetConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileQueueConfig {
    /// Humantime duration, e.g. `"1s"` or `"250ms"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_on_start: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatasetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_collision: Option<KeyCollisionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_extension: Option<String>,
}

/// Environment-derived configuration values.
///
/// Values are kept raw; the loader parses them so malformed input surfaces
/// as a [`ConfigLoadError`](crate::ConfigLoadError) naming the variable.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub result_dir: Option<PathBuf>,
    pub poll_interval: Option<String>,
    pub release_on_start: Option<bool>,
    pub worker_instances: Option<String>,
    pub key_collision: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            config_path: var("TRELLIS_CONFIG").map(PathBuf::from),
            database_url: var("DATABASE_URL"),
            result_dir: var("TRELLIS_RESULT_DIR").map(PathBuf::from),
            poll_interval: var("TRELLIS_POLL_INTERVAL"),
            release_on_start: var("TRELLIS_RELEASE_ON_START").and_then(|raw| parse_bool(&raw)),
            worker_instances: var("TRELLIS_WORKER_INSTANCES"),
            key_collision: var("TRELLIS_KEY_COLLISION"),
        }
    }

    /// Convenience for tests and embedders.
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Self::from_lookup(|name| vars.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_variables_are_ignored() {
        let vars = HashMap::from([
            ("DATABASE_URL".to_string(), "   ".to_string()),
            ("TRELLIS_RESULT_DIR".to_string(), "/srv/trellis".to_string()),
            ("TRELLIS_RELEASE_ON_START".to_string(), "no".to_string()),
        ]);
        let env = EnvConfig::from_map(&vars);
        assert!(env.database_url.is_none());
        assert_eq!(env.result_dir, Some(PathBuf::from("/srv/trellis")));
        assert_eq!(env.release_on_start, Some(false));
    }

    #[test]
    fn file_sections_are_optional() {
        let file: FileConfig = toml::from_str(
            r#"
            [queue]
            poll_interval = "2s"

            [workers.overrides]
            "forum-search" = 4
            "#,
        )
        .unwrap();
        assert_eq!(file.queue.poll_interval.as_deref(), Some("2s"));
        assert_eq!(file.workers.unwrap().overrides["forum-search"], 4);
        assert!(file.retry.is_none());
        assert!(file.database.url.is_none());
    }
}
