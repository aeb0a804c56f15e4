use thiserror::Error;
use tracing::warn;

use crate::models::TrellisConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// Emit every warning through `tracing`.
    pub fn log(&self) {
        for warning in &self.items {
            match &warning.hint {
                Some(hint) => {
                    warn!(message = %warning.message, hint = %hint, "configuration warning")
                }
                None => warn!(message = %warning.message, "configuration warning"),
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("queue.poll_interval must be greater than zero")]
    ZeroPollInterval,
    #[error("retry delays must not be negative")]
    NegativeRetryDelay,
    #[error("datasets.default_extension must not be empty")]
    EmptyDefaultExtension,
}

/// Reject settings the runtime cannot work with and warn about ones that
/// are legal but probably unintended.
pub fn apply_guard_rails(config: &TrellisConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    if orchestrator.queue.poll_interval_ms == 0 {
        return Err(ConfigGuardRailError::ZeroPollInterval);
    }
    if orchestrator.retry.retry_delay_secs < 0 || orchestrator.retry.failure_backoff_secs < 0 {
        return Err(ConfigGuardRailError::NegativeRetryDelay);
    }
    if orchestrator.datasets.default_extension.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyDefaultExtension);
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "No database configured; jobs and datasets are kept in memory and lost on exit",
            "Set DATABASE_URL or [database].url to use Postgres",
        );
    }
    if !orchestrator.queue.release_on_start {
        warnings.push_with_hint(
            "queue.release_on_start is disabled; claims held by a crashed process stay claimed",
            "Run `trellis-backend release` after an unclean shutdown",
        );
    }
    for (jobtype, instances) in &orchestrator.workers.overrides {
        if *instances == 0 {
            warnings.push(format!(
                "workers.overrides.{jobtype} is 0; one instance will run anyway"
            ));
        }
    }
    if orchestrator.queue.jitter_ms > orchestrator.queue.poll_interval_ms {
        warnings.push("queue.jitter exceeds queue.poll_interval");
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatabaseConfig;

    fn config() -> TrellisConfig {
        TrellisConfig {
            database: DatabaseConfig {
                url: Some("postgres://localhost/trellis".into()),
            },
            ..TrellisConfig::default()
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        assert!(apply_guard_rails(&config()).unwrap().is_empty());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = config();
        config.orchestrator.queue.poll_interval_ms = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::ZeroPollInterval
        );
    }

    #[test]
    fn in_memory_operation_is_flagged() {
        let mut config = config();
        config.database.url = None;
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }
}
