use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs that tune queue polling, worker concurrency and dataset creation.
///
/// Every section carries defaults so a deployment only has to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Poll cadence and start-up recovery.
    pub queue: QueueConfig,
    /// Worker instances per job type.
    pub workers: WorkerConfig,
    /// Delays applied when a job is handed back to the queue.
    pub retry: RetryConfig,
    /// Result files and key derivation.
    pub datasets: DatasetConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Sleep between polls when a worker found nothing to claim.
    pub poll_interval_ms: u64,
    /// Upper bound of the random delay added to each sleep so that worker
    /// instances do not poll in lockstep.
    pub jitter_ms: u64,
    /// Clear every claim before the first poll.
    pub release_on_start: bool,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            jitter_ms: 250,
            release_on_start: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Instances spawned for a job type whose descriptor does not set one.
    pub default_max_instances: usize,
    /// Per-jobtype instance counts, taking precedence over descriptors.
    pub overrides: HashMap<String, usize>,
}

impl WorkerConfig {
    pub fn instances_for(&self, jobtype: &str, declared: Option<usize>) -> usize {
        self.overrides
            .get(jobtype)
            .copied()
            .or(declared)
            .unwrap_or(self.default_max_instances)
            .max(1)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_max_instances: 1,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before a job interrupted for shutdown becomes claimable again.
    pub retry_delay_secs: i64,
    /// Delay after a worker (not a processor) failed on a job.
    pub failure_backoff_secs: i64,
    /// Times a `cancel-dataset` job is retried while its target is not
    /// running in this process.
    pub cancel_max_attempts: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 10,
            failure_backoff_secs: 60,
            cancel_max_attempts: 5,
        }
    }
}

/// What `Dataset::create` does when the derived key already exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCollisionPolicy {
    /// Return the existing dataset.
    #[default]
    ReuseExisting,
    /// Fail with `DuplicateDataset`.
    Reject,
    /// Re-derive the key with a shifted salt until it is unused.
    Reroll,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory holding result files and dataset logs.
    pub result_dir: PathBuf,
    pub key_collision: KeyCollisionPolicy,
    /// Extension used when a processor does not declare one.
    pub default_extension: String,
    /// Recorded on every dataset this process creates.
    pub software_version: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            result_dir: PathBuf::from("data"),
            key_collision: KeyCollisionPolicy::default(),
            default_extension: "csv".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_payload_keeps_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"queue": {"poll_interval_ms": 50}, "datasets": {"key_collision": "reroll"}}"#,
        )
        .unwrap();

        assert_eq!(config.queue.poll_interval_ms, 50);
        assert_eq!(config.queue.jitter_ms, 250);
        assert_eq!(config.datasets.key_collision, KeyCollisionPolicy::Reroll);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn instance_overrides_win_over_descriptors() {
        let mut workers = WorkerConfig::default();
        workers.overrides.insert("scrape".into(), 4);

        assert_eq!(workers.instances_for("scrape", Some(2)), 4);
        assert_eq!(workers.instances_for("count", Some(2)), 2);
        assert_eq!(workers.instances_for("count", None), 1);
    }
}
