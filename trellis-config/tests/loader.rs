use std::collections::HashMap;
use std::path::PathBuf;

use trellis_config::{ConfigLoadError, ConfigLoader, EnvConfig};
use trellis_core::config::KeyCollisionPolicy;

fn env(vars: &[(&str, &str)]) -> EnvConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    EnvConfig::from_map(&vars)
}

fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trellis.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

const SAMPLE: &str = r#"
[database]
url = "postgres://trellis@localhost/trellis"

[queue]
poll_interval = "2s"
jitter = "100ms"

[workers]
default_max_instances = 2

[workers.overrides]
"forum-search" = 4

[retry]
retry_delay_secs = 30
failure_backoff_secs = 120
cancel_max_attempts = 3

[datasets]
result_dir = "/var/lib/trellis/data"
key_collision = "reroll"
default_extension = ".ndjson"
"#;

#[test]
fn file_values_are_applied() {
    let (_dir, path) = write_config(SAMPLE);
    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false)
        .unwrap();
    let config = load.config;

    assert_eq!(
        config.database.url.as_deref(),
        Some("postgres://trellis@localhost/trellis")
    );
    let orchestrator = &config.orchestrator;
    assert_eq!(orchestrator.queue.poll_interval_ms, 2_000);
    assert_eq!(orchestrator.queue.jitter_ms, 100);
    assert!(orchestrator.queue.release_on_start);
    assert_eq!(orchestrator.workers.instances_for("forum-search", Some(1)), 4);
    assert_eq!(orchestrator.workers.instances_for("count-posts", None), 2);
    assert_eq!(orchestrator.retry.retry_delay_secs, 30);
    assert_eq!(orchestrator.datasets.key_collision, KeyCollisionPolicy::Reroll);
    assert_eq!(orchestrator.datasets.default_extension, "ndjson");
    assert_eq!(config.metadata.config_path, Some(path));
    assert!(load.warnings.is_empty());
}

#[test]
fn environment_overrides_the_file() {
    let (_dir, path) = write_config(SAMPLE);
    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(
            env(&[
                ("DATABASE_URL", "postgres://override/trellis"),
                ("TRELLIS_RESULT_DIR", "/tmp/results"),
                ("TRELLIS_POLL_INTERVAL", "750ms"),
                ("TRELLIS_KEY_COLLISION", "reject"),
                ("TRELLIS_WORKER_INSTANCES", "3"),
            ]),
            false,
        )
        .unwrap();
    let config = load.config;

    assert_eq!(config.database.url.as_deref(), Some("postgres://override/trellis"));
    assert_eq!(config.result_dir(), &PathBuf::from("/tmp/results"));
    assert_eq!(config.orchestrator.queue.poll_interval_ms, 750);
    assert_eq!(config.orchestrator.datasets.key_collision, KeyCollisionPolicy::Reject);
    assert_eq!(config.orchestrator.workers.default_max_instances, 3);
}

#[test]
fn env_config_path_is_used_when_no_explicit_path_is_given() {
    let (_dir, path) = write_config("[queue]\npoll_interval = \"5s\"\n");
    let load = ConfigLoader::new()
        .load_with_env(env(&[("TRELLIS_CONFIG", path.to_str().unwrap())]), false)
        .unwrap();
    assert_eq!(load.config.orchestrator.queue.poll_interval_ms, 5_000);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_with_env(EnvConfig::default(), false);
    assert!(matches!(result, Err(ConfigLoadError::MissingConfig { .. })));
}

#[test]
fn malformed_values_name_their_source() {
    let (_dir, path) = write_config("[queue]\npoll_interval = \"soonish\"\n");
    let result = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false);
    match result {
        Err(ConfigLoadError::InvalidDuration { name, .. }) => assert_eq!(name, "queue.poll_interval"),
        other => panic!("unexpected result: {other:?}"),
    }

    let (_dir, path) = write_config("[queue\n");
    let result = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false);
    assert!(matches!(result, Err(ConfigLoadError::Parse { .. })));

    let (_dir, path) = write_config("");
    let result = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[("TRELLIS_KEY_COLLISION", "sometimes")]), false);
    assert!(matches!(result, Err(ConfigLoadError::InvalidValue { .. })));
}

#[test]
fn guard_rails_reject_a_zero_poll_interval() {
    let (_dir, path) = write_config("[queue]\npoll_interval = \"0s\"\n");
    let result = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false);
    assert!(matches!(result, Err(ConfigLoadError::GuardRail(_))));
}

#[test]
fn running_without_a_database_is_a_warning() {
    let (_dir, path) = write_config("");
    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false)
        .unwrap();
    assert!(load.config.database.url.is_none());
    assert_eq!(load.warnings.items.len(), 1);
}
