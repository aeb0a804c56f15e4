use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use trellis_core::config::{KeyCollisionPolicy, OrchestratorConfig};

use crate::{
    models::{ConfigMetadata, DatabaseConfig, TrellisConfig},
    sources::{EnvConfig, FileConfig},
    util::{duration_millis, parse_duration},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["trellis.toml", "config/trellis.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` handling entirely.
    pub skip_env_file: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.options.skip_env_file = true;
        self
    }

    /// Load `.env`, read the process environment and compose the result.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Compose from an already gathered environment. `.env` is not read.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, mut warnings) =
            compose_config(file_config, env, config_path, env_file_loaded)?;
        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(ConfigLoadError::EnvFile(err)),
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists());
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        tracing::debug!(path = %path.display(), "configuration file loaded");
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<(TrellisConfig, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if config_path.is_none() {
        warnings.push_with_hint(
            "No trellis.toml detected; using defaults and environment variables",
            "Create trellis.toml or point TRELLIS_CONFIG at a configuration file",
        );
    }

    let FileConfig {
        database: file_database,
        queue: file_queue,
        workers: file_workers,
        retry: file_retry,
        datasets: file_datasets,
    } = file_config.unwrap_or_default();

    let mut orchestrator = OrchestratorConfig::default();

    let poll_interval = match (&env.poll_interval, &file_queue.poll_interval) {
        (Some(raw), _) => Some(parse_duration_setting("TRELLIS_POLL_INTERVAL", raw)?),
        (None, Some(raw)) => Some(parse_duration_setting("queue.poll_interval", raw)?),
        (None, None) => None,
    };
    if let Some(millis) = poll_interval {
        orchestrator.queue.poll_interval_ms = millis;
    }
    if let Some(raw) = &file_queue.jitter {
        orchestrator.queue.jitter_ms = parse_duration_setting("queue.jitter", raw)?;
    }
    if let Some(release) = env.release_on_start.or(file_queue.release_on_start) {
        orchestrator.queue.release_on_start = release;
    }

    if let Some(workers) = file_workers {
        orchestrator.workers = workers;
    }
    if let Some(raw) = &env.worker_instances {
        orchestrator.workers.default_max_instances =
            raw.trim()
                .parse()
                .map_err(|_| ConfigLoadError::InvalidValue {
                    name: "TRELLIS_WORKER_INSTANCES".into(),
                    value: raw.clone(),
                })?;
    }
    if let Some(retry) = file_retry {
        orchestrator.retry = retry;
    }

    if let Some(result_dir) = env.result_dir.clone().or(file_datasets.result_dir) {
        orchestrator.datasets.result_dir = result_dir;
    }
    let key_collision = match &env.key_collision {
        Some(raw) => Some(parse_key_collision(raw)?),
        None => file_datasets.key_collision,
    };
    if let Some(policy) = key_collision {
        orchestrator.datasets.key_collision = policy;
    }
    if let Some(extension) = file_datasets.default_extension {
        orchestrator.datasets.default_extension =
            extension.trim_start_matches('.').to_string();
    }

    let database = DatabaseConfig {
        url: env
            .database_url
            .clone()
            .or(file_database.url)
            .filter(|url| !url.trim().is_empty()),
    };

    let config = TrellisConfig {
        database,
        orchestrator,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
    };
    Ok((config, warnings))
}

fn parse_duration_setting(name: &str, raw: &str) -> Result<u64, ConfigLoadError> {
    parse_duration(raw)
        .map(duration_millis)
        .map_err(|source| ConfigLoadError::InvalidDuration {
            name: name.to_string(),
            value: raw.to_string(),
            source,
        })
}

fn parse_key_collision(raw: &str) -> Result<KeyCollisionPolicy, ConfigLoadError> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "reuse_existing" | "reuse" => Ok(KeyCollisionPolicy::ReuseExisting),
        "reject" => Ok(KeyCollisionPolicy::Reject),
        "reroll" => Ok(KeyCollisionPolicy::Reroll),
        _ => Err(ConfigLoadError::InvalidValue {
            name: "TRELLIS_KEY_COLLISION".into(),
            value: raw.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration for {name}: '{value}'")]
    InvalidDuration {
        name: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit | ConfigPathProvenance::Env)
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: TrellisConfig,
    pub warnings: ConfigWarnings,
}
