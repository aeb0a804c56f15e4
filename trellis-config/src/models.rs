use std::path::PathBuf;

use trellis_core::config::OrchestratorConfig;

/// Effective configuration after file, `.env` and environment were merged.
#[derive(Debug, Clone, Default)]
pub struct TrellisConfig {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

impl TrellisConfig {
    pub fn result_dir(&self) -> &PathBuf {
        &self.orchestrator.datasets.result_dir
    }

    /// Create the result directory if it does not exist yet.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.result_dir())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Postgres connection URL. Without one the in-memory store is used.
    pub url: Option<String>,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
