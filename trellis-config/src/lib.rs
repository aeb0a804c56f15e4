//! Configuration loading for Trellis.
//!
//! A deployment is described by an optional `trellis.toml`, an optional
//! `.env` file and the process environment, in increasing order of
//! precedence. [`ConfigLoader`] composes them into a [`TrellisConfig`] whose
//! `orchestrator` section is handed to `trellis_core` unchanged.

pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{ConfigMetadata, DatabaseConfig, TrellisConfig};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
