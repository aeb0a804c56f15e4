//! # Trellis Core
//!
//! Dataset and job orchestration: datasets produced by processors are queued,
//! claimed by workers, executed at most once concurrently, linked into a
//! parent → derived genealogy, and cancelled or retried cooperatively.
//!
//! ## Overview
//!
//! - **Job queue**: one table for one-shot and recurring jobs, deduplicated on
//!   `(jobtype, remote_id)`, with an atomic conditional claim as the only
//!   coordination between workers
//! - **Datasets**: derived keys, reserved result files, status and progress
//!   mirrored to presets, ownership propagated through the dataset tree
//! - **Worker runtime**: polling loops per job type, interrupt tokens handed
//!   to processors, start-up recovery of stale claims
//! - **Module registry**: processors, datasources and workers, built once and
//!   passed explicitly
//!
//! ## Feature Flags
//!
//! - `postgres` (default): Postgres store via SQLx. The in-memory store is
//!   always available.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trellis_core::{
//!     clock::SystemClock,
//!     config::OrchestratorConfig,
//!     dataset::{NewDataset, record::DatasetParameters, result_file::FsResultStore},
//!     modules::ModuleRegistry,
//!     service::Orchestrator,
//!     store::MemoryStore,
//! };
//!
//! async fn submit() -> trellis_core::error::Result<()> {
//!     let registry = Arc::new(ModuleRegistry::builder().build()?);
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(FsResultStore::new("data")),
//!         Arc::new(SystemClock),
//!         registry,
//!         OrchestratorConfig::default(),
//!     );
//!
//!     let parameters = DatasetParameters::default().with_label("cats");
//!     let mut dataset = orchestrator
//!         .create_dataset(NewDataset::new("forum-search", parameters).creator("alice"))
//!         .await?;
//!     orchestrator.enqueue(&mut dataset).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod dataset;
pub mod error;
pub mod modules;
pub mod orchestration;
pub mod service;
pub mod store;
pub mod users;

pub use error::{OrchestrationError, Result};
pub use service::{CancelOutcome, Orchestrator};

#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
