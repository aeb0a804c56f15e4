use std::path::PathBuf;

use serde::de::DeserializeOwned;
use tokio::fs::File;

use crate::{
    config::RetryConfig,
    dataset::Dataset,
    error::{OrchestrationError, Result},
    orchestration::{
        interrupt::{InterruptLevel, InterruptToken},
        job::JobRecord,
        queue::JobQueue,
        runtime::LiveJobs,
    },
};

/// Everything a processor gets to work with: the dataset it fills, the job
/// that asked for it, and the token to poll for interrupts.
#[derive(Debug)]
pub struct ProcessorContext {
    dataset: Dataset,
    job: JobRecord,
    interrupt: InterruptToken,
    rows: i64,
}

impl ProcessorContext {
    pub fn new(dataset: Dataset, job: JobRecord, interrupt: InterruptToken) -> Self {
        Self {
            dataset,
            job,
            interrupt,
            rows: 0,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn dataset_mut(&mut self) -> &mut Dataset {
        &mut self.dataset
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    /// Decode the job's details blob.
    pub fn details<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.details.clone())?)
    }

    pub fn interrupt(&self) -> &InterruptToken {
        &self.interrupt
    }

    /// Yield point: `Err(Interrupted)` once the worker loop was asked to stop.
    pub fn checkpoint(&self) -> Result<()> {
        self.interrupt.check()
    }

    /// Rows written so far. Used as the row count when the processor is
    /// interrupted with [`InterruptLevel::Finish`].
    pub fn record_rows(&mut self, rows: i64) {
        self.rows = rows;
    }

    pub fn rows_written(&self) -> i64 {
        self.rows
    }

    pub fn result_path(&self) -> Option<PathBuf> {
        self.dataset.results_path()
    }

    pub async fn open_result(&self) -> Result<File> {
        let name = self.dataset.result_file();
        if name.is_empty() {
            return Err(OrchestrationError::InvalidState(format!(
                "dataset {} has no reserved result file",
                self.dataset.key()
            )));
        }
        self.dataset.results().open_for_write(name).await
    }

    /// The dataset this one was derived from.
    pub async fn source_dataset(&self) -> Result<Dataset> {
        self.dataset.get_parent().await?.ok_or_else(|| {
            OrchestrationError::NotFound(format!(
                "dataset {} has no parent",
                self.dataset.key()
            ))
        })
    }

    pub async fn update_status(&mut self, status: &str) -> Result<bool> {
        self.dataset.update_status(status, false).await
    }

    pub async fn update_progress(&mut self, progress: f64) -> Result<bool> {
        self.dataset.update_progress(progress).await
    }

    pub(crate) fn into_dataset(self) -> Dataset {
        self.dataset
    }
}

/// Context handed to plain [`Worker`](super::Worker)s.
#[derive(Clone, Debug)]
pub struct WorkContext {
    pub job: JobRecord,
    pub queue: JobQueue,
    pub live: LiveJobs,
    pub retry: RetryConfig,
    pub interrupt: InterruptToken,
}

impl WorkContext {
    pub fn details<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.details.clone())?)
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.interrupt.check()
    }

    pub fn interrupted(&self) -> InterruptLevel {
        self.interrupt.level()
    }
}
