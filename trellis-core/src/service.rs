use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::OrchestratorConfig,
    dataset::{Dataset, DatasetContext, NewDataset, result_file::ResultStore},
    error::{OrchestrationError, Result},
    modules::{ModuleRegistry, ProcessorDescriptor},
    orchestration::{
        interrupt::InterruptLevel,
        job::{EnqueueRequest, Job},
        queue::JobQueue,
        runtime::{CANCEL_JOBTYPE, CancelRequest, WorkerManager},
    },
    store::Store,
    users::User,
};

/// How long `delete_dataset` waits for aborted jobs to wind down.
const ABORT_GRACE: Duration = Duration::from_secs(10);
const ABORT_POLL: Duration = Duration::from_millis(25);

/// How a cancellation request was delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job runs in this process and was signalled directly.
    Interrupted,
    /// The job is claimed elsewhere; a `cancel-dataset` job carries the
    /// request to its process.
    Forwarded,
    /// The job had not started yet and was removed from the queue.
    Dequeued,
    /// No job exists for the dataset.
    NotQueued,
}

/// Entry point for front ends: dataset creation, queueing, cancellation.
pub struct Orchestrator {
    queue: JobQueue,
    datasets: DatasetContext,
    manager: Arc<WorkerManager>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("queue", &self.queue)
            .field("manager", &self.manager)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        results: Arc<dyn ResultStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<ModuleRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let queue = JobQueue::new(store.clone(), clock.clone());
        let datasets = DatasetContext {
            store,
            results,
            clock,
            registry: registry.clone(),
            config: config.datasets.clone(),
        };
        let manager = Arc::new(WorkerManager::new(
            queue.clone(),
            datasets.clone(),
            registry,
            config,
        ));
        Self {
            queue,
            datasets,
            manager,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn dataset_context(&self) -> &DatasetContext {
        &self.datasets
    }

    pub fn worker_manager(&self) -> Arc<WorkerManager> {
        self.manager.clone()
    }

    pub async fn create_dataset(&self, new: NewDataset) -> Result<Dataset> {
        Dataset::create(self.datasets.clone(), new).await
    }

    pub async fn get_dataset(&self, key: &str) -> Result<Dataset> {
        Dataset::get(self.datasets.clone(), key).await
    }

    /// Queue the dataset for its processor and link the job to it.
    pub async fn enqueue(&self, dataset: &mut Dataset) -> Result<Job> {
        let job = self
            .queue
            .add_job(EnqueueRequest::new(dataset.dataset_type(), dataset.key()))
            .await?;
        dataset.link_job(job.id()).await?;
        Ok(job)
    }

    /// Stop the processing of `dataset` at `level`.
    pub async fn cancel(&self, dataset: &mut Dataset, level: InterruptLevel) -> Result<CancelOutcome> {
        let signalled = self
            .manager
            .request_interrupt(Some(dataset.dataset_type()), dataset.key(), level)
            .await;
        if signalled > 0 {
            return Ok(CancelOutcome::Interrupted);
        }

        let Some(job) = self
            .queue
            .get_job_by_remote_id(Some(dataset.dataset_type()), dataset.key())
            .await?
        else {
            return Ok(CancelOutcome::NotQueued);
        };
        self.withdraw(job, dataset, level).await
    }

    /// Take a queued job out of the queue, or forward the cancellation when
    /// a worker holds it. The claim decides: a job this call manages to
    /// claim cannot start anywhere else.
    async fn withdraw(
        &self,
        mut job: Job,
        dataset: &mut Dataset,
        level: InterruptLevel,
    ) -> Result<CancelOutcome> {
        if !job.is_claimed() {
            match job.claim().await {
                Ok(()) => {
                    job.finish(true).await?;
                    if !dataset.is_finished() {
                        dataset
                            .finish_with_error("Cancelled before processing started")
                            .await?;
                    }
                    info!(dataset = %dataset.key(), "queued job cancelled");
                    return Ok(CancelOutcome::Dequeued);
                }
                Err(err) if err.is_already_claimed() => {
                    debug!(dataset = %dataset.key(), "job claimed while cancelling");
                }
                Err(err) => return Err(err),
            }
        }

        let request = CancelRequest {
            jobtype: dataset.dataset_type().to_string(),
            level,
        };
        self.queue
            .add_job(
                EnqueueRequest::new(CANCEL_JOBTYPE, dataset.key())
                    .details(serde_json::to_value(&request)?),
            )
            .await?;
        info!(dataset = %dataset.key(), %level, "cancellation forwarded");
        Ok(CancelOutcome::Forwarded)
    }

    /// Jobs ahead of the dataset's job; 0 once it runs.
    pub async fn get_queue_position(&self, dataset: &Dataset) -> Result<usize> {
        let job = self
            .queue
            .get_job_by_remote_id(Some(dataset.dataset_type()), dataset.key())
            .await?
            .ok_or_else(|| {
                OrchestrationError::NotFound(format!("no queued job for dataset {}", dataset.key()))
            })?;
        self.queue.get_place_in_queue(&job).await
    }

    pub async fn get_available_processors<'a>(
        &self,
        dataset: &'a Dataset,
        user: Option<&User>,
    ) -> Result<BTreeMap<String, &'a ProcessorDescriptor>> {
        dataset.get_available_processors(user, true).await
    }

    /// Abort anything running on the dataset or its descendants here, wait
    /// for those jobs to stop, then delete the whole subtree.
    pub async fn delete_dataset(&self, key: &str) -> Result<()> {
        let dataset = self.get_dataset(key).await?;
        let mut keys: Vec<String> = dataset
            .descendant_records()
            .await?
            .into_iter()
            .map(|record| record.key)
            .collect();
        keys.push(key.to_string());

        let mut signalled = 0;
        for key in &keys {
            signalled += self
                .manager
                .request_interrupt(None, key, InterruptLevel::Abort)
                .await;
        }
        if signalled > 0 {
            self.wait_until_stopped(&keys).await;
        }
        dataset.delete().await
    }

    async fn wait_until_stopped(&self, keys: &[String]) {
        let deadline = Instant::now() + ABORT_GRACE;
        loop {
            let mut running = false;
            for key in keys {
                if self.manager.live().is_running(None, key).await {
                    running = true;
                    break;
                }
            }
            if !running {
                return;
            }
            if Instant::now() >= deadline {
                warn!(?keys, "aborted jobs still running, deleting anyway");
                return;
            }
            tokio::time::sleep(ABORT_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        dataset::{record::DatasetParameters, result_file::FsResultStore},
        store::MemoryStore,
    };

    fn orchestrator(root: &std::path::Path) -> Orchestrator {
        let registry = ModuleRegistry::builder().build().unwrap();
        Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FsResultStore::new(root)),
            Arc::new(ManualClock::new(1_000)),
            Arc::new(registry),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn job_claimed_after_lookup_is_forwarded_not_dequeued() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let parameters = DatasetParameters::default().with_label("race");
        let mut dataset = orchestrator
            .create_dataset(NewDataset::new("count-posts", parameters))
            .await
            .unwrap();
        orchestrator.enqueue(&mut dataset).await.unwrap();

        let queue = orchestrator.queue();
        let seen_by_cancel = queue
            .get_job_by_remote_id(Some("count-posts"), dataset.key())
            .await
            .unwrap()
            .unwrap();
        let mut taken_by_worker = queue
            .get_job_by_remote_id(Some("count-posts"), dataset.key())
            .await
            .unwrap()
            .unwrap();
        taken_by_worker.claim().await.unwrap();

        let outcome = orchestrator
            .withdraw(seen_by_cancel, &mut dataset, InterruptLevel::Abort)
            .await
            .unwrap();

        assert_eq!(outcome, CancelOutcome::Forwarded);
        assert!(!dataset.is_finished());
        let still_queued = queue
            .get_job_by_id(taken_by_worker.id())
            .await
            .unwrap()
            .unwrap();
        assert!(still_queued.is_claimed());
        assert_eq!(
            queue.get_job_count(Some(CANCEL_JOBTYPE)).await.unwrap(),
            1
        );
    }
}
