use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    cancel::{CANCEL_JOBTYPE, CancelDatasetWorker},
    live::LiveJobs,
    worker::{JobHandler, WorkerLoop},
};
use crate::{
    config::OrchestratorConfig,
    dataset::DatasetContext,
    error::{OrchestrationError, Result},
    modules::{JobTypeSpec, ModuleRegistry},
    orchestration::{interrupt::InterruptLevel, queue::JobQueue},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the worker loops of this process.
///
/// `start` releases stale claims, then spawns `max_instances` loops for every
/// job type the registry knows plus the built-in `cancel-dataset` worker.
/// `shutdown` asks running jobs to hand themselves back (`Retry`) and waits
/// for the loops to exit.
pub struct WorkerManager {
    queue: JobQueue,
    datasets: DatasetContext,
    registry: Arc<ModuleRegistry>,
    config: OrchestratorConfig,
    live: LiveJobs,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerManager")
            .field("config", &self.config)
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerManager {
    pub fn new(
        queue: JobQueue,
        datasets: DatasetContext,
        registry: Arc<ModuleRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            datasets,
            registry,
            config,
            live: LiveJobs::new(),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn live(&self) -> &LiveJobs {
        &self.live
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn handler_for(&self, jobtype: &str) -> Option<JobHandler> {
        if let Some(processor) = self.registry.processor(jobtype) {
            return Some(JobHandler::Processor(processor.processor.clone()));
        }
        if let Some(worker) = self.registry.worker(jobtype) {
            return Some(JobHandler::Worker(worker.worker.clone()));
        }
        (jobtype == CANCEL_JOBTYPE).then(|| JobHandler::Worker(Arc::new(CancelDatasetWorker)))
    }

    /// A single loop for `jobtype`, sharing this manager's live-job table.
    pub fn worker_loop(&self, jobtype: &str, instance: usize) -> Result<WorkerLoop> {
        let handler = self.handler_for(jobtype).ok_or_else(|| {
            OrchestrationError::Registry(format!("no module services job type '{jobtype}'"))
        })?;
        Ok(WorkerLoop::new(
            format!("{jobtype}-{}-w{instance}", std::process::id()),
            jobtype,
            handler,
            self.queue.clone(),
            self.datasets.clone(),
            self.live.clone(),
            self.config.clone(),
        ))
    }

    fn jobtypes(&self) -> Vec<JobTypeSpec> {
        let mut jobtypes = self.registry.jobtypes();
        if !jobtypes.iter().any(|spec| spec.jobtype == CANCEL_JOBTYPE) {
            jobtypes.push(JobTypeSpec {
                jobtype: CANCEL_JOBTYPE.to_string(),
                max_instances: Some(1),
            });
        }
        jobtypes
    }

    pub async fn start(&self) -> Result<()> {
        if self.config.queue.release_on_start {
            self.queue.release_all().await?;
        }

        let mut handles = self.worker_handles.lock().await;
        for spec in self.jobtypes() {
            let instances = self
                .config
                .workers
                .instances_for(&spec.jobtype, spec.max_instances);
            for instance in 0..instances {
                let worker = self.worker_loop(&spec.jobtype, instance)?;
                let shutdown = self.shutdown_token.clone();
                handles.push(tokio::spawn(worker.run(shutdown)));
            }
            info!(jobtype = %spec.jobtype, instances, "worker pool started");
        }
        Ok(())
    }

    /// Interrupt jobs acting on `remote_id` that run in this process.
    pub async fn request_interrupt(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
        level: InterruptLevel,
    ) -> usize {
        self.live.interrupt(jobtype, remote_id, level).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown of worker manager");

        let interrupted = self.live.interrupt_all(InterruptLevel::Retry).await;
        if interrupted > 0 {
            info!(interrupted, "asked running jobs to hand back their work");
        }
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }

        info!("Worker manager shutdown complete");
        Ok(())
    }
}
