use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::live::LiveJobs;
use crate::{
    config::{OrchestratorConfig, QueueConfig},
    dataset::{Dataset, DatasetContext, NewDataset, result_file::log_name},
    error::{OrchestrationError, Result},
    modules::{ProcessOutcome, Processor, ProcessorContext, WorkContext, WorkOutcome, Worker},
    orchestration::{
        interrupt::InterruptLevel,
        job::{EnqueueRequest, Job},
        queue::JobQueue,
    },
};

/// What a loop runs for the jobs it claims.
#[derive(Clone)]
pub enum JobHandler {
    Processor(Arc<dyn Processor>),
    Worker(Arc<dyn Worker>),
}

impl fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandler::Processor(_) => f.write_str("Processor"),
            JobHandler::Worker(_) => f.write_str("Worker"),
        }
    }
}

fn poll_delay(config: &QueueConfig) -> Duration {
    let jitter = if config.jitter_ms > 0 {
        rand::rng().random_range(0..=config.jitter_ms)
    } else {
        0
    };
    config.poll_interval() + Duration::from_millis(jitter)
}

/// What happens to a processor's job once its outcome is recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Disposition {
    Finish { delete: bool },
    Release { delay: i64 },
}

fn failure_status(err: &OrchestrationError) -> String {
    match err {
        OrchestrationError::ExternalFailure(message) => format!("Processor failed: {message}"),
        other => format!("Processor failed: {other}"),
    }
}

/// One polling worker for one job type.
///
/// Each cycle fetches the oldest claimable job, claims it, runs it to
/// completion and translates the outcome into dataset and job transitions.
/// Job errors are logged and never end the loop.
#[derive(Clone, Debug)]
pub struct WorkerLoop {
    worker_id: String,
    jobtype: String,
    handler: JobHandler,
    queue: JobQueue,
    datasets: DatasetContext,
    live: LiveJobs,
    config: OrchestratorConfig,
}

impl WorkerLoop {
    pub fn new(
        worker_id: impl Into<String>,
        jobtype: impl Into<String>,
        handler: JobHandler,
        queue: JobQueue,
        datasets: DatasetContext,
        live: LiveJobs,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobtype: jobtype.into(),
            handler,
            queue,
            datasets,
            live,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn jobtype(&self) -> &str {
        &self.jobtype
    }

    /// Poll until `shutdown` fires: look for a job, run it if there is one,
    /// sleep for the poll interval, repeat.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.worker_id, jobtype = %self.jobtype, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(err) = self.poll_once().await {
                error!(worker = %self.worker_id, jobtype = %self.jobtype, error = %err, "worker cycle failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_delay(&self.config.queue)) => {}
            }
        }
        info!(worker = %self.worker_id, jobtype = %self.jobtype, "worker stopped");
    }

    /// Claim and run the oldest claimable job, if any. Returns whether a job
    /// was run. Losing the claim to another worker counts as no work.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(mut job) = self.queue.get_job(&self.jobtype, None, true).await? else {
            return Ok(false);
        };

        match job.claim().await {
            Ok(()) => {
                let span = info_span!("job", worker = %self.worker_id, job.id = job.id(), jobtype = %self.jobtype, remote_id = %job.remote_id());
                self.execute(job).instrument(span).await?;
                Ok(true)
            }
            Err(err) if err.is_already_claimed() => {
                debug!(worker = %self.worker_id, job.id = job.id(), "lost claim race");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(&self, job: Job) -> Result<()> {
        match &self.handler {
            JobHandler::Processor(processor) => self.run_processor(job, processor.clone()).await,
            JobHandler::Worker(worker) => self.run_worker(job, worker.clone()).await,
        }
    }

    async fn run_worker(&self, mut job: Job, worker: Arc<dyn Worker>) -> Result<()> {
        let interrupt = self.live.register(job.record()).await;
        let ctx = WorkContext {
            job: job.record().clone(),
            queue: self.queue.clone(),
            live: self.live.clone(),
            retry: self.config.retry,
            interrupt,
        };
        let outcome = AssertUnwindSafe(worker.work(ctx)).catch_unwind().await;
        self.live.unregister(job.id()).await;

        let retry = self.config.retry;
        match outcome {
            Ok(Ok(WorkOutcome::Done)) => job.finish(false).await,
            Ok(Ok(WorkOutcome::Release { delay })) => job.release(delay, 0).await,
            Ok(Err(err)) if err.interrupt_level().is_some() => {
                info!(level = ?err.interrupt_level(), "worker interrupted, releasing job");
                job.release(retry.retry_delay_secs, 0).await
            }
            Ok(Err(err)) => {
                error!(error = %err, "worker failed, releasing job");
                job.release(retry.failure_backoff_secs, 0).await
            }
            Err(_) => {
                error!("worker panicked, releasing job");
                job.release(retry.failure_backoff_secs, 0).await
            }
        }
    }

    async fn run_processor(&self, mut job: Job, processor: Arc<dyn Processor>) -> Result<()> {
        let mut dataset = match Dataset::get(self.datasets.clone(), job.remote_id()).await {
            Ok(dataset) => dataset,
            Err(err) if err.is_not_found() => {
                warn!("dataset for job no longer exists, dropping job");
                return job.finish(true).await;
            }
            Err(err) => {
                job.release(self.config.retry.failure_backoff_secs, 0).await?;
                return Err(err);
            }
        };

        if dataset.is_finished() {
            warn!("dataset already finished, dropping job");
            return job.finish(true).await;
        }
        if let Err(err) = self.prepare(&mut dataset, &job).await {
            error!(dataset = %dataset.key(), error = %err, "could not prepare dataset, releasing job");
            return job.release(self.config.retry.failure_backoff_secs, 0).await;
        }

        let interrupt = self.live.register(job.record()).await;
        let mut ctx = ProcessorContext::new(dataset, job.record().clone(), interrupt);
        let outcome = AssertUnwindSafe(processor.process(&mut ctx))
            .catch_unwind()
            .await;
        let rows_written = ctx.rows_written();
        let mut dataset = ctx.into_dataset();

        // Live until the outcome is written; deletions wait on this.
        let settled = self.settle(&mut dataset, outcome, rows_written).await;
        self.live.unregister(job.id()).await;
        let disposition = match settled {
            Ok(disposition) => disposition,
            Err(err) => {
                error!(dataset = %dataset.key(), error = %err, "could not record processor outcome, releasing job");
                Disposition::Release {
                    delay: self.config.retry.failure_backoff_secs,
                }
            }
        };
        match disposition {
            Disposition::Finish { delete } => job.finish(delete).await,
            Disposition::Release { delay } => job.release(delay, 0).await,
        }
    }

    /// Link the job and stamp the producing software before the processor
    /// runs.
    async fn prepare(&self, dataset: &mut Dataset, job: &Job) -> Result<()> {
        if dataset.job_id() != Some(job.id()) {
            dataset.link_job(job.id()).await?;
        }
        let version = self
            .datasets
            .registry
            .processor(&self.jobtype)
            .map(|descriptor| descriptor.version.as_str())
            .filter(|version| !version.is_empty())
            .unwrap_or(self.datasets.config.software_version.as_str())
            .to_string();
        dataset.update_version(&version, &self.jobtype).await
    }

    /// Turn what the processor returned into dataset transitions, and decide
    /// what happens to the job.
    async fn settle(
        &self,
        dataset: &mut Dataset,
        outcome: std::thread::Result<Result<ProcessOutcome>>,
        rows_written: i64,
    ) -> Result<Disposition> {
        match outcome {
            Ok(Ok(ProcessOutcome::Finished { rows })) => {
                dataset.finish(rows).await?;
                info!(dataset = %dataset.key(), rows, "processor finished");
                if let Err(err) = self.after_process(dataset).await {
                    error!(dataset = %dataset.key(), error = %err, "follow-up handling failed");
                }
                Ok(Disposition::Finish { delete: false })
            }
            Ok(Ok(ProcessOutcome::Deferred)) => {
                debug!(dataset = %dataset.key(), "dataset completion deferred");
                Ok(Disposition::Finish { delete: false })
            }
            Ok(Err(err)) => match err.interrupt_level() {
                Some(InterruptLevel::Finish) => {
                    dataset
                        .update_status("Processing was stopped; partial results were kept", true)
                        .await?;
                    dataset.finish(rows_written).await?;
                    info!(dataset = %dataset.key(), rows = rows_written, "processor stopped early");
                    Ok(Disposition::Finish { delete: false })
                }
                Some(InterruptLevel::Abort) => {
                    self.abort(dataset).await?;
                    Ok(Disposition::Finish { delete: true })
                }
                Some(_) => {
                    dataset
                        .update_status("Interrupted; processing will resume later", false)
                        .await?;
                    info!(dataset = %dataset.key(), "processor interrupted, releasing job");
                    Ok(Disposition::Release {
                        delay: self.config.retry.retry_delay_secs,
                    })
                }
                None => {
                    error!(dataset = %dataset.key(), error = %err, "processor failed");
                    dataset.finish_with_error(&failure_status(&err)).await?;
                    Ok(Disposition::Finish { delete: false })
                }
            },
            Err(_) => {
                error!(dataset = %dataset.key(), "processor panicked");
                dataset
                    .finish_with_error("Processor crashed unexpectedly")
                    .await?;
                Ok(Disposition::Finish { delete: false })
            }
        }
    }

    /// Discard everything an aborted processor produced. When the dataset
    /// was deleted meanwhile, its log goes too.
    async fn abort(&self, dataset: &mut Dataset) -> Result<()> {
        let still_exists = self.datasets.store.dataset(dataset.key()).await?.is_some();
        if !dataset.result_file().is_empty() {
            self.datasets.results.delete(dataset.result_file()).await?;
            if !still_exists {
                self.datasets
                    .results
                    .delete(&log_name(dataset.result_file()))
                    .await?;
            }
        }
        if still_exists && !dataset.is_finished() {
            dataset.finish_with_error("Processing was aborted").await?;
        }
        info!(dataset = %dataset.key(), still_exists, "processor aborted");
        Ok(())
    }

    /// Queue `next` steps on a dataset with rows, and hand the result to the
    /// preset named in `attach_to`.
    async fn after_process(&self, dataset: &Dataset) -> Result<()> {
        let parameters = dataset.parameters();

        if dataset.num_rows() > 0 && !parameters.next.is_empty() {
            let creator = match dataset.creator() {
                "" => None,
                name => self.datasets.store.user(name).await?,
            };
            let available = dataset
                .get_available_processors(creator.as_ref(), false)
                .await?;

            for step in &parameters.next {
                let Some(descriptor) = available.get(&step.processor_type) else {
                    warn!(dataset = %dataset.key(), processor = %step.processor_type, "follow-up processor unavailable, skipping");
                    continue;
                };
                let mut new = NewDataset::new(step.processor_type.clone(), step.parameters.clone())
                    .parent(dataset.key())
                    .extension(descriptor.extension.clone())
                    .private(dataset.record().is_private);
                if !dataset.creator().is_empty() {
                    new = new.creator(dataset.creator());
                }
                let mut next = Dataset::create(self.datasets.clone(), new).await?;
                let job = self
                    .queue
                    .add_job(EnqueueRequest::new(step.processor_type.clone(), next.key()))
                    .await?;
                next.link_job(job.id()).await?;
                info!(dataset = %dataset.key(), next = %next.key(), processor = %step.processor_type, "follow-up queued");
            }
        }

        if let Some(target) = parameters.attach_to.as_deref() {
            match Dataset::get(self.datasets.clone(), target).await {
                Ok(mut surrogate) => {
                    surrogate.attach_result_from(dataset).await?;
                    info!(dataset = %dataset.key(), preset = %target, "result attached");
                }
                Err(err) if err.is_not_found() => {
                    warn!(dataset = %dataset.key(), preset = %target, "attach target no longer exists");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
