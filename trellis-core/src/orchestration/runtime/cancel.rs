use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::Result,
    modules::{WorkContext, WorkOutcome, Worker},
    orchestration::interrupt::InterruptLevel,
};

/// Job type of the control job that carries a cancellation to whichever
/// process runs the target.
pub const CANCEL_JOBTYPE: &str = "cancel-dataset";

/// Details of a `cancel-dataset` job. Its `remote_id` is the dataset key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Job type of the job to interrupt.
    pub jobtype: String,
    pub level: InterruptLevel,
}

/// Interrupts the target if it runs in this process. Otherwise the control
/// job goes back to the queue so another process gets a chance, up to
/// `cancel_max_attempts` times while the target is still claimed.
#[derive(Clone, Copy, Debug, Default)]
pub struct CancelDatasetWorker;

#[async_trait]
impl Worker for CancelDatasetWorker {
    async fn work(&self, ctx: WorkContext) -> Result<WorkOutcome> {
        let request: CancelRequest = ctx.details()?;
        let remote_id = ctx.job.remote_id.as_str();

        let signalled = ctx
            .live
            .interrupt(Some(&request.jobtype), remote_id, request.level)
            .await;
        if signalled > 0 {
            info!(remote_id, jobtype = %request.jobtype, level = %request.level, "cancellation delivered");
            return Ok(WorkOutcome::Done);
        }

        let target = ctx
            .queue
            .get_job_by_remote_id(Some(&request.jobtype), remote_id)
            .await?;
        match target {
            Some(target)
                if target.is_claimed() && ctx.job.attempts < ctx.retry.cancel_max_attempts =>
            {
                debug!(remote_id, attempts = ctx.job.attempts, "target runs elsewhere, releasing cancellation");
                Ok(WorkOutcome::Release {
                    delay: ctx.retry.retry_delay_secs,
                })
            }
            _ => {
                debug!(remote_id, "nothing to cancel");
                Ok(WorkOutcome::Done)
            }
        }
    }
}
