use async_trait::async_trait;
use tracing::info;
use trellis_core::{
    Result,
    modules::{WorkContext, WorkOutcome, Worker},
};

pub const QUEUE_STATS_JOBTYPE: &str = "queue-stats";
pub const QUEUE_STATS_INTERVAL_SECS: i64 = 300;

/// Recurring job that logs queue occupancy per job type.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStatsWorker;

#[async_trait]
impl Worker for QueueStatsWorker {
    async fn work(&self, ctx: WorkContext) -> Result<WorkOutcome> {
        let snapshot = ctx.queue.snapshot().await?;
        for (jobtype, entry) in &snapshot.queues {
            info!(
                target: "trellis::queue",
                jobtype = %jobtype,
                queued = entry.queued,
                claimed = entry.claimed,
                "queue occupancy"
            );
        }
        Ok(WorkOutcome::Done)
    }
}
