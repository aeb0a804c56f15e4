use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    clock::Clock,
    error::{OrchestrationError, Result},
    store::Store,
};

/// Persisted queue row. `(jobtype, remote_id)` is unique.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// Selects the worker type that services the row.
    pub jobtype: String,
    /// Domain object the job acts on, usually a dataset key.
    pub remote_id: String,
    /// Worker-specific parameters.
    pub details: Value,
    /// Enqueue time.
    pub timestamp: i64,
    /// Earliest claim time; 0 means immediately.
    pub timestamp_after: i64,
    /// 0 while unclaimed.
    pub timestamp_claimed: i64,
    pub timestamp_lastclaimed: i64,
    /// 0 for one-shot jobs, otherwise the recurrence in seconds.
    pub interval: i64,
    /// Number of times the job was released without finishing.
    pub attempts: i32,
}

impl JobRecord {
    pub fn is_claimed(&self) -> bool {
        self.timestamp_claimed > 0
    }

    pub fn is_recurring(&self) -> bool {
        self.interval > 0
    }

    /// Claimability predicate shared by every store implementation.
    pub fn is_claimable_at(&self, now: i64) -> bool {
        self.timestamp_claimed == 0
            && self.timestamp_after < now
            && (self.interval == 0
                || self.timestamp_lastclaimed + self.interval <= now)
    }
}

/// Parameters for [`JobQueue::add_job`](super::queue::JobQueue::add_job).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub claim_after: i64,
    pub interval: i64,
}

impl EnqueueRequest {
    pub fn new(jobtype: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            jobtype: jobtype.into(),
            remote_id: remote_id.into(),
            details: Value::Null,
            claim_after: 0,
            interval: 0,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn claim_after(mut self, timestamp: i64) -> Self {
        self.claim_after = timestamp;
        self
    }

    pub fn interval(mut self, seconds: i64) -> Self {
        self.interval = seconds;
        self
    }
}

/// In-process view of a job's lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Claimed,
    Finished,
}

/// Claim time for a job. Recurring jobs snap to a multiple of their interval
/// so repeated claims do not drift.
pub fn claim_timestamp(now: i64, interval: i64) -> i64 {
    let claimed = if interval > 0 {
        now.div_euclid(interval) * interval
    } else {
        now
    };
    // 0 is the "unclaimed" sentinel and must never be written as a claim.
    claimed.max(1)
}

/// One queue row plus the transitions that act on it.
#[derive(Clone)]
pub struct Job {
    record: JobRecord,
    state: JobState,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("record", &self.record)
            .field("state", &self.state)
            .finish()
    }
}

impl Job {
    pub(crate) fn from_record(
        record: JobRecord,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = if record.is_claimed() {
            JobState::Claimed
        } else {
            JobState::Queued
        };
        Self {
            record,
            state,
            store,
            clock,
        }
    }

    pub async fn get_by_id(
        id: i64,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Job> {
        let record = store
            .job_by_id(id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("job {id}")))?;
        Ok(Self::from_record(record, store, clock))
    }

    /// Oldest job acting on `remote_id`, optionally of one job type.
    pub async fn get_by_remote_id(
        remote_id: &str,
        jobtype: Option<&str>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Job> {
        let record = store
            .job_by_remote_id(jobtype, remote_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("job for {remote_id}")))?;
        Ok(Self::from_record(record, store, clock))
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn jobtype(&self) -> &str {
        &self.record.jobtype
    }

    pub fn remote_id(&self) -> &str {
        &self.record.remote_id
    }

    pub fn details(&self) -> &Value {
        &self.record.details
    }

    /// Decode the details blob into a worker-specific type.
    pub fn details_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.record.details.clone())?)
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_claimed(&self) -> bool {
        self.state == JobState::Claimed
    }

    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }

    pub fn is_recurring(&self) -> bool {
        self.record.is_recurring()
    }

    /// Atomically mark the row as claimed.
    ///
    /// Fails with [`OrchestrationError::AlreadyClaimed`] when a concurrent
    /// worker claimed the row between our read and this write.
    pub async fn claim(&mut self) -> Result<()> {
        if self.state == JobState::Finished {
            return Err(OrchestrationError::InvalidState(format!(
                "job {} is finished and cannot be claimed",
                self.record.id
            )));
        }

        let claimed_at =
            claim_timestamp(self.clock.now(), self.record.interval);
        let updated = self.store.claim_job(self.record.id, claimed_at).await?;
        if updated == 0 {
            return Err(OrchestrationError::AlreadyClaimed(self.record.id));
        }

        self.record.timestamp_claimed = claimed_at;
        self.record.timestamp_lastclaimed = claimed_at;
        self.state = JobState::Claimed;
        debug!(job.id = self.record.id, jobtype = %self.record.jobtype, "job claimed");
        Ok(())
    }

    /// Complete the job. One-shot jobs (or `delete = true`) leave the queue;
    /// recurring jobs become claimable again once their interval elapses.
    pub async fn finish(&mut self, delete: bool) -> Result<()> {
        if self.record.interval == 0 || delete {
            self.store.delete_job(self.record.id).await?;
            self.state = JobState::Finished;
        } else {
            self.store.reset_recurring_job(self.record.id).await?;
            self.record.timestamp_claimed = 0;
            self.record.attempts = 0;
            self.state = JobState::Queued;
        }
        debug!(job.id = self.record.id, jobtype = %self.record.jobtype, deleted = self.state == JobState::Finished, "job finished");
        Ok(())
    }

    /// Give the job back to the queue without finishing it.
    ///
    /// `delay > 0` makes it claimable `delay` seconds from now; otherwise
    /// `claim_after` is written as the earliest claim time.
    pub async fn release(&mut self, delay: i64, claim_after: i64) -> Result<()> {
        let timestamp_after = if delay > 0 {
            self.clock.now() + delay
        } else {
            claim_after
        };
        self.store
            .release_job(self.record.id, timestamp_after)
            .await?;

        self.record.timestamp_claimed = 0;
        self.record.timestamp_after = timestamp_after;
        self.record.attempts += 1;
        self.state = JobState::Queued;
        debug!(job.id = self.record.id, jobtype = %self.record.jobtype, timestamp_after, "job released");
        Ok(())
    }

    /// Number of same-type jobs ahead of this one; 0 once claimed.
    pub async fn get_place_in_queue(&self) -> Result<usize> {
        if self.record.is_claimed() {
            return Ok(0);
        }
        self.store.count_jobs_ahead(&self.record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(interval: i64) -> JobRecord {
        JobRecord {
            id: 1,
            jobtype: "count-words".into(),
            remote_id: "abc".into(),
            details: Value::Null,
            timestamp: 100,
            timestamp_after: 0,
            timestamp_claimed: 0,
            timestamp_lastclaimed: 0,
            interval,
            attempts: 0,
        }
    }

    #[test]
    fn recurring_claims_snap_to_interval() {
        assert_eq!(claim_timestamp(1_005, 60), 960);
        assert_eq!(claim_timestamp(1_020, 60), 1_020);
        assert_eq!(claim_timestamp(1_005, 0), 1_005);
    }

    #[test]
    fn claim_timestamp_never_writes_the_unclaimed_sentinel() {
        assert_eq!(claim_timestamp(30, 60), 1);
    }

    #[test]
    fn claimability_respects_after_and_interval() {
        let mut job = record(0);
        assert!(job.is_claimable_at(1));

        job.timestamp_after = 500;
        assert!(!job.is_claimable_at(500));
        assert!(job.is_claimable_at(501));

        let mut recurring = record(60);
        recurring.timestamp_lastclaimed = 960;
        assert!(!recurring.is_claimable_at(1_019));
        assert!(recurring.is_claimable_at(1_020));

        recurring.timestamp_claimed = 960;
        assert!(!recurring.is_claimable_at(5_000));
    }
}
