use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::job::{EnqueueRequest, Job};
use crate::{
    clock::Clock,
    error::Result,
    store::{JobFilter, Store},
};

/// Wildcard accepted wherever a job type filter is taken.
pub const ANY_JOBTYPE: &str = "*";

fn jobtype_filter(jobtype: Option<&str>) -> Option<String> {
    jobtype.filter(|t| *t != ANY_JOBTYPE).map(str::to_owned)
}

/// The shared job table, seen as a queue.
///
/// Workers coordinate only through [`Job::claim`]; nothing here holds a lock
/// across calls.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue").field("store", &self.store).finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn wrap(&self, record: crate::orchestration::job::JobRecord) -> Job {
        Job::from_record(record, self.store.clone(), self.clock.clone())
    }

    /// Enqueue a job. If `(jobtype, remote_id)` is already queued the existing
    /// row is returned untouched, details included.
    pub async fn add_job(&self, request: EnqueueRequest) -> Result<Job> {
        let (record, inserted) = self.store.insert_job(&request, self.clock.now()).await?;
        if inserted {
            debug!(job.id = record.id, jobtype = %record.jobtype, remote_id = %record.remote_id, "job enqueued");
        } else {
            debug!(job.id = record.id, jobtype = %record.jobtype, remote_id = %record.remote_id, "job already queued");
        }
        Ok(self.wrap(record))
    }

    /// Oldest job of `jobtype` (ties broken by id). With `restrict_claimable`
    /// only jobs claimable at `timestamp` (default now) qualify.
    pub async fn get_job(
        &self,
        jobtype: &str,
        timestamp: Option<i64>,
        restrict_claimable: bool,
    ) -> Result<Option<Job>> {
        let filter = JobFilter {
            jobtype: jobtype_filter(Some(jobtype)),
            claimable_at: restrict_claimable
                .then(|| timestamp.unwrap_or_else(|| self.clock.now())),
            limit: Some(1),
            ..JobFilter::default()
        };
        let mut records = self.store.find_jobs(&filter).await?;
        Ok(records.pop().map(|record| self.wrap(record)))
    }

    pub async fn get_all_jobs(
        &self,
        jobtype: Option<&str>,
        remote_id: Option<&str>,
        restrict_claimable: bool,
    ) -> Result<Vec<Job>> {
        let filter = JobFilter {
            jobtype: jobtype_filter(jobtype),
            remote_id: remote_id.map(str::to_owned),
            claimable_at: restrict_claimable.then(|| self.clock.now()),
            limit: None,
        };
        let records = self.store.find_jobs(&filter).await?;
        Ok(records.into_iter().map(|record| self.wrap(record)).collect())
    }

    pub async fn get_job_count(&self, jobtype: Option<&str>) -> Result<usize> {
        self.store
            .count_jobs(jobtype_filter(jobtype).as_deref())
            .await
    }

    /// Clear every claim. Must run before any worker polls after a restart,
    /// since claims held by a dead process are otherwise never released.
    pub async fn release_all(&self) -> Result<u64> {
        let released = self.store.release_all_jobs().await?;
        info!(released, "released all claimed jobs");
        Ok(released)
    }

    pub async fn get_place_in_queue(&self, job: &Job) -> Result<usize> {
        job.get_place_in_queue().await
    }

    pub async fn get_job_by_id(&self, id: i64) -> Result<Option<Job>> {
        let record = self.store.job_by_id(id).await?;
        Ok(record.map(|record| self.wrap(record)))
    }

    pub async fn get_job_by_remote_id(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
    ) -> Result<Option<Job>> {
        let record = self
            .store
            .job_by_remote_id(jobtype_filter(jobtype).as_deref(), remote_id)
            .await?;
        Ok(record.map(|record| self.wrap(record)))
    }

    /// Drop every job acting on `remote_id`, claimed or not.
    pub async fn delete_jobs_for(&self, remote_id: &str) -> Result<u64> {
        let deleted = self.store.delete_jobs_for_remote_id(remote_id).await?;
        if deleted > 0 {
            debug!(remote_id, deleted, "deleted jobs");
        }
        Ok(deleted)
    }

    /// Per-jobtype counts of queued and claimed rows.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let records = self.store.find_jobs(&JobFilter::default()).await?;
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for record in records {
            let entry = snapshot.entry_mut(&record.jobtype);
            if record.is_claimed() {
                entry.claimed += 1;
            } else {
                entry.queued += 1;
            }
        }
        Ok(snapshot)
    }
}

/// Queue occupancy at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: BTreeMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: BTreeMap::new(),
        }
    }

    pub fn entry_mut(&mut self, jobtype: &str) -> &mut QueueSnapshotEntry {
        self.queues.entry(jobtype.to_owned()).or_default()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub queued: usize,
    pub claimed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    fn queue_at(now: i64) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let queue = JobQueue::new(Arc::new(MemoryStore::new()), clock.clone());
        (queue, clock)
    }

    #[tokio::test]
    async fn get_job_returns_oldest_claimable() {
        let (queue, clock) = queue_at(100);
        queue.add_job(EnqueueRequest::new("scrape", "a")).await.unwrap();
        clock.advance(1);
        queue.add_job(EnqueueRequest::new("scrape", "b")).await.unwrap();
        clock.advance(1);

        let first = queue.get_job("scrape", None, true).await.unwrap().unwrap();
        assert_eq!(first.remote_id(), "a");
        assert!(queue.get_job("other", None, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_after_defers_the_job() {
        let (queue, clock) = queue_at(100);
        queue
            .add_job(EnqueueRequest::new("scrape", "a").claim_after(150))
            .await
            .unwrap();

        clock.set(150);
        assert!(queue.get_job("scrape", None, true).await.unwrap().is_none());
        assert!(queue.get_job("scrape", None, false).await.unwrap().is_some());

        clock.set(151);
        assert!(queue.get_job("scrape", None, true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wildcard_counts_every_jobtype() {
        let (queue, _) = queue_at(100);
        queue.add_job(EnqueueRequest::new("a", "1")).await.unwrap();
        queue.add_job(EnqueueRequest::new("b", "1")).await.unwrap();

        assert_eq!(queue.get_job_count(Some(ANY_JOBTYPE)).await.unwrap(), 2);
        assert_eq!(queue.get_job_count(Some("a")).await.unwrap(), 1);
        assert_eq!(queue.get_job_count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_splits_queued_and_claimed() {
        let (queue, clock) = queue_at(100);
        let mut job = queue.add_job(EnqueueRequest::new("a", "1")).await.unwrap();
        queue.add_job(EnqueueRequest::new("a", "2")).await.unwrap();
        clock.advance(1);
        job.claim().await.unwrap();

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(
            snapshot.queues["a"],
            QueueSnapshotEntry {
                queued: 1,
                claimed: 1
            }
        );
    }
}
