//! Row-level persistence contract.
//!
//! Every queue and dataset operation reduces to a single statement against
//! one of these traits. Implementations must make [`JobStore::claim_job`] an
//! atomic compare-and-swap on `timestamp_claimed = 0`: it is the only thing
//! standing between two workers and the same job.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;

use async_trait::async_trait;

use crate::{
    dataset::record::{DatasetPatch, DatasetRecord, OwnerRole},
    error::Result,
    orchestration::job::{EnqueueRequest, JobRecord},
    users::User,
};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Row selection for job listings. Results are ordered by `timestamp`, then
/// `id`, ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub jobtype: Option<String>,
    pub remote_id: Option<String>,
    /// When set, only rows claimable at this time are returned.
    pub claimable_at: Option<i64>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(jobtype) = &self.jobtype
            && &job.jobtype != jobtype
        {
            return false;
        }
        if let Some(remote_id) = &self.remote_id
            && &job.remote_id != remote_id
        {
            return false;
        }
        match self.claimable_at {
            Some(now) => job.is_claimable_at(now),
            None => true,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + fmt::Debug {
    /// Insert a row unless `(jobtype, remote_id)` already exists. Returns the
    /// stored row and whether it was newly inserted.
    async fn insert_job(
        &self,
        request: &EnqueueRequest,
        timestamp: i64,
    ) -> Result<(JobRecord, bool)>;

    async fn job_by_id(&self, id: i64) -> Result<Option<JobRecord>>;

    async fn job_by_remote_id(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
    ) -> Result<Option<JobRecord>>;

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    async fn count_jobs(&self, jobtype: Option<&str>) -> Result<usize>;

    /// Set `timestamp_claimed` and `timestamp_lastclaimed` to `claimed_at`
    /// where the row is unclaimed. Returns the number of rows updated.
    async fn claim_job(&self, id: i64, claimed_at: i64) -> Result<u64>;

    async fn delete_job(&self, id: i64) -> Result<u64>;

    /// Clear the claim and attempts of a recurring job.
    async fn reset_recurring_job(&self, id: i64) -> Result<u64>;

    /// Clear the claim, bump `attempts`, write `timestamp_after`.
    async fn release_job(&self, id: i64, timestamp_after: i64) -> Result<u64>;

    /// Clear every claim in the table.
    async fn release_all_jobs(&self) -> Result<u64>;

    /// Same-type rows, other than `job`, that are claimed or were enqueued
    /// before it.
    async fn count_jobs_ahead(&self, job: &JobRecord) -> Result<usize>;

    async fn delete_jobs_for_remote_id(&self, remote_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait DatasetStore: Send + Sync + fmt::Debug {
    /// Fails with `DuplicateDataset` if the key is taken.
    async fn insert_dataset(&self, record: &DatasetRecord) -> Result<()>;

    async fn dataset(&self, key: &str) -> Result<Option<DatasetRecord>>;

    async fn update_dataset(&self, key: &str, patch: &DatasetPatch) -> Result<u64>;

    async fn delete_dataset(&self, key: &str) -> Result<u64>;

    /// Direct children, oldest first.
    async fn child_datasets(&self, key: &str) -> Result<Vec<DatasetRecord>>;

    async fn dataset_owners(&self, key: &str) -> Result<Vec<(String, OwnerRole)>>;

    /// Insert the owner or change its role.
    async fn upsert_owner(&self, key: &str, name: &str, role: OwnerRole) -> Result<()>;

    async fn remove_owner(&self, key: &str, name: &str) -> Result<u64>;

    async fn remove_all_owners(&self, key: &str) -> Result<u64>;

    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn user(&self, name: &str) -> Result<Option<User>>;

    /// Users carrying at least one of `tags`.
    async fn users_with_tags(&self, tags: &[String]) -> Result<Vec<User>>;

    async fn add_favourite(&self, user: &str, key: &str) -> Result<()>;

    async fn favourites_of(&self, user: &str) -> Result<Vec<String>>;

    async fn remove_favourites(&self, key: &str) -> Result<u64>;
}

/// Everything the orchestration core persists.
pub trait Store: JobStore + DatasetStore {}

impl<T: JobStore + DatasetStore> Store for T {}
