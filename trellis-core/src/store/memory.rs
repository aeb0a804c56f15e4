use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DatasetStore, JobFilter, JobStore};
use crate::{
    dataset::record::{DatasetPatch, DatasetRecord, OwnerRole},
    error::{OrchestrationError, Result},
    orchestration::job::{EnqueueRequest, JobRecord},
    users::User,
};

#[derive(Default)]
struct MemoryState {
    next_job_id: i64,
    jobs: BTreeMap<i64, JobRecord>,
    datasets: HashMap<String, DatasetRecord>,
    owners: HashMap<String, BTreeMap<String, OwnerRole>>,
    users: BTreeMap<String, User>,
    favourites: BTreeSet<(String, String)>,
}

impl MemoryState {
    fn sorted_jobs<'a>(
        &'a self,
        filter: &'a JobFilter,
    ) -> impl Iterator<Item = &'a JobRecord> + 'a {
        let mut jobs: Vec<&JobRecord> =
            self.jobs.values().filter(|job| filter.matches(job)).collect();
        jobs.sort_by_key(|job| (job.timestamp, job.id));
        jobs.into_iter()
    }
}

/// Process-local store. Every write happens under one lock, which gives
/// `claim_job` the same compare-and-swap guarantee a row lock gives Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_read() {
            Ok(guard) => f
                .debug_struct("MemoryStore")
                .field("jobs", &guard.jobs.len())
                .field("datasets", &guard.datasets.len())
                .finish(),
            Err(_) => f
                .debug_struct("MemoryStore")
                .field("jobs", &"<locked>")
                .finish(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(
        &self,
        request: &EnqueueRequest,
        timestamp: i64,
    ) -> Result<(JobRecord, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.jobs.values().find(|job| {
            job.jobtype == request.jobtype && job.remote_id == request.remote_id
        }) {
            return Ok((existing.clone(), false));
        }

        state.next_job_id += 1;
        let record = JobRecord {
            id: state.next_job_id,
            jobtype: request.jobtype.clone(),
            remote_id: request.remote_id.clone(),
            details: request.details.clone(),
            timestamp,
            timestamp_after: request.claim_after,
            timestamp_claimed: 0,
            timestamp_lastclaimed: 0,
            interval: request.interval,
            attempts: 0,
        };
        state.jobs.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn job_by_id(&self, id: i64) -> Result<Option<JobRecord>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn job_by_remote_id(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
    ) -> Result<Option<JobRecord>> {
        let filter = JobFilter {
            jobtype: jobtype.map(str::to_owned),
            remote_id: Some(remote_id.to_owned()),
            ..JobFilter::default()
        };
        let state = self.state.read().await;
        Ok(state.sorted_jobs(&filter).next().cloned())
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let jobs = state.sorted_jobs(filter).cloned();
        Ok(match filter.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    async fn count_jobs(&self, jobtype: Option<&str>) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| jobtype.is_none_or(|t| job.jobtype == t))
            .count())
    }

    async fn claim_job(&self, id: i64, claimed_at: i64) -> Result<u64> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.timestamp_claimed == 0 => {
                job.timestamp_claimed = claimed_at;
                job.timestamp_lastclaimed = claimed_at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_job(&self, id: i64) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(u64::from(state.jobs.remove(&id).is_some()))
    }

    async fn reset_recurring_job(&self, id: i64) -> Result<u64> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.timestamp_claimed = 0;
                job.attempts = 0;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn release_job(&self, id: i64, timestamp_after: i64) -> Result<u64> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.timestamp_claimed = 0;
                job.attempts += 1;
                job.timestamp_after = timestamp_after;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn release_all_jobs(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.timestamp_claimed != 0 {
                job.timestamp_claimed = 0;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn count_jobs_ahead(&self, job: &JobRecord) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|other| other.jobtype == job.jobtype && other.id != job.id)
            .filter(|other| {
                other.timestamp_claimed > 0
                    || (other.timestamp, other.id) < (job.timestamp, job.id)
            })
            .count())
    }

    async fn delete_jobs_for_remote_id(&self, remote_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.remote_id != remote_id);
        Ok((before - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn insert_dataset(&self, record: &DatasetRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.datasets.contains_key(&record.key) {
            return Err(OrchestrationError::DuplicateDataset(record.key.clone()));
        }
        state.datasets.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn dataset(&self, key: &str) -> Result<Option<DatasetRecord>> {
        Ok(self.state.read().await.datasets.get(key).cloned())
    }

    async fn update_dataset(&self, key: &str, patch: &DatasetPatch) -> Result<u64> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.write().await;
        match state.datasets.get_mut(key) {
            Some(record) => {
                patch.apply_to(record);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_dataset(&self, key: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(u64::from(state.datasets.remove(key).is_some()))
    }

    async fn child_datasets(&self, key: &str) -> Result<Vec<DatasetRecord>> {
        let state = self.state.read().await;
        let mut children: Vec<DatasetRecord> = state
            .datasets
            .values()
            .filter(|record| record.key_parent == key)
            .cloned()
            .collect();
        children.sort_by(|a, b| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key))
        });
        Ok(children)
    }

    async fn dataset_owners(&self, key: &str) -> Result<Vec<(String, OwnerRole)>> {
        let state = self.state.read().await;
        Ok(state
            .owners
            .get(key)
            .map(|owners| {
                owners
                    .iter()
                    .map(|(name, role)| (name.clone(), *role))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_owner(&self, key: &str, name: &str, role: OwnerRole) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .owners
            .entry(key.to_owned())
            .or_default()
            .insert(name.to_owned(), role);
        Ok(())
    }

    async fn remove_owner(&self, key: &str, name: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(state
            .owners
            .get_mut(key)
            .and_then(|owners| owners.remove(name))
            .map_or(0, |_| 1))
    }

    async fn remove_all_owners(&self, key: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        Ok(state
            .owners
            .remove(key)
            .map_or(0, |owners| owners.len() as u64))
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.write().await;
        state.users.insert(user.name.clone(), user.clone());
        Ok(())
    }

    async fn user(&self, name: &str) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(name).cloned())
    }

    async fn users_with_tags(&self, tags: &[String]) -> Result<Vec<User>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .filter(|user| tags.iter().any(|tag| user.has_tag(tag)))
            .cloned()
            .collect())
    }

    async fn add_favourite(&self, user: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.favourites.insert((user.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn favourites_of(&self, user: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .favourites
            .iter()
            .filter(|(name, _)| name == user)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn remove_favourites(&self, key: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.favourites.len();
        state.favourites.retain(|(_, favourite)| favourite != key);
        Ok((before - state.favourites.len()) as u64)
    }
}
