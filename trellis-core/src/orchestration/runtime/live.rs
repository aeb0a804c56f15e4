use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::orchestration::{
    interrupt::{InterruptLevel, InterruptToken},
    job::JobRecord,
};

#[derive(Clone, Debug)]
struct LiveJob {
    jobtype: String,
    remote_id: String,
    token: InterruptToken,
}

/// Jobs currently executing in this process, keyed by job id.
#[derive(Clone, Debug, Default)]
pub struct LiveJobs {
    inner: Arc<RwLock<HashMap<i64, LiveJob>>>,
}

impl LiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job for the duration of its execution and hand out the token
    /// its handler polls.
    pub async fn register(&self, job: &JobRecord) -> InterruptToken {
        let token = InterruptToken::new();
        let mut guard = self.inner.write().await;
        guard.insert(
            job.id,
            LiveJob {
                jobtype: job.jobtype.clone(),
                remote_id: job.remote_id.clone(),
                token: token.clone(),
            },
        );
        token
    }

    pub async fn unregister(&self, job_id: i64) {
        self.inner.write().await.remove(&job_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn is_running(&self, jobtype: Option<&str>, remote_id: &str) -> bool {
        self.inner.read().await.values().any(|live| {
            live.remote_id == remote_id && jobtype.is_none_or(|t| live.jobtype == t)
        })
    }

    /// Raise `level` on every live job acting on `remote_id`, optionally
    /// restricted to one job type. Returns how many were signalled.
    pub async fn interrupt(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
        level: InterruptLevel,
    ) -> usize {
        let guard = self.inner.read().await;
        let mut signalled = 0;
        for (job_id, live) in guard.iter() {
            if live.remote_id == remote_id && jobtype.is_none_or(|t| live.jobtype == t) {
                live.token.interrupt(level);
                info!(job.id = job_id, jobtype = %live.jobtype, remote_id, %level, "job interrupted");
                signalled += 1;
            }
        }
        signalled
    }

    pub async fn interrupt_all(&self, level: InterruptLevel) -> usize {
        let guard = self.inner.read().await;
        for live in guard.values() {
            live.token.interrupt(level);
        }
        guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn record(id: i64, jobtype: &str, remote_id: &str) -> JobRecord {
        JobRecord {
            id,
            jobtype: jobtype.into(),
            remote_id: remote_id.into(),
            details: Value::Null,
            timestamp: 0,
            timestamp_after: 0,
            timestamp_claimed: 1,
            timestamp_lastclaimed: 1,
            interval: 0,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn interrupt_targets_matching_jobs_only() {
        let live = LiveJobs::new();
        let scrape = live.register(&record(1, "scrape", "abc")).await;
        let cancel = live.register(&record(2, "cancel-dataset", "abc")).await;
        let other = live.register(&record(3, "scrape", "xyz")).await;

        let hit = live.interrupt(Some("scrape"), "abc", InterruptLevel::Abort).await;

        assert_eq!(hit, 1);
        assert_eq!(scrape.level(), InterruptLevel::Abort);
        assert_eq!(cancel.level(), InterruptLevel::None);
        assert_eq!(other.level(), InterruptLevel::None);

        live.unregister(1).await;
        assert!(!live.is_running(Some("scrape"), "abc").await);
        assert_eq!(live.len().await, 2);
    }
}
