mod common;

use common::{Harness, START};
use serde_json::json;
use trellis_core::{
    clock::Clock,
    error::OrchestrationError,
    orchestration::job::{EnqueueRequest, JobState},
};

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    queue
        .add_job(EnqueueRequest::new("count-posts", "dataset-a"))
        .await
        .unwrap();

    let mut first = queue.get_job("count-posts", None, true).await.unwrap().unwrap();
    let mut second = queue.get_job("count-posts", None, true).await.unwrap().unwrap();
    assert_eq!(first.id(), second.id());

    let (a, b) = tokio::join!(first.claim(), second.claim());
    let outcomes = [a, b];
    let wins = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let losses = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(OrchestrationError::AlreadyClaimed(_))))
        .count();
    assert_eq!((wins, losses), (1, 1));
}

#[tokio::test]
async fn adding_a_queued_job_again_returns_the_original_row() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();

    let first = queue
        .add_job(EnqueueRequest::new("count-posts", "dataset-a").details(json!({"n": 1})))
        .await
        .unwrap();
    let second = queue
        .add_job(EnqueueRequest::new("count-posts", "dataset-a").details(json!({"n": 2})))
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.details(), &json!({"n": 1}));
    assert_eq!(queue.get_job_count(Some("count-posts")).await.unwrap(), 1);
}

#[tokio::test]
async fn recurring_jobs_come_back_after_their_interval() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    queue
        .add_job(EnqueueRequest::new("expire-datasets", "maintenance").interval(60))
        .await
        .unwrap();

    let mut job = queue.get_job("expire-datasets", None, true).await.unwrap().unwrap();
    job.claim().await.unwrap();
    assert_eq!(job.record().timestamp_claimed, 960);

    job.finish(false).await.unwrap();
    assert_eq!(job.state(), JobState::Queued);
    assert_eq!(queue.get_job_count(Some("expire-datasets")).await.unwrap(), 1);
    assert!(queue.get_job("expire-datasets", None, true).await.unwrap().is_none());

    harness.clock.set(1_020);
    let again = queue.get_job("expire-datasets", None, true).await.unwrap();
    assert!(again.is_some());

    job.finish(true).await.unwrap();
    assert_eq!(queue.get_job_count(Some("expire-datasets")).await.unwrap(), 0);
}

#[tokio::test]
async fn released_jobs_wait_for_their_delay() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    let mut job = queue
        .add_job(EnqueueRequest::new("count-posts", "dataset-a"))
        .await
        .unwrap();
    job.claim().await.unwrap();
    job.release(30, 0).await.unwrap();

    let stored = queue.get_job_by_id(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.record().timestamp_after, START + 30);
    assert_eq!(stored.record().attempts, 1);
    assert!(queue.get_job("count-posts", None, true).await.unwrap().is_none());

    harness.clock.advance(31);
    assert!(queue.get_job("count-posts", None, true).await.unwrap().is_some());
}

#[tokio::test]
async fn release_all_frees_every_claim() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    for remote_id in ["a", "b"] {
        let mut job = queue
            .add_job(EnqueueRequest::new("count-posts", remote_id))
            .await
            .unwrap();
        job.claim().await.unwrap();
    }
    assert!(queue.get_all_jobs(Some("count-posts"), None, true).await.unwrap().is_empty());

    assert_eq!(queue.release_all().await.unwrap(), 2);
    assert_eq!(queue.get_all_jobs(Some("count-posts"), None, true).await.unwrap().len(), 2);
}

#[tokio::test]
async fn queue_position_counts_claimed_and_older_jobs() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    let mut t1 = queue.add_job(EnqueueRequest::new("count-posts", "t1")).await.unwrap();
    let t2 = queue.add_job(EnqueueRequest::new("count-posts", "t2")).await.unwrap();
    let t3 = queue.add_job(EnqueueRequest::new("count-posts", "t3")).await.unwrap();
    queue.add_job(EnqueueRequest::new("word-tree", "other")).await.unwrap();

    assert_eq!(queue.get_place_in_queue(&t1).await.unwrap(), 0);
    assert_eq!(queue.get_place_in_queue(&t3).await.unwrap(), 2);

    t1.claim().await.unwrap();

    assert_eq!(queue.get_place_in_queue(&t1).await.unwrap(), 0);
    assert_eq!(queue.get_place_in_queue(&t2).await.unwrap(), 1);
    assert_eq!(queue.get_place_in_queue(&t3).await.unwrap(), 2);
}

#[tokio::test]
async fn claims_after_the_claim_time_only() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    let now = harness.clock.now();
    queue
        .add_job(EnqueueRequest::new("count-posts", "later").claim_after(now + 100))
        .await
        .unwrap();

    assert!(queue.get_job("count-posts", None, true).await.unwrap().is_none());
    assert!(queue.get_job("count-posts", Some(now + 101), true).await.unwrap().is_some());
}

#[tokio::test]
async fn snapshot_groups_jobs_by_type() {
    let harness = Harness::new();
    let queue = harness.orchestrator.queue();
    let mut claimed = queue.add_job(EnqueueRequest::new("count-posts", "a")).await.unwrap();
    queue.add_job(EnqueueRequest::new("count-posts", "b")).await.unwrap();
    queue.add_job(EnqueueRequest::new("word-tree", "c")).await.unwrap();
    claimed.claim().await.unwrap();

    let snapshot = queue.snapshot().await.unwrap();
    let count_posts = &snapshot.queues["count-posts"];
    assert_eq!((count_posts.queued, count_posts.claimed), (1, 1));
    assert_eq!(snapshot.queues["word-tree"].queued, 1);
}
