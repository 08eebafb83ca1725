//! Many workers racing over one repository.

mod common;

use std::sync::Arc;

use common::*;
use pubsched_core::ManualClock;
use pubsched_infra::InMemoryPublishJobRepository;
use pubsched_scheduler::{JobStatus, SchedulerConfig, SchedulerService};

const WORKERS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_worker_claims_a_due_job() {
    let h = harness(SchedulerConfig::default(), []);
    let at = t0() + secs(60);
    let job = h.service.schedule(content("post-1"), at).await.unwrap();
    h.clock.set(at);

    let barrier = Arc::new(tokio::sync::Barrier::new(WORKERS));
    let mut tasks = Vec::new();
    for i in 0..WORKERS {
        let service = SchedulerService::new(
            h.repo.clone(),
            h.publisher.clone(),
            h.clock.clone(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            service.claim_next(&worker(&format!("w{i}"))).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(claimed) = task.await.unwrap() {
            winners.push(claimed);
        }
    }

    assert_eq!(winners.len(), 1, "claims: {winners:?}");
    assert_eq!(winners[0].id(), job.id());
    assert_eq!(winners[0].status(), JobStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drains_publish_each_job_once() {
    let repo = InMemoryPublishJobRepository::arc();
    let publisher = ScriptedPublisher::new([]);
    let clock = ManualClock::new(t0());
    let config = SchedulerConfig::default();

    let scheduler =
        SchedulerService::new(repo.clone(), publisher.clone(), clock.clone(), &config).unwrap();
    for i in 0..50 {
        scheduler
            .schedule(content(&format!("post-{i}")), t0() + secs(1 + i))
            .await
            .unwrap();
    }
    clock.advance(secs(3600));

    let mut tasks = Vec::new();
    for i in 0..WORKERS {
        let service =
            SchedulerService::new(repo.clone(), publisher.clone(), clock.clone(), &config).unwrap();
        tasks.push(tokio::spawn(async move {
            let me = worker(&format!("w{i}"));
            // A lost claim ends a pass early, so keep draining until idle.
            loop {
                let results = service.run_due_jobs(&me, 5).await.unwrap();
                if results.iter().all(|r| r.is_no_jobs()) {
                    let stats = service.job_stats().await.unwrap();
                    if stats.queued == 0 && stats.running == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(publisher.total_calls(), 50);
    assert_eq!(publisher.max_calls_per_content(), 1);
    let stats = scheduler.job_stats().await.unwrap();
    assert_eq!(stats.succeeded, 50);
    assert_eq!(stats.total(), 50);
}
