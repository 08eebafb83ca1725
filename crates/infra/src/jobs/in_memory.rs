//! In-memory publish job repository for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use pubsched_core::{ContentId, JobId, WorkerId};
use pubsched_scheduler::{JobStats, JobStatus, PublishJob, PublishJobRepository, RepositoryError};

type IdempotencyKey = (ContentId, DateTime<Utc>);

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, PublishJob>,
    by_key: HashMap<IdempotencyKey, JobId>,
}

/// Process-local repository.
///
/// Every mutation happens under a single write lock, so `claim_job` is a
/// read-check-write with no window for a second claimer.
#[derive(Debug, Default)]
pub struct InMemoryPublishJobRepository {
    tables: RwLock<Tables>,
}

impl InMemoryPublishJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|t| t.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.tables
            .read()
            .map_err(|_| RepositoryError::storage("in-memory job table lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.tables
            .write()
            .map_err(|_| RepositoryError::storage("in-memory job table lock poisoned"))
    }
}

impl Tables {
    /// Insert or replace `job`, keeping the idempotency index in step.
    fn put(&mut self, job: PublishJob) -> Result<PublishJob, RepositoryError> {
        let key = key_of(&job);
        if let Some(owner) = self.by_key.get(&key) {
            if *owner != job.id() {
                return Err(RepositoryError::DuplicateKey {
                    content_id: key.0,
                    publish_at_utc: key.1,
                });
            }
        }

        if let Some(previous_key) = self.jobs.get(&job.id()).map(key_of) {
            if previous_key != key {
                self.by_key.remove(&previous_key);
            }
        }

        self.by_key.insert(key, job.id());
        self.jobs.insert(job.id(), job.clone());
        Ok(job)
    }
}

fn key_of(job: &PublishJob) -> IdempotencyKey {
    (job.content_id().clone(), job.publish_at_utc())
}

fn sort_by_publish_time(jobs: &mut [PublishJob]) {
    jobs.sort_by(|a, b| {
        a.publish_at_utc()
            .cmp(&b.publish_at_utc())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

#[async_trait::async_trait]
impl PublishJobRepository for InMemoryPublishJobRepository {
    async fn get_by_idempotency_key(
        &self,
        content_id: &ContentId,
        publish_at_utc: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        let tables = self.read()?;
        Ok(tables
            .by_key
            .get(&(content_id.clone(), publish_at_utc))
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn get(&self, id: JobId) -> Result<Option<PublishJob>, RepositoryError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn save(&self, job: PublishJob) -> Result<PublishJob, RepositoryError> {
        let mut tables = self.write()?;
        if tables
            .jobs
            .get(&job.id())
            .is_some_and(|stored| stored.status().is_terminal())
        {
            return Err(RepositoryError::Terminal(job.id()));
        }
        tables.put(job)
    }

    async fn update_if_queued(&self, job: PublishJob) -> Result<Option<PublishJob>, RepositoryError> {
        let mut tables = self.write()?;
        let queued = tables
            .jobs
            .get(&job.id())
            .is_some_and(|stored| stored.status() == JobStatus::Queued);
        if !queued {
            return Ok(None);
        }
        tables.put(job).map(Some)
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        let mut tables = self.write()?;
        let key = match tables.jobs.get(&id) {
            Some(job) if job.status() == JobStatus::Queued => key_of(job),
            _ => return Ok(false),
        };
        tables.jobs.remove(&id);
        tables.by_key.remove(&key);
        Ok(true)
    }

    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();

        sort_by_publish_time(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_job(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        let mut tables = self.write()?;
        let Some(current) = tables.jobs.get(&id) else {
            return Ok(None);
        };
        let Ok(claimed) = current.clone().claim(worker_id.clone(), now) else {
            return Ok(None);
        };

        tables.jobs.insert(id, claimed.clone());
        Ok(Some(claimed))
    }

    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        let tables = self.read()?;
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| start <= job.publish_at_utc() && job.publish_at_utc() < end)
            .filter(|job| statuses.map_or(true, |s| s.contains(&job.status())))
            .cloned()
            .collect();

        sort_by_publish_time(&mut jobs);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, RepositoryError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            stats.record(job.status(), 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap()
    }

    fn job(content: &str, at: DateTime<Utc>) -> PublishJob {
        PublishJob::new(ContentId::new(content).unwrap(), at, t0() - Duration::hours(1))
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    #[tokio::test]
    async fn second_job_for_same_key_is_rejected() {
        let repo = InMemoryPublishJobRepository::new();
        repo.save(job("post-1", t0())).await.unwrap();

        let err = repo.save(job("post-1", t0())).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateKey { .. }));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let repo = InMemoryPublishJobRepository::new();
        let saved = repo.save(job("post-1", t0())).await.unwrap();

        let first = repo.claim_job(saved.id(), &worker("a"), t0()).await.unwrap();
        let second = repo.claim_job(saved.id(), &worker("b"), t0()).await.unwrap();

        assert_eq!(first.unwrap().claimed_by(), Some(&worker("a")));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_before_publish_time_returns_none() {
        let repo = InMemoryPublishJobRepository::new();
        let saved = repo.save(job("post-1", t0())).await.unwrap();

        let early = repo
            .claim_job(saved.id(), &worker("a"), t0() - Duration::seconds(1))
            .await
            .unwrap();
        assert!(early.is_none());
        assert_eq!(repo.get(saved.id()).await.unwrap().unwrap().status(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn terminal_rows_cannot_be_overwritten() {
        let repo = InMemoryPublishJobRepository::new();
        let saved = repo.save(job("post-1", t0())).await.unwrap();
        let running = repo.claim_job(saved.id(), &worker("a"), t0()).await.unwrap().unwrap();
        repo.save(running.clone().succeed(t0()).unwrap()).await.unwrap();

        let err = repo.save(running.fail("late", t0()).unwrap()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Terminal(id) if id == saved.id()));
        assert_eq!(
            repo.get(saved.id()).await.unwrap().unwrap().status(),
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn reschedule_moves_idempotency_index() {
        let repo = InMemoryPublishJobRepository::new();
        let saved = repo.save(job("post-1", t0())).await.unwrap();
        let later = t0() + Duration::hours(1);
        repo.save(saved.clone().reschedule(later, t0()).unwrap())
            .await
            .unwrap();

        let content = ContentId::new("post-1").unwrap();
        assert!(repo.get_by_idempotency_key(&content, t0()).await.unwrap().is_none());
        assert_eq!(
            repo.get_by_idempotency_key(&content, later).await.unwrap().unwrap().id(),
            saved.id()
        );

        // The old slot is free again.
        repo.save(job("post-1", t0())).await.unwrap();
    }

    #[tokio::test]
    async fn delete_only_removes_queued_jobs() {
        let repo = InMemoryPublishJobRepository::new();
        let queued = repo.save(job("post-1", t0())).await.unwrap();
        let claimed = repo.save(job("post-2", t0())).await.unwrap();
        repo.claim_job(claimed.id(), &worker("a"), t0()).await.unwrap();

        assert!(!repo.delete(claimed.id()).await.unwrap());
        assert_eq!(
            repo.get(claimed.id()).await.unwrap().unwrap().status(),
            JobStatus::Running
        );

        assert!(repo.delete(queued.id()).await.unwrap());
        assert!(!repo.delete(queued.id()).await.unwrap());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn update_if_queued_leaves_claimed_jobs_alone() {
        let repo = InMemoryPublishJobRepository::new();
        let saved = repo.save(job("post-1", t0())).await.unwrap();
        let later = t0() + Duration::hours(1);
        let moved = saved.clone().reschedule(later, t0()).unwrap();

        repo.claim_job(saved.id(), &worker("a"), t0()).await.unwrap();
        assert!(repo.update_if_queued(moved.clone()).await.unwrap().is_none());
        let stored = repo.get(saved.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Running);
        assert_eq!(stored.publish_at_utc(), t0());

        let other = repo.save(job("post-2", t0())).await.unwrap();
        let updated = repo
            .update_if_queued(other.clone().reschedule(later, t0()).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.publish_at_utc(), later);
    }

    #[tokio::test]
    async fn due_jobs_are_oldest_first_and_limited() {
        let repo = InMemoryPublishJobRepository::new();
        let late = repo.save(job("late", t0())).await.unwrap();
        let early = repo.save(job("early", t0() - Duration::minutes(5))).await.unwrap();
        repo.save(job("future", t0() + Duration::minutes(5))).await.unwrap();

        let due = repo.list_due_jobs(t0(), 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(PublishJob::id).collect();
        assert_eq!(ids, vec![early.id(), late.id()]);

        assert_eq!(repo.list_due_jobs(t0(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn range_is_half_open_and_filters_status() {
        let repo = InMemoryPublishJobRepository::new();
        let start = repo.save(job("a", t0())).await.unwrap();
        repo.save(job("b", t0() + Duration::hours(1))).await.unwrap();

        let in_range = repo
            .list_in_range(t0(), t0() + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].id(), start.id());

        let running_only = repo
            .list_in_range(t0(), t0() + Duration::hours(2), Some(&[JobStatus::Running]))
            .await
            .unwrap();
        assert!(running_only.is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let repo = InMemoryPublishJobRepository::new();
        let a = repo.save(job("a", t0())).await.unwrap();
        repo.save(job("b", t0())).await.unwrap();
        repo.claim_job(a.id(), &worker("w"), t0()).await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 2);
    }
}
