//! Ports consumed by the scheduler: job storage and the content publisher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use pubsched_core::{ContentId, DomainError, JobId, WorkerId};

use crate::job::{JobStatus, PublishJob};

/// Job repository operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// A different job already owns this `(content_id, publish_at_utc)` pair.
    #[error("duplicate idempotency key for content {content_id} at {publish_at_utc}")]
    DuplicateKey {
        content_id: ContentId,
        publish_at_utc: DateTime<Utc>,
    },
    /// The stored job is already `succeeded` or `failed`.
    #[error("job {0} is terminal and cannot be overwritten")]
    Terminal(JobId),
    /// A stored row could not be turned back into a valid job.
    #[error("corrupt job record: {0}")]
    Corrupt(#[from] DomainError),
    /// The backing store failed or is unreachable.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub retry_wait: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::RetryWait => self.retry_wait += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.retry_wait + self.succeeded + self.failed
    }
}

/// Persistent job storage.
///
/// Implementations must enforce uniqueness of `(content_id, publish_at_utc)`
/// and must implement [`claim_job`](Self::claim_job) as a single conditional
/// write. The scheduler relies on nothing else for cross-worker exclusion.
#[async_trait::async_trait]
pub trait PublishJobRepository: Send + Sync {
    /// Look up the job for an idempotency key.
    async fn get_by_idempotency_key(
        &self,
        content_id: &ContentId,
        publish_at_utc: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError>;

    /// Look up a job by id.
    async fn get(&self, id: JobId) -> Result<Option<PublishJob>, RepositoryError>;

    /// Insert or fully replace a job.
    ///
    /// Fails with [`RepositoryError::DuplicateKey`] if another job owns the
    /// same idempotency key, and with [`RepositoryError::Terminal`] if the
    /// stored version is already terminal.
    async fn save(&self, job: PublishJob) -> Result<PublishJob, RepositoryError>;

    /// Replace a job only while the stored version is still `queued`.
    ///
    /// Returns `None`, writing nothing, when the job is missing or has left
    /// `queued` (typically because a worker claimed it). Fails with
    /// [`RepositoryError::DuplicateKey`] like [`save`](Self::save).
    async fn update_if_queued(&self, job: PublishJob) -> Result<Option<PublishJob>, RepositoryError>;

    /// Hard delete of a `queued` job, as one conditional write.
    ///
    /// Returns `false`, deleting nothing, when the job is missing or no longer
    /// queued.
    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError>;

    /// Jobs claimable at `now`, oldest `publish_at_utc` first (ties by id).
    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublishJob>, RepositoryError>;

    /// Atomically move a claimable, due job to `running` for `worker_id`.
    ///
    /// Returns `None` when another caller claimed it first or it is no longer
    /// claimable. That outcome is expected under contention and is not an error.
    async fn claim_job(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError>;

    /// Jobs with `start <= publish_at_utc < end`, optionally filtered by status,
    /// ascending by `publish_at_utc`.
    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<PublishJob>, RepositoryError>;

    /// Job counts by status.
    async fn stats(&self) -> Result<JobStats, RepositoryError>;
}

#[async_trait::async_trait]
impl<R: PublishJobRepository + ?Sized> PublishJobRepository for Arc<R> {
    async fn get_by_idempotency_key(
        &self,
        content_id: &ContentId,
        publish_at_utc: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        (**self).get_by_idempotency_key(content_id, publish_at_utc).await
    }

    async fn get(&self, id: JobId) -> Result<Option<PublishJob>, RepositoryError> {
        (**self).get(id).await
    }

    async fn save(&self, job: PublishJob) -> Result<PublishJob, RepositoryError> {
        (**self).save(job).await
    }

    async fn update_if_queued(&self, job: PublishJob) -> Result<Option<PublishJob>, RepositoryError> {
        (**self).update_if_queued(job).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        (**self).delete(id).await
    }

    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        (**self).list_due_jobs(now, limit).await
    }

    async fn claim_job(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        (**self).claim_job(id, worker_id, now).await
    }

    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        (**self).list_in_range(start, end, statuses).await
    }

    async fn stats(&self) -> Result<JobStats, RepositoryError> {
        (**self).stats().await
    }
}

/// What the content service said about a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The publisher answered but refused; the reason is kept on the job.
    Rejected(String),
}

/// The publish side effect, owned by the content service.
///
/// Callers must not assume this is panic-free.
#[async_trait::async_trait]
pub trait ContentPublisher: Send + Sync {
    async fn publish(&self, content_id: &ContentId) -> Result<PublishOutcome, String>;
}

#[async_trait::async_trait]
impl<P: ContentPublisher + ?Sized> ContentPublisher for Arc<P> {
    async fn publish(&self, content_id: &ContentId) -> Result<PublishOutcome, String> {
        (**self).publish(content_id).await
    }
}
