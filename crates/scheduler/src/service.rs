//! Scheduler orchestration.
//!
//! `SchedulerService` holds no locks and no job state of its own: every
//! decision is re-read from the repository, and cross-worker exclusion comes
//! solely from [`PublishJobRepository::claim_job`]. It is cheap to build one
//! per worker.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use pubsched_core::{Clock, ContentId, DomainError, DomainResult, JobId, WorkerId};

use crate::backoff::{BackoffPolicy, DEFAULT_BACKOFF_SECONDS, DEFAULT_MAX_ATTEMPTS, MAX_DELAY_SECONDS};
use crate::error::SchedulerError;
use crate::job::{JobStatus, PublishJob};
use crate::ports::{ContentPublisher, JobStats, PublishJobRepository, PublishOutcome, RepositoryError};
use crate::result::ExecutionResult;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tolerance applied when checking that a requested time is in the future.
    pub grace_seconds: u64,
    /// Retry delays, indexed by failed-attempt count.
    pub backoff_seconds: Vec<u64>,
    /// Attempt budget, including the first attempt.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_seconds: 0,
            backoff_seconds: DEFAULT_BACKOFF_SECONDS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SchedulerConfig {
    pub fn backoff_policy(&self) -> DomainResult<BackoffPolicy> {
        BackoffPolicy::new(self.backoff_seconds.clone(), self.max_attempts)
    }

    pub fn grace(&self) -> DomainResult<Duration> {
        if self.grace_seconds > MAX_DELAY_SECONDS {
            return Err(DomainError::validation(format!(
                "grace {}s exceeds {MAX_DELAY_SECONDS}s",
                self.grace_seconds
            )));
        }
        Ok(Duration::seconds(self.grace_seconds as i64))
    }
}

/// Schedules, claims and executes publish jobs.
#[derive(Debug)]
pub struct SchedulerService<R, P, C> {
    repository: R,
    publisher: P,
    clock: C,
    backoff: BackoffPolicy,
    grace: Duration,
}

impl<R, P, C> SchedulerService<R, P, C>
where
    R: PublishJobRepository,
    P: ContentPublisher,
    C: Clock,
{
    pub fn new(repository: R, publisher: P, clock: C, config: &SchedulerConfig) -> DomainResult<Self> {
        Ok(Self {
            repository,
            publisher,
            clock,
            backoff: config.backoff_policy()?,
            grace: config.grace()?,
        })
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Create the job for `(content_id, publish_at_utc)`, or return the one
    /// that already exists for that pair, whatever its status.
    #[instrument(skip(self), fields(content_id = %content_id), err(level = "debug"))]
    pub async fn schedule(
        &self,
        content_id: ContentId,
        publish_at_utc: DateTime<Utc>,
    ) -> Result<PublishJob, SchedulerError> {
        if !self.clock.is_future(publish_at_utc, self.grace) {
            return Err(SchedulerError::PublishTimePast { publish_at_utc });
        }

        if let Some(existing) = self
            .repository
            .get_by_idempotency_key(&content_id, publish_at_utc)
            .await?
        {
            debug!(job_id = %existing.id(), status = %existing.status(), "already scheduled");
            return Ok(existing);
        }

        let job = PublishJob::new(content_id, publish_at_utc, self.clock.now());
        match self.repository.save(job).await {
            Ok(saved) => {
                info!(job_id = %saved.id(), publish_at_utc = %saved.publish_at_utc(), "scheduled publish job");
                Ok(saved)
            }
            // A concurrent schedule of the same intent won the insert.
            Err(RepositoryError::DuplicateKey {
                content_id,
                publish_at_utc,
            }) => self
                .repository
                .get_by_idempotency_key(&content_id, publish_at_utc)
                .await?
                .ok_or_else(|| {
                    RepositoryError::DuplicateKey {
                        content_id,
                        publish_at_utc,
                    }
                    .into()
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a queued job. Returns `true` once removed.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn unschedule(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        let job = self.load(job_id).await?;
        if job.status() != JobStatus::Queued {
            return Err(SchedulerError::CannotCancel {
                id: job_id,
                status: job.status(),
            });
        }

        if !self.repository.delete(job_id).await? {
            // Claimed (or removed) between the read and the delete.
            let current = self.load(job_id).await?;
            return Err(SchedulerError::CannotCancel {
                id: job_id,
                status: current.status(),
            });
        }
        info!(content_id = %job.content_id(), "unscheduled publish job");
        Ok(true)
    }

    /// Move a queued job to a new publish time.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn reschedule(
        &self,
        job_id: JobId,
        new_publish_at_utc: DateTime<Utc>,
    ) -> Result<PublishJob, SchedulerError> {
        let job = self.load(job_id).await?;
        if job.status() != JobStatus::Queued {
            return Err(SchedulerError::CannotReschedule {
                id: job_id,
                status: job.status(),
            });
        }
        if !self.clock.is_future(new_publish_at_utc, self.grace) {
            return Err(SchedulerError::PublishTimePast {
                publish_at_utc: new_publish_at_utc,
            });
        }
        if job.publish_at_utc() == new_publish_at_utc {
            return Ok(job);
        }

        let content_id = job.content_id().clone();
        if let Some(other) = self
            .repository
            .get_by_idempotency_key(&content_id, new_publish_at_utc)
            .await?
        {
            if other.id() != job_id {
                return Err(SchedulerError::ScheduleConflict {
                    content_id,
                    publish_at_utc: new_publish_at_utc,
                    existing: other.id(),
                });
            }
        }

        let previous = job.publish_at_utc();
        let moved = job.reschedule(new_publish_at_utc, self.clock.now())?;
        match self.repository.update_if_queued(moved).await {
            Ok(Some(saved)) => {
                info!(%previous, publish_at_utc = %saved.publish_at_utc(), "rescheduled publish job");
                Ok(saved)
            }
            Ok(None) => {
                let current = self.load(job_id).await?;
                Err(SchedulerError::CannotReschedule {
                    id: job_id,
                    status: current.status(),
                })
            }
            Err(RepositoryError::DuplicateKey { .. }) => {
                let existing = self
                    .repository
                    .get_by_idempotency_key(&content_id, new_publish_at_utc)
                    .await?
                    .map(|other| other.id())
                    .unwrap_or(job_id);
                Err(SchedulerError::ScheduleConflict {
                    content_id,
                    publish_at_utc: new_publish_at_utc,
                    existing,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest due job for `worker_id`.
    ///
    /// `Ok(None)` means nothing is due or another worker won the claim.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn claim_next(&self, worker_id: &WorkerId) -> Result<Option<PublishJob>, SchedulerError> {
        let now = self.clock.now();
        let Some(candidate) = self.repository.list_due_jobs(now, 1).await?.into_iter().next() else {
            return Ok(None);
        };

        if !self.clock.is_past_or_now(candidate.publish_at_utc()) {
            warn!(
                job_id = %candidate.id(),
                publish_at_utc = %candidate.publish_at_utc(),
                "repository listed a job before its publish time; skipping"
            );
            return Ok(None);
        }

        let claimed = self
            .repository
            .claim_job(candidate.id(), worker_id, now)
            .await?;
        match &claimed {
            Some(job) => debug!(job_id = %job.id(), attempts = job.attempts(), "claimed job"),
            None => debug!(job_id = %candidate.id(), "claim lost to another worker"),
        }
        Ok(claimed)
    }

    /// Publish a claimed job and record the outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id(), content_id = %job.content_id()))]
    pub async fn execute_job(&self, job: PublishJob) -> Result<ExecutionResult, SchedulerError> {
        if job.status() != JobStatus::Running {
            return Err(SchedulerError::JobNotRunning {
                id: job.id(),
                status: job.status(),
            });
        }
        if !self.clock.is_past_or_now(job.publish_at_utc()) {
            return Err(SchedulerError::NotYetDue {
                id: job.id(),
                publish_at_utc: job.publish_at_utc(),
            });
        }

        let publisher = &self.publisher;
        let content_id = job.content_id();
        let outcome = AssertUnwindSafe(async move { publisher.publish(content_id).await })
            .catch_unwind()
            .await
            .map_err(|panic| format!("publisher panicked: {}", panic_message(&*panic)))
            .and_then(std::convert::identity);

        let now = self.clock.now();
        match outcome {
            Ok(PublishOutcome::Published) => {
                let saved = self.repository.save(job.succeed(now)?).await?;
                info!(attempts = saved.attempts(), "published content");
                Ok(ExecutionResult::Succeeded { job: saved })
            }
            Ok(PublishOutcome::Rejected(reason)) | Err(reason) => {
                self.handle_failure(job, reason, now).await
            }
        }
    }

    /// Drain up to `max_jobs` due jobs for `worker_id`.
    ///
    /// Returns a single [`ExecutionResult::NoJobs`] when nothing was processed.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn run_due_jobs(
        &self,
        worker_id: &WorkerId,
        max_jobs: usize,
    ) -> Result<Vec<ExecutionResult>, SchedulerError> {
        let mut results = Vec::new();
        while results.len() < max_jobs {
            let Some(job) = self.claim_next(worker_id).await? else {
                break;
            };
            results.push(self.execute_job(job).await?);
        }

        if results.is_empty() {
            results.push(ExecutionResult::NoJobs);
        }
        Ok(results)
    }

    /// Calendar view over `[start, end)`.
    pub async fn list_jobs_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<PublishJob>, SchedulerError> {
        Ok(self.repository.list_in_range(start, end, statuses).await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, SchedulerError> {
        Ok(self.repository.stats().await?)
    }

    async fn load(&self, job_id: JobId) -> Result<PublishJob, SchedulerError> {
        self.repository
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    async fn handle_failure(
        &self,
        job: PublishJob,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult, SchedulerError> {
        let attempts = job.attempts().saturating_add(1);
        match self.backoff.next_retry(attempts, now) {
            Some(next_retry_at) => {
                let saved = self
                    .repository
                    .save(job.retry_later(reason.clone(), next_retry_at, now)?)
                    .await?;
                warn!(attempts, %next_retry_at, error = %reason, "publish failed; retry scheduled");
                Ok(ExecutionResult::RetryScheduled {
                    job: saved,
                    error: reason,
                })
            }
            None => {
                let saved = self.repository.save(job.fail(reason.clone(), now)?).await?;
                error!(attempts, error = %reason, "publish failed; giving up");
                Ok(ExecutionResult::Failed {
                    job: saved,
                    error: reason,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
