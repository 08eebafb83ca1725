//! The publish job entity and its state machine.
//!
//! A [`PublishJob`] is an immutable value. Every lifecycle change goes through a
//! transition method that consumes the job and returns the next version, so a
//! job can never hold a field combination its status does not allow (for
//! example a `claimed_by` while queued).

use chrono::{DateTime, Utc};

use pubsched_core::{ContentId, DomainError, DomainResult, JobId, WorkerId};

/// Flat job status, as persisted and filtered on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting for `publish_at_utc`.
    Queued,
    /// Claimed by a worker and executing.
    Running,
    /// Failed at least once, waiting for `next_retry_at`.
    RetryWait,
    /// Published (terminal).
    Succeeded,
    /// Gave up after `max_attempts` (terminal).
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::RetryWait,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::RetryWait => "retry_wait",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Statuses a worker may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::RetryWait)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::corrupt(format!("unknown job status '{s}'")))
    }
}

/// Lifecycle state with the data each state carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running {
        claimed_by: WorkerId,
    },
    RetryWait {
        next_retry_at: DateTime<Utc>,
    },
    Succeeded {
        completed_at: DateTime<Utc>,
        actual_publish_at: DateTime<Utc>,
    },
    Failed {
        completed_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running { .. } => JobStatus::Running,
            JobState::RetryWait { .. } => JobStatus::RetryWait,
            JobState::Succeeded { .. } => JobStatus::Succeeded,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// One publish intent: publish `content_id` at `publish_at_utc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    id: JobId,
    content_id: ContentId,
    publish_at_utc: DateTime<Utc>,
    state: JobState,
    attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Flat, storage-shaped view of a job.
///
/// Repositories persist this form; [`PublishJob::from_parts`] validates it back
/// into the typed state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJobParts {
    pub id: JobId,
    pub content_id: ContentId,
    pub publish_at_utc: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_publish_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishJob {
    /// Create a new queued job with `attempts = 0`.
    pub fn new(content_id: ContentId, publish_at_utc: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            content_id,
            publish_at_utc,
            state: JobState::Queued,
            attempts: 0,
            last_attempt_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn publish_at_utc(&self) -> DateTime<Utc> {
        self.publish_at_utc
    }

    /// The `(content_id, publish_at_utc)` pair that identifies the intent.
    pub fn idempotency_key(&self) -> (&ContentId, DateTime<Utc>) {
        (&self.content_id, self.publish_at_utc)
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn claimed_by(&self) -> Option<&WorkerId> {
        match &self.state {
            JobState::Running { claimed_by } => Some(claimed_by),
            _ => None,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::RetryWait { next_retry_at } => Some(next_retry_at),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Succeeded { completed_at, .. } | JobState::Failed { completed_at } => {
                Some(completed_at)
            }
            _ => None,
        }
    }

    pub fn actual_publish_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Succeeded {
                actual_publish_at, ..
            } => Some(actual_publish_at),
            _ => None,
        }
    }

    /// Whether a worker may claim this job at `now`.
    ///
    /// Never true before `publish_at_utc`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.publish_at_utc > now {
            return false;
        }
        match self.state {
            JobState::Queued => true,
            JobState::RetryWait { next_retry_at } => next_retry_at <= now,
            _ => false,
        }
    }

    /// `queued | retry_wait → running`.
    pub fn claim(self, worker_id: WorkerId, now: DateTime<Utc>) -> DomainResult<Self> {
        if !self.is_due(now) {
            return Err(self.reject("claim"));
        }
        Ok(Self {
            state: JobState::Running {
                claimed_by: worker_id,
            },
            updated_at: now,
            ..self
        })
    }

    /// `running → succeeded`.
    pub fn succeed(self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.require_running("succeed")?;
        Ok(Self {
            state: JobState::Succeeded {
                completed_at: now,
                actual_publish_at: now,
            },
            attempts: self.attempts.saturating_add(1),
            last_attempt_at: Some(now),
            updated_at: now,
            ..self
        })
    }

    /// `running → retry_wait`, counting the failed attempt.
    pub fn retry_later(
        self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        self.require_running("retry_later")?;
        Ok(Self {
            state: JobState::RetryWait { next_retry_at },
            attempts: self.attempts.saturating_add(1),
            last_attempt_at: Some(now),
            error_message: Some(error.into()),
            updated_at: now,
            ..self
        })
    }

    /// `running → failed`, counting the failed attempt.
    pub fn fail(self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        self.require_running("fail")?;
        Ok(Self {
            state: JobState::Failed { completed_at: now },
            attempts: self.attempts.saturating_add(1),
            last_attempt_at: Some(now),
            error_message: Some(error.into()),
            updated_at: now,
            ..self
        })
    }

    /// Move the target time of a queued job.
    pub fn reschedule(self, publish_at_utc: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<Self> {
        if self.status() != JobStatus::Queued {
            return Err(self.reject("reschedule"));
        }
        Ok(Self {
            publish_at_utc,
            updated_at: now,
            ..self
        })
    }

    /// Flatten into the storage shape.
    pub fn to_parts(&self) -> PublishJobParts {
        PublishJobParts {
            id: self.id,
            content_id: self.content_id.clone(),
            publish_at_utc: self.publish_at_utc,
            status: self.status(),
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at(),
            completed_at: self.completed_at(),
            actual_publish_at: self.actual_publish_at(),
            error_message: self.error_message.clone(),
            claimed_by: self.claimed_by().cloned(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Rebuild a job from its storage shape, checking the per-status columns.
    pub fn from_parts(parts: PublishJobParts) -> DomainResult<Self> {
        let id = parts.id;
        let missing = |column: &str| {
            DomainError::corrupt(format!(
                "job {id} is {} but {column} is null",
                parts.status
            ))
        };

        if parts.status != JobStatus::Running && parts.claimed_by.is_some() {
            return Err(DomainError::corrupt(format!(
                "job {id} is {} but has claimed_by set",
                parts.status
            )));
        }

        let state = match parts.status {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Running => JobState::Running {
                claimed_by: parts.claimed_by.clone().ok_or_else(|| missing("claimed_by"))?,
            },
            JobStatus::RetryWait => JobState::RetryWait {
                next_retry_at: parts.next_retry_at.ok_or_else(|| missing("next_retry_at"))?,
            },
            JobStatus::Succeeded => JobState::Succeeded {
                completed_at: parts.completed_at.ok_or_else(|| missing("completed_at"))?,
                actual_publish_at: parts
                    .actual_publish_at
                    .ok_or_else(|| missing("actual_publish_at"))?,
            },
            JobStatus::Failed => JobState::Failed {
                completed_at: parts.completed_at.ok_or_else(|| missing("completed_at"))?,
            },
        };

        Ok(Self {
            id,
            content_id: parts.content_id,
            publish_at_utc: parts.publish_at_utc,
            state,
            attempts: parts.attempts,
            last_attempt_at: parts.last_attempt_at,
            error_message: parts.error_message,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    fn require_running(&self, action: &'static str) -> DomainResult<()> {
        match self.state {
            JobState::Running { .. } => Ok(()),
            _ => Err(self.reject(action)),
        }
    }

    fn reject(&self, action: &'static str) -> DomainError {
        DomainError::invalid_transition(self.status().as_str(), action)
    }
}
