//! Scheduler error taxonomy.
//!
//! Every variant has a stable machine-readable [`code`](SchedulerError::code)
//! that an API layer can map to a status code without parsing messages.

use chrono::{DateTime, Utc};
use thiserror::Error;

use pubsched_core::{ContentId, DomainError, JobId};

use crate::job::JobStatus;
use crate::ports::RepositoryError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Requested publish time is not in the future (after grace).
    #[error("publish time {publish_at_utc} is in the past")]
    PublishTimePast { publish_at_utc: DateTime<Utc> },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {id} cannot be cancelled while {status}")]
    CannotCancel { id: JobId, status: JobStatus },

    #[error("job {id} cannot be rescheduled while {status}")]
    CannotReschedule { id: JobId, status: JobStatus },

    /// Another job already owns the target idempotency key.
    #[error("content {content_id} is already scheduled at {publish_at_utc} by job {existing}")]
    ScheduleConflict {
        content_id: ContentId,
        publish_at_utc: DateTime<Utc>,
        existing: JobId,
    },

    #[error("job {id} is {status}, expected running")]
    JobNotRunning { id: JobId, status: JobStatus },

    #[error("job {id} is not due until {publish_at_utc}")]
    NotYetDue {
        id: JobId,
        publish_at_utc: DateTime<Utc>,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl SchedulerError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::PublishTimePast { .. } => "publish_time_past",
            SchedulerError::JobNotFound(_) => "job_not_found",
            SchedulerError::CannotCancel { .. } => "cannot_cancel",
            SchedulerError::CannotReschedule { .. } => "cannot_reschedule",
            SchedulerError::ScheduleConflict { .. } => "schedule_conflict",
            SchedulerError::JobNotRunning { .. } => "job_not_running",
            SchedulerError::NotYetDue { .. } => "not_yet_due",
            SchedulerError::Repository(_) => "repository_error",
            SchedulerError::Domain(DomainError::InvalidTransition { .. }) => "invalid_transition",
            SchedulerError::Domain(_) => "domain_error",
        }
    }

    /// Caller-side validation failure (never retried, not a system error).
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            SchedulerError::Repository(_) | SchedulerError::Domain(_)
        )
    }
}
