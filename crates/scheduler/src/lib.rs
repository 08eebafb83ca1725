//! Scheduled-publish job engine: the job state machine, retry backoff, the
//! storage and publisher ports, and the [`SchedulerService`] that drives them.

pub mod backoff;
pub mod error;
pub mod job;
pub mod ports;
pub mod result;
pub mod service;

pub use backoff::{BackoffPolicy, DEFAULT_BACKOFF_SECONDS, DEFAULT_MAX_ATTEMPTS, MAX_DELAY_SECONDS};
pub use error::SchedulerError;
pub use job::{JobState, JobStatus, PublishJob, PublishJobParts};
pub use ports::{ContentPublisher, JobStats, PublishJobRepository, PublishOutcome, RepositoryError};
pub use result::{ExecutionResult, RunSummary};
pub use service::{SchedulerConfig, SchedulerService};
