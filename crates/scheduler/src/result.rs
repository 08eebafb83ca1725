//! Outcomes of executing jobs.

use serde::Serialize;

use pubsched_core::JobId;

use crate::job::PublishJob;

/// Outcome of one `execute_job` call, or the "nothing to do" sentinel of a
/// `run_due_jobs` pass that found no due jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The content was published; the job is `succeeded`.
    Succeeded { job: PublishJob },
    /// The attempt failed; the job is `retry_wait`.
    RetryScheduled { job: PublishJob, error: String },
    /// The attempt failed and the budget is spent; the job is `failed`.
    Failed { job: PublishJob, error: String },
    /// No job was claimable.
    NoJobs,
}

impl ExecutionResult {
    pub fn job(&self) -> Option<&PublishJob> {
        match self {
            ExecutionResult::Succeeded { job }
            | ExecutionResult::RetryScheduled { job, .. }
            | ExecutionResult::Failed { job, .. } => Some(job),
            ExecutionResult::NoJobs => None,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job().map(PublishJob::id)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ExecutionResult::RetryScheduled { error, .. } | ExecutionResult::Failed { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Succeeded { .. })
    }

    pub fn is_no_jobs(&self) -> bool {
        matches!(self, ExecutionResult::NoJobs)
    }
}

/// Aggregate view of one `run_due_jobs` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        results.iter().fold(Self::default(), |mut summary, result| {
            match result {
                ExecutionResult::Succeeded { .. } => summary.succeeded += 1,
                ExecutionResult::RetryScheduled { .. } => summary.retried += 1,
                ExecutionResult::Failed { .. } => summary.failed += 1,
                ExecutionResult::NoJobs => return summary,
            }
            summary.processed += 1;
            summary
        })
    }

    /// The pass ran and found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.processed == 0
    }

    /// At least one processed job did not publish.
    pub fn is_degraded(&self) -> bool {
        self.retried + self.failed > 0
    }
}

impl core::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_idle() {
            return f.write_str("idle");
        }
        write!(
            f,
            "processed={} succeeded={} retried={} failed={}",
            self.processed, self.succeeded, self.retried, self.failed
        )
    }
}
