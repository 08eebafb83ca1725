//! Worker process wiring: pick a repository and publisher from configuration
//! and run the scheduler either continuously or for a single pass.

use std::future::Future;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use tracing::{info, warn};

use pubsched_core::{Clock, SystemClock};
use pubsched_infra::{
    AppConfig, HttpContentPublisher, InMemoryPublishJobRepository, JobPoller,
    PostgresPublishJobRepository, PollerStats,
};
use pubsched_scheduler::{ContentPublisher, PublishJobRepository, RunSummary, SchedulerService};

/// What the process does once wired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run the in-process poller until interrupted.
    Poll,
    /// Drain due jobs once and exit (for cron or an external trigger).
    RunOnce,
}

impl Mode {
    /// Parse the first CLI argument. No argument means `poll`.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let mode = match args.next() {
            None => Mode::Poll,
            Some(arg) => match arg.as_ref() {
                "poll" => Mode::Poll,
                "run-once" => Mode::RunOnce,
                other => bail!("unknown mode {other:?} (expected `poll` or `run-once`)"),
            },
        };
        if let Some(extra) = args.next() {
            bail!("unexpected argument {:?}", extra.as_ref());
        }
        Ok(mode)
    }
}

/// Wire everything from `config` and run `mode` until `shutdown` resolves
/// (poll) or one pass completes (run-once).
pub async fn run<F>(mode: Mode, config: AppConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let base_url = config.require_publisher_url()?.clone();
    let publisher = HttpContentPublisher::new(base_url, config.publish_timeout)
        .context("building HTTP client for the content service")?;

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPool::connect(&url)
                .await
                .context("connecting to Postgres")?;
            let repo = PostgresPublishJobRepository::new(pool);
            repo.ensure_schema().await.context("applying schema")?;
            run_with(mode, repo, publisher, SystemClock, config, shutdown).await
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory repository (jobs are not persisted)");
            let repo = InMemoryPublishJobRepository::arc();
            run_with(mode, repo, publisher, SystemClock, config, shutdown).await
        }
    }
}

/// Run `mode` over explicit ports.
pub async fn run_with<R, P, C, F>(
    mode: Mode,
    repo: R,
    publisher: P,
    clock: C,
    config: AppConfig,
    shutdown: F,
) -> Result<()>
where
    R: PublishJobRepository + 'static,
    P: ContentPublisher + 'static,
    C: Clock + 'static,
    F: Future<Output = ()>,
{
    let service = SchedulerService::new(repo, publisher, clock, &config.scheduler)
        .context("invalid scheduler configuration")?;
    let poller = JobPoller::new(service, config.poller);

    match mode {
        Mode::RunOnce => {
            let summary = run_once(&poller).await?;
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Mode::Poll => {
            let stats = poll_until(&poller, shutdown).await;
            info!(
                cycles = stats.cycles,
                jobs_processed = stats.jobs_processed,
                jobs_failed = stats.jobs_failed,
                cycle_errors = stats.cycle_errors,
                "worker exiting"
            );
            Ok(())
        }
    }
}

pub async fn run_once<R, P, C>(poller: &JobPoller<R, P, C>) -> Result<RunSummary>
where
    R: PublishJobRepository + 'static,
    P: ContentPublisher + 'static,
    C: Clock + 'static,
{
    let summary = poller
        .trigger_now()
        .await
        .with_context(|| format!("run-once pass for {} failed", poller.worker_id()))?;
    info!(worker_id = %poller.worker_id(), %summary, "run-once pass finished");
    Ok(summary)
}

pub async fn poll_until<R, P, C, F>(poller: &JobPoller<R, P, C>, shutdown: F) -> PollerStats
where
    R: PublishJobRepository + 'static,
    P: ContentPublisher + 'static,
    C: Clock + 'static,
    F: Future<Output = ()>,
{
    poller.start();
    shutdown.await;
    info!(worker_id = %poller.worker_id(), "shutdown requested");

    if !poller.stop().await {
        warn!(worker_id = %poller.worker_id(), "poller did not stop cleanly");
    }
    poller.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use pubsched_core::{ContentId, ManualClock, WorkerId};
    use pubsched_infra::PollerConfig;
    use pubsched_scheduler::{PublishOutcome, SchedulerConfig};

    struct AlwaysPublish;

    #[async_trait::async_trait]
    impl ContentPublisher for AlwaysPublish {
        async fn publish(&self, _content_id: &ContentId) -> Result<PublishOutcome, String> {
            Ok(PublishOutcome::Published)
        }
    }

    fn poller_config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(10),
            max_jobs_per_cycle: 10,
            stop_timeout: Duration::from_secs(5),
            jitter: Duration::ZERO,
            worker_id: WorkerId::new("worker-test").unwrap(),
        }
    }

    #[test]
    fn parses_modes() {
        assert_eq!(Mode::from_args(Vec::<String>::new()).unwrap(), Mode::Poll);
        assert_eq!(Mode::from_args(["poll"]).unwrap(), Mode::Poll);
        assert_eq!(Mode::from_args(["run-once"]).unwrap(), Mode::RunOnce);
        assert!(Mode::from_args(["serve"]).is_err());
        assert!(Mode::from_args(["poll", "extra"]).is_err());
    }

    #[tokio::test]
    async fn run_once_drains_due_jobs() {
        let start = Utc.with_ymd_and_hms(2025, 3, 30, 0, 59, 0).unwrap();
        let clock = ManualClock::new(start);
        let repo = InMemoryPublishJobRepository::arc();
        let service = SchedulerService::new(
            repo.clone(),
            AlwaysPublish,
            clock.clone(),
            &SchedulerConfig::default(),
        )
        .unwrap();

        for id in ["a", "b"] {
            service
                .schedule(ContentId::new(id).unwrap(), start + chrono::Duration::minutes(1))
                .await
                .unwrap();
        }
        clock.advance(chrono::Duration::minutes(1));

        let poller = JobPoller::new(service, poller_config());
        let summary = run_once(&poller).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn poll_until_stops_on_shutdown() {
        let service = SchedulerService::new(
            InMemoryPublishJobRepository::arc(),
            AlwaysPublish,
            ManualClock::default(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        let poller = JobPoller::new(service, poller_config());

        let stats = poll_until(&poller, tokio::time::sleep(Duration::from_millis(50))).await;
        assert!(stats.cycles >= 1);
        assert_eq!(stats.cycle_errors, 0);
        assert!(!poller.is_running());
    }
}
