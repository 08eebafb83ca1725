//! In-process poller that drains due jobs on a timer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pubsched_core::{Clock, WorkerId};
use pubsched_scheduler::{
    ContentPublisher, PublishJobRepository, RunSummary, SchedulerError, SchedulerService,
};

use crate::config::PollerConfig;

/// Cumulative poller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub cycles: u64,
    pub idle_cycles: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub cycle_errors: u64,
}

impl PollerStats {
    fn record(&mut self, summary: &RunSummary) {
        self.cycles += 1;
        if summary.is_idle() {
            self.idle_cycles += 1;
        }
        self.jobs_processed += summary.processed as u64;
        self.jobs_succeeded += summary.succeeded as u64;
        self.jobs_retried += summary.retried as u64;
        self.jobs_failed += summary.failed as u64;
    }

    fn record_error(&mut self) {
        self.cycles += 1;
        self.cycle_errors += 1;
    }
}

struct Shared<R, P, C> {
    service: SchedulerService<R, P, C>,
    config: PollerConfig,
    /// Serializes cycles between the loop and `trigger_now`.
    cycle_lock: tokio::sync::Mutex<()>,
    stats: Mutex<PollerStats>,
}

impl<R, P, C> Shared<R, P, C>
where
    R: PublishJobRepository,
    P: ContentPublisher,
    C: Clock,
{
    fn stats(&self) -> MutexGuard<'_, PollerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_cycle(&self) -> Result<RunSummary, SchedulerError> {
        let _cycle = self.cycle_lock.lock().await;
        let worker_id = &self.config.worker_id;

        match self
            .service
            .run_due_jobs(worker_id, self.config.max_jobs_per_cycle)
            .await
        {
            Ok(results) => {
                let summary = RunSummary::from_results(&results);
                self.stats().record(&summary);
                if summary.is_idle() {
                    debug!(%worker_id, "poll cycle idle");
                } else if summary.is_degraded() {
                    warn!(%worker_id, %summary, "poll cycle finished with failures");
                } else {
                    info!(%worker_id, %summary, "poll cycle finished");
                }
                Ok(summary)
            }
            Err(e) => {
                self.stats().record_error();
                error!(%worker_id, error = %e, code = e.code(), "poll cycle failed");
                Err(e)
            }
        }
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    /// `None` while a `stop` call is waiting on it.
    handle: Option<JoinHandle<()>>,
}

impl RunningLoop {
    /// The loop task owns the only receiver, so the channel closes exactly
    /// when the task has finished.
    fn is_alive(&self) -> bool {
        !self.shutdown.is_closed()
    }
}

/// Drives [`SchedulerService::run_due_jobs`] every `interval` (plus jitter)
/// until stopped.
///
/// Cycles never overlap: the background loop and [`trigger_now`](Self::trigger_now)
/// share one async mutex. A failing cycle is logged and counted and the loop
/// keeps going.
pub struct JobPoller<R, P, C> {
    shared: Arc<Shared<R, P, C>>,
    running: Mutex<Option<RunningLoop>>,
}

impl<R, P, C> JobPoller<R, P, C>
where
    R: PublishJobRepository + 'static,
    P: ContentPublisher + 'static,
    C: Clock + 'static,
{
    pub fn new(service: SchedulerService<R, P, C>, config: PollerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                config,
                cycle_lock: tokio::sync::Mutex::new(()),
                stats: Mutex::new(PollerStats::default()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.config.worker_id
    }

    pub fn service(&self) -> &SchedulerService<R, P, C> {
        &self.shared.service
    }

    /// Spawn the polling loop. Returns `false` if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running_slot();
        if running.as_ref().is_some_and(RunningLoop::is_alive) {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(self.shared.clone(), shutdown_rx));
        *running = Some(RunningLoop {
            shutdown,
            handle: Some(handle),
        });
        true
    }

    /// Signal the loop to stop and wait up to `stop_timeout` for it.
    ///
    /// An idle sleep is interrupted immediately; an in-flight cycle runs to
    /// completion. Returns `true` if the loop exited within the timeout (or
    /// was not running). After a timeout the loop stays tracked: it still
    /// counts as running until its cycle ends, and `start` refuses until then.
    pub async fn stop(&self) -> bool {
        let handle = {
            let mut running = self.running_slot();
            let Some(current) = running.as_mut() else {
                return true;
            };
            let _ = current.shutdown.send(true);
            current.handle.take()
        };
        let Some(mut handle) = handle else {
            // Another `stop` is already waiting on the task.
            return !self.is_running();
        };

        let timeout = self.shared.config.stop_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                self.clear_finished();
                if let Err(e) = joined {
                    error!(worker_id = %self.worker_id(), error = %e, "poller task ended abnormally");
                    return false;
                }
                true
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "poller did not stop in time; in-flight cycle left to finish"
                );
                if let Some(current) = self.running_slot().as_mut() {
                    if current.handle.is_none() && !handle.is_finished() {
                        current.handle = Some(handle);
                    }
                }
                false
            }
        }
    }

    /// Run one cycle now, waiting for any in-flight cycle first.
    pub async fn trigger_now(&self) -> Result<RunSummary, SchedulerError> {
        self.shared.run_cycle().await
    }

    pub fn is_running(&self) -> bool {
        self.running_slot()
            .as_ref()
            .is_some_and(RunningLoop::is_alive)
    }

    pub fn stats(&self) -> PollerStats {
        *self.shared.stats()
    }

    fn clear_finished(&self) {
        let mut running = self.running_slot();
        if running.as_ref().is_some_and(|r| !r.is_alive()) {
            *running = None;
        }
    }

    fn running_slot(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn poll_loop<R, P, C>(shared: Arc<Shared<R, P, C>>, mut shutdown: watch::Receiver<bool>)
where
    R: PublishJobRepository,
    P: ContentPublisher,
    C: Clock,
{
    let config = &shared.config;
    info!(
        worker_id = %config.worker_id,
        interval_ms = config.interval.as_millis() as u64,
        max_jobs = config.max_jobs_per_cycle,
        "poller started"
    );

    while !*shutdown.borrow() {
        // Errors are already logged and counted by the cycle.
        let _ = shared.run_cycle().await;

        let delay = config.interval + jitter(config.jitter);
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(worker_id = %config.worker_id, "poller stopped");
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn stats_distinguish_idle_from_degraded() {
        let mut stats = PollerStats::default();
        stats.record(&RunSummary::default());
        stats.record(&RunSummary {
            processed: 3,
            succeeded: 1,
            retried: 1,
            failed: 1,
        });
        stats.record_error();

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.idle_cycles, 1);
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.cycle_errors, 1);
    }
}
