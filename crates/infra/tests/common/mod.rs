#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};

use pubsched_core::{ContentId, ManualClock, WorkerId};
use pubsched_infra::InMemoryPublishJobRepository;
use pubsched_scheduler::{ContentPublisher, PublishOutcome, SchedulerConfig, SchedulerService};

pub type TestService =
    SchedulerService<Arc<InMemoryPublishJobRepository>, Arc<ScriptedPublisher>, ManualClock>;

/// One scripted publisher reaction.
#[derive(Debug, Clone)]
pub enum Step {
    Publish,
    Reject(&'static str),
    Fail(&'static str),
    Panic(&'static str),
}

/// Publisher that plays back scripted steps, then publishes by default.
#[derive(Debug, Default)]
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<HashMap<ContentId, usize>>,
}

impl ScriptedPublisher {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls_for(&self, content_id: &ContentId) -> usize {
        self.calls.lock().unwrap().get(content_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_calls_per_content(&self) -> usize {
        self.calls.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ContentPublisher for ScriptedPublisher {
    async fn publish(&self, content_id: &ContentId) -> Result<PublishOutcome, String> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(content_id.clone())
            .or_default() += 1;

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Publish);
        match step {
            Step::Publish => Ok(PublishOutcome::Published),
            Step::Reject(reason) => Ok(PublishOutcome::Rejected(reason.to_string())),
            Step::Fail(reason) => Err(reason.to_string()),
            Step::Panic(msg) => panic!("{}", msg),
        }
    }
}

pub fn t0() -> DateTime<Utc> {
    // Inside the EU autumn DST overlap; irrelevant for UTC arithmetic.
    Utc.with_ymd_and_hms(2024, 10, 27, 1, 30, 0).unwrap()
}

pub fn content(id: &str) -> ContentId {
    ContentId::new(id).unwrap()
}

pub fn worker(id: &str) -> WorkerId {
    WorkerId::new(id).unwrap()
}

pub fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

pub struct Harness {
    pub repo: Arc<InMemoryPublishJobRepository>,
    pub publisher: Arc<ScriptedPublisher>,
    pub clock: ManualClock,
    pub service: TestService,
}

pub fn harness(config: SchedulerConfig, steps: impl IntoIterator<Item = Step>) -> Harness {
    let repo = InMemoryPublishJobRepository::arc();
    let publisher = ScriptedPublisher::new(steps);
    let clock = ManualClock::new(t0());
    let service =
        SchedulerService::new(repo.clone(), publisher.clone(), clock.clone(), &config).unwrap();
    Harness {
        repo,
        publisher,
        clock,
        service,
    }
}

pub fn short_backoff() -> SchedulerConfig {
    SchedulerConfig {
        grace_seconds: 0,
        backoff_seconds: vec![5, 15, 60],
        max_attempts: 3,
    }
}
