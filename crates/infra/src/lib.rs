//! Infrastructure layer: job storage, the HTTP content publisher, the
//! in-process poller and configuration loading.

pub mod config;
pub mod jobs;
pub mod publisher;
pub mod runner;

pub use config::{AppConfig, ConfigError, PollerConfig};
pub use jobs::{InMemoryPublishJobRepository, PostgresPublishJobRepository};
pub use publisher::HttpContentPublisher;
pub use runner::{JobPoller, PollerStats};
