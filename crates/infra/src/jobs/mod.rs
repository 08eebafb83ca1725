//! Publish job repositories.
//!
//! - `InMemoryPublishJobRepository`: process-local, for tests, dev and single-process runs
//! - `PostgresPublishJobRepository`: durable, safe for many worker processes

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryPublishJobRepository;
pub use postgres::PostgresPublishJobRepository;
