//! Job runners.

pub mod poller;

pub use poller::{JobPoller, PollerStats};
