//! Content publisher adapters.

pub mod http;

pub use http::HttpContentPublisher;
