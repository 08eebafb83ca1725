//! HTTP adapter for the content service.

use std::time::Duration;

use reqwest::{Client, Url};
use tracing::{debug, instrument};

use pubsched_core::ContentId;
use pubsched_scheduler::{ContentPublisher, PublishOutcome};

/// Longest response body kept in a rejection message.
const MAX_BODY_CHARS: usize = 512;

/// Publishes content with `POST {base_url}/content/{content_id}/publish`.
///
/// Any 2xx is a publish. Other statuses are rejections carrying the status and
/// (truncated) body. Transport failures and timeouts are errors.
#[derive(Debug, Clone)]
pub struct HttpContentPublisher {
    client: Client,
    base_url: Url,
}

impl HttpContentPublisher {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// Endpoint for one content item. The id is percent-encoded as a single
    /// path segment.
    pub fn publish_url(&self, content_id: &ContentId) -> Result<Url, String> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| format!("base url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(["content", content_id.as_str(), "publish"]);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl ContentPublisher for HttpContentPublisher {
    #[instrument(skip(self), fields(content_id = %content_id))]
    async fn publish(&self, content_id: &ContentId) -> Result<PublishOutcome, String> {
        let url = self.publish_url(content_id)?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| format!("publish request failed: {e}"))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "content service accepted publish");
            return Ok(PublishOutcome::Published);
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.trim().chars().take(MAX_BODY_CHARS).collect();
        Ok(PublishOutcome::Rejected(format!("HTTP {}: {}", status.as_u16(), body)))
    }
}
