//! Hints to the dispatch scheduler that new deliveries exist.
//!
//! Purely a latency optimisation: the scheduler's poll loop finds the work
//! regardless, so failures here are logged and otherwise ignored.

use std::time::Duration;

use async_trait::async_trait;

pub use uniscan_proto::internal::INTERNAL_TOKEN_HEADER;
use uniscan_proto::internal::EnqueueRequest;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler answered with status {0}")]
    Status(u16),
}

#[async_trait]
pub trait WorkNotifier: Send + Sync {
    async fn notify(&self, delivery_ids: &[String]) -> Result<(), NotifyError>;
}

/// Posts `{deliveryIds}` to the dispatcher's `/enqueue`.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpNotifier {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/enqueue", base_url.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl WorkNotifier for HttpNotifier {
    async fn notify(&self, delivery_ids: &[String]) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(&EnqueueRequest {
            delivery_ids: delivery_ids.to_vec(),
        });
        if let Some(token) = &self.token {
            request = request.header(INTERNAL_TOKEN_HEADER, token);
        }
        let status = request.send().await?.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}
