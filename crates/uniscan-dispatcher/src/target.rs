//! Where claimed deliveries get pushed.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use uniscan_proto::DispatchOutcome;
use uniscan_proto::internal::{DispatchReply, DispatchRequest, INTERNAL_TOKEN_HEADER};

use crate::error::DispatchError;

/// The gateway's `TriggerDispatch`, seen from the scheduler.
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    async fn dispatch(&self, delivery_id: &str) -> Result<DispatchOutcome, DispatchError>;
}

/// Calls `POST /internal/dispatch` on a gateway.
pub struct HttpDispatchTarget {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpDispatchTarget {
    pub fn new(
        gateway_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/internal/dispatch", gateway_url.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl DispatchTarget for HttpDispatchTarget {
    async fn dispatch(&self, delivery_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let mut request = self.client.post(&self.url).json(&DispatchRequest {
            delivery_id: delivery_id.to_string(),
        });
        if let Some(token) = &self.token {
            request = request.header(INTERNAL_TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        // 404 bodies are not guaranteed to be a DispatchReply.
        let reply = response.json::<DispatchReply>().await.unwrap_or_default();
        debug!(delivery_id, status, "Gateway dispatch reply");
        DispatchOutcome::from_reply(status, &reply).ok_or(DispatchError::UnexpectedStatus(status))
    }
}
