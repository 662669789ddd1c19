use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use motormart_types::models::Notification;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("push provider response carried no message id")]
    MissingId,
}

/// Out-of-band delivery to a device, used when the recipient has no live connection.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Returns the provider's message id.
    async fn send_to_token(&self, token: &str, payload: &Notification) -> Result<String, PushError>;
}

/// Used when no push provider is configured: records the attempt in the log only.
#[derive(Debug, Default)]
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn send_to_token(&self, token: &str, payload: &Notification) -> Result<String, PushError> {
        let prefix: String = token.chars().take(8).collect();
        info!("push (not configured) to {}…: {}", prefix, payload.body);
        Ok(format!("log-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    notification: &'a Notification,
}

#[derive(Deserialize)]
struct PushResponse {
    #[serde(alias = "name")]
    message_id: Option<String>,
}

/// Posts `{to, notification}` to an HTTP push relay (FCM-style) and reads the
/// returned `message_id` (or `name`).
#[derive(Debug, Clone)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushGateway {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_to_token(&self, token: &str, payload: &Notification) -> Result<String, PushError> {
        let mut req = self.client.post(&self.endpoint).json(&PushRequest {
            to: token,
            notification: payload,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: PushResponse = resp.json().await?;
        parsed.message_id.ok_or(PushError::MissingId)
    }
}
