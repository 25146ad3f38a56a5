//! Outbound WhatsApp messages through a WaSender-style HTTP API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("provider rate limit reached (429 Too Many Requests)")]
    RateLimited,

    #[error("provider answered {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends `text` to the phone number `to`, returning the provider's reply.
    async fn send(&self, to: &str, text: &str) -> Result<Value, NotifyError>;
}

pub struct WaSenderClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl WaSenderClient {
    pub fn new(base: &str, token: &str) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(25)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/send-message", base.trim_end_matches('/')),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl Messenger for WaSenderClient {
    async fn send(&self, to: &str, text: &str) -> Result<Value, NotifyError> {
        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "to": to, "text": text }))
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(NotifyError::RateLimited);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(NotifyError::Provider { status: status.as_u16(), body });
        }

        // Some provider replies are plain text
        let body = res.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records sent messages; optionally rate-limits after `limit` sends.
    #[derive(Default)]
    pub struct RecordingMessenger {
        pub sent: Mutex<Vec<(String, String)>>,
        pub limit: Option<usize>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, to: &str, text: &str) -> Result<Value, NotifyError> {
            let mut sent = self.sent.lock().unwrap();
            if self.limit.is_some_and(|limit| sent.len() >= limit) {
                return Err(NotifyError::RateLimited);
            }
            sent.push((to.to_string(), text.to_string()));
            Ok(json!({ "success": true }))
        }
    }
}
