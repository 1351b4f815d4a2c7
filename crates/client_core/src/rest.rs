use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response};
use shared::{
    domain::{CurrentUser, MessageStatus, PeerRef},
    error::ApiException,
    protocol::{HistoryResponse, SendMessageRequest, SendMessageResponse, WireTimestamp},
};
use tracing::{info, warn};

use crate::{
    config::ClientSettings,
    credentials::CredentialProvider,
    error::{ChatError, ChatResult},
    history::normalize_history,
    reconciler::SendReceipt,
    types::Message,
};

/// Request/response side of the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// One-shot fetch of the conversation with `peer`, ascending by time.
    async fn fetch_history(&self, peer: &PeerRef) -> ChatResult<Vec<Message>>;
    /// Persists a message for `peer` and returns the server's record of it.
    async fn send_message(&self, peer: &PeerRef, text: &str) -> ChatResult<SendReceipt>;
}

pub struct HttpChatApi {
    http: Client,
    settings: ClientSettings,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpChatApi {
    pub fn new(settings: ClientSettings, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: Client::new(),
            settings,
            credentials,
        }
    }

    /// Session bootstrap: identity behind the current credential.
    pub async fn current_user(&self) -> ChatResult<CurrentUser> {
        let token = self.credentials.credential().await?;
        let url = self.settings.endpoint(&self.settings.me_path)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|err| {
                ChatError::Transport(format!(
                    "failed to reach {}: {err}",
                    self.settings.me_path
                ))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatError::NoSession);
        }
        let response = ensure_success(response)
            .await
            .map_err(|err| ChatError::Transport(err.to_string()))?;
        response
            .json::<CurrentUser>()
            .await
            .map_err(|err| ChatError::Transport(format!("invalid current user body: {err}")))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, peer: &PeerRef) -> ChatResult<Vec<Message>> {
        let token = self.credentials.credential().await?;
        let url = self.settings.endpoint(&self.settings.history_path)?;
        let unavailable = |reason: String| ChatError::HistoryUnavailable { reason };

        let response = self
            .http
            .get(url)
            .query(&[("recipient", peer.username.as_str())])
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|err| unavailable(err.to_string()))?;
        let response = ensure_success(response)
            .await
            .map_err(|err| unavailable(err.reason))?;
        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|err| unavailable(format!("invalid history body: {err}")))?;

        let messages = normalize_history(body.messages, Utc::now());
        info!(
            peer = %peer.username,
            count = messages.len(),
            "history: fetched conversation"
        );
        Ok(messages)
    }

    async fn send_message(&self, peer: &PeerRef, text: &str) -> ChatResult<SendReceipt> {
        let token = self.credentials.credential().await?;
        let url = self.settings.endpoint(&self.settings.send_path)?;
        let failed = |reason: String| ChatError::SendFailed { reason };

        let response = self
            .http
            .post(url)
            .bearer_auth(token.as_str())
            .json(&SendMessageRequest {
                message: text.to_string(),
                recipient: peer.username.clone(),
            })
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?;
        let response = ensure_success(response)
            .await
            .map_err(|err| failed(err.reason))?;
        let body: SendMessageResponse = response
            .json()
            .await
            .map_err(|err| failed(format!("invalid send body: {err}")))?;

        let record = body
            .data
            .ok_or_else(|| failed("send response carried no message".to_string()))?;
        let id = record
            .record_id()
            .ok_or_else(|| failed("send response carried no message id".to_string()))?;
        let status = record
            .status
            .as_deref()
            .and_then(MessageStatus::parse)
            .unwrap_or_default();

        Ok(SendReceipt {
            id,
            timestamp: record.timestamp.as_ref().and_then(WireTimestamp::to_datetime),
            status,
        })
    }
}

/// Turns a non-success response into an exception carrying the server's
/// `{error}` reason when present.
async fn ensure_success(response: Response) -> Result<Response, ApiException> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();
    let body = response.text().await.unwrap_or_default();
    let err = ApiException::from_body(status.as_u16(), &body, &fallback);
    warn!(status = err.status, reason = %err.reason, "rest: request rejected");
    Err(err)
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
