//! HTTP implementation of the chat transport

use async_trait::async_trait;
use particle_core::config::ApiConfig;
use particle_core::utils::truncate;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::base::{
    ChatReply, ChatRequest, ChatTransport, TransportError, TransportResult, GENERIC_FAILURE,
};

/// Payload keys that mark a reply as failed
const ERROR_FIELD: &str = "error";
const INTERNAL_ERROR_FIELD: &str = "internal server error";

/// JSON-over-HTTP client for the chat route
pub struct HttpTransport {
    client: Client,
    chat_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the configured endpoint
    pub fn new(api: &ApiConfig) -> TransportResult<Self> {
        Self::with_settings(api.chat_url(), api.timeout())
    }

    /// Create a transport for an explicit chat URL and timeout
    pub fn with_settings(chat_url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder()
            .http1_only()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            chat_url: chat_url.into(),
            timeout,
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn map_request_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                timeout_ms: self.timeout.as_millis(),
            }
        } else {
            TransportError::Http(err)
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: ChatRequest) -> TransportResult<ChatReply> {
        debug!(
            url = %self.chat_url,
            session_id = ?request.session_id,
            "Sending chat request"
        );

        let response = self
            .client
            .post(&self.chat_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let result = interpret_response(status, &body);
        match &result {
            Ok(reply) => debug!(
                status = status.as_u16(),
                session_id = ?reply.session_id,
                sources = reply.source_doc.len(),
                "Chat request succeeded"
            ),
            Err(e) => warn!(status = status.as_u16(), "Chat request failed: {}", e),
        }
        result
    }
}

/// Turn a status and raw body into a reply or a normalized failure.
///
/// An error-shaped payload wins over the status code so the service's own
/// message reaches the user.
fn interpret_response(status: StatusCode, body: &str) -> TransportResult<ChatReply> {
    let value = serde_json::from_str::<Value>(body).ok();

    if let Some(message) = value.as_ref().and_then(error_message) {
        return Err(TransportError::Api(message));
    }
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let value = value.ok_or_else(|| {
        TransportError::InvalidResponse(format!("body is not JSON: {}", truncate(body, 120)))
    })?;
    serde_json::from_value(value).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

/// Message carried by an error-shaped payload, `None` for any other body
fn error_message(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    if !obj.contains_key(ERROR_FIELD) && !obj.contains_key(INTERNAL_ERROR_FIELD) {
        return None;
    }

    let message = [ERROR_FIELD, INTERNAL_ERROR_FIELD]
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .find(|m| !m.is_empty())
        .unwrap_or(GENERIC_FAILURE);
    Some(message.to_string())
}
