//! HTTP transport to the outbound mail provider.
//!
//! Speaks the provider's JSON send API over a pooled reqwest client and
//! maps its responses onto [`SendError`] so classification never has to
//! look at HTTP details. The provider's record-level error shape (an
//! `errors` array of objects with a `message` field) is parsed here and
//! nowhere else.

use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{Result, SendError},
    sender::{MailTransport, OutboundMessage, ProviderReceipt},
};

/// Response body kept for diagnostics, at most this many bytes.
const MAX_BODY_CAPTURE: usize = 1024;

/// Configuration for the provider HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Send endpoint URL.
    pub api_url: String,
    /// Bearer token for the provider account.
    pub api_key: String,
    /// Sender address stamped on every message.
    pub from_address: String,
    /// Default From display name when the job carries none.
    pub default_from_name: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.mail.example/v1/send".to_string(),
            api_key: String::new(),
            from_address: "no-reply@example.com".to_string(),
            default_from_name: "Postroom".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Success payload from the provider.
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Error payload from the provider.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// [`MailTransport`] over the provider's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpMailTransport {
    /// Builds the transport and its pooled HTTP client.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("postroom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SendError::invalid_message(format!("cannot build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let from_name =
            message.from_name.as_deref().unwrap_or(&self.config.default_from_name);

        let mut object = serde_json::Map::new();
        object.insert(
            "from".into(),
            json!({ "email": self.config.from_address, "name": from_name }),
        );
        object.insert("to".into(), json!(message.to));
        object.insert("subject".into(), json!(message.subject));

        if !message.cc.is_empty() {
            object.insert("cc".into(), json!(message.cc));
        }
        if !message.bcc.is_empty() {
            object.insert("bcc".into(), json!(message.bcc));
        }
        if let Some(text) = &message.text {
            object.insert("text".into(), json!(text));
        }
        if let Some(html) = &message.html {
            object.insert("html".into(), json!(html));
        }
        if let Some(reply_to) = &message.reply_to {
            object.insert("reply_to".into(), json!(reply_to));
        }
        if let Some(hint) = &message.message_id_hint {
            object.insert("message_id_hint".into(), json!(hint));
        }
        if !message.metadata.is_empty() {
            object.insert("metadata".into(), json!(message.metadata));
        }
        serde_json::Value::Object(object)
    }

    async fn send_once(&self, message: &OutboundMessage) -> Result<ProviderReceipt> {
        let payload = self.build_payload(message);

        let response = match self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    return Err(SendError::timeout(self.config.timeout.as_secs()));
                }
                if e.is_connect() {
                    return Err(SendError::network(format!("connection failed: {e}")));
                }
                return Err(SendError::network(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            let receipt: SendResponse = response.json().await.unwrap_or(SendResponse {
                message_id: None,
            });
            let provider_message_id = receipt
                .message_id
                .or_else(|| message.message_id_hint.clone())
                .unwrap_or_default();
            debug!(status, %provider_message_id, "provider accepted message");
            return Ok(ProviderReceipt { provider_message_id });
        }

        let body = response.text().await.unwrap_or_default();
        let reasons = parse_reasons(&body);
        let captured: String = body.chars().take(MAX_BODY_CAPTURE).collect();

        warn!(status, reasons = ?reasons, "provider rejected message");
        Err(SendError::provider(status, reasons, captured))
    }
}

impl MailTransport for HttpMailTransport {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReceipt>> + Send + '_>> {
        let message = message.clone();
        let span = info_span!(
            "provider_send",
            subject = %message.subject,
            recipients = message.to.len(),
        );
        Box::pin(async move { self.send_once(&message).await }.instrument(span))
    }
}

/// Extracts reason strings from a provider error body.
///
/// Tolerates non-JSON bodies; classification then falls back to the
/// HTTP status alone.
fn parse_reasons(body: &str) -> Vec<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|parsed| {
            parsed
                .errors
                .into_iter()
                .map(|detail| detail.message)
                .filter(|message| !message.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
