//! HTTP client for the provider bridge.
//!
//! All outbound provider traffic goes through this client: message sends,
//! template submission/status lookups, and observer notifications. The
//! bridge wraps the upstream messaging provider behind a small local HTTP
//! API and pushes delivery callbacks to our webhook ingress.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    Notifier, ProviderError, ReviewStatus, SendError, Sender, TemplateDefinition, TemplateProvider,
    TemplateReview,
};
use crate::message::Channel;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Provider error codes treated as permanent send failures.
///
/// Anything not on this allow-list is retried; the core does not interpret
/// provider codes any further.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "invalid_destination",
    "recipient_blocked",
    "unsupported_channel",
    "template_rejected",
];

/// Client for the provider bridge HTTP API.
pub struct ProviderBridge {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ProviderBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBridge")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish_non_exhaustive()
    }
}

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<BridgeError>,
}

/// Structured error detail from the bridge.
#[derive(Deserialize)]
struct BridgeError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    channel: &'a str,
    destination: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct SendTemplateRequest<'a> {
    channel: &'a str,
    destination: &'a str,
    content_ref: &'a str,
    params: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct SendResponse {
    provider_id: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    external_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentRefResponse {
    content_ref: Option<String>,
}

impl ProviderBridge {
    /// Create a new client pointing at the given base URL, with an optional
    /// bearer token.
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url,
            token,
        }
    }

    /// Returns the base URL of the bridge.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let req = self.client.request(method, &url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post_send<B: Serialize>(&self, path: &str, body: &B) -> Result<String, SendError> {
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = resp.status();
        let envelope: BridgeResponse<SendResponse> = resp
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("malformed bridge response: {e}")))?;

        if let Some(data) = envelope.data {
            debug!(provider_id = %data.provider_id, "message accepted by provider");
            return Ok(data.provider_id);
        }

        let (code, message) = match envelope.error {
            Some(err) => (
                err.code.unwrap_or_default(),
                err.message.unwrap_or_else(|| format!("HTTP {status}")),
            ),
            None => (String::new(), format!("HTTP {status}")),
        };

        if PERMANENT_ERROR_CODES.contains(&code.as_str()) {
            Err(SendError::Permanent { code, message })
        } else {
            Err(SendError::Transient(format!("[{code}] {message}")))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProviderError> {
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        let status = resp.status();
        let envelope: BridgeResponse<T> = resp.json().await?;
        envelope.data.ok_or_else(|| {
            ProviderError::Rejected(match envelope.error {
                Some(err) => err.message.unwrap_or_else(|| format!("HTTP {status}")),
                None => format!("HTTP {status}"),
            })
        })
    }
}

#[async_trait]
impl Sender for ProviderBridge {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        body: &str,
    ) -> Result<String, SendError> {
        self.post_send(
            "/v1/send",
            &SendRequest {
                channel: channel.as_str(),
                destination,
                body,
            },
        )
        .await
    }

    async fn send_template(
        &self,
        channel: Channel,
        destination: &str,
        content_ref: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, SendError> {
        self.post_send(
            "/v1/send-template",
            &SendTemplateRequest {
                channel: channel.as_str(),
                destination,
                content_ref,
                params,
            },
        )
        .await
    }
}

#[async_trait]
impl TemplateProvider for ProviderBridge {
    async fn submit(&self, definition: &TemplateDefinition) -> Result<String, ProviderError> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/templates")
            .json(definition)
            .send()
            .await?;
        let status = resp.status();
        let envelope: BridgeResponse<SubmitResponse> = resp.json().await?;
        match envelope.data {
            Some(data) => {
                debug!(external_id = %data.external_id, name = %definition.name, "template submitted");
                Ok(data.external_id)
            }
            None => Err(ProviderError::Rejected(match envelope.error {
                Some(err) => err.message.unwrap_or_else(|| format!("HTTP {status}")),
                None => format!("HTTP {status}"),
            })),
        }
    }

    async fn status(&self, external_id: &str) -> Result<TemplateReview, ProviderError> {
        let resp: StatusResponse = self
            .get_json(&format!("/v1/templates/{external_id}/status"))
            .await?;
        Ok(TemplateReview {
            status: ReviewStatus::parse(&resp.status)?,
            reason: resp.reason,
        })
    }

    async fn content_reference(&self, external_id: &str) -> Result<Option<String>, ProviderError> {
        let resp: ContentRefResponse = self
            .get_json(&format!("/v1/templates/{external_id}/content"))
            .await?;
        Ok(resp.content_ref)
    }
}

#[async_trait]
impl Notifier for ProviderBridge {
    /// Fire-and-forget push to the bridge's notification fan-out. Errors
    /// are logged and swallowed; observers must never affect delivery.
    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        let body = serde_json::json!({ "topic": topic, "payload": payload });
        if let Err(e) = self
            .request(reqwest::Method::POST, "/v1/notify")
            .json(&body)
            .send()
            .await
        {
            warn!(topic, error = %e, "notifier publish failed");
        }
    }
}
