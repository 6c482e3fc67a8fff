//! [`ProviderInvoker`] over the provider gateway's HTTP API.
//!
//! Every backend (TTS, image, video, merge, lip-sync) sits behind one
//! gateway; this client only knows the envelope:
//!
//! ```text
//! POST {base}/v1/providers/{provider_id}/invoke   <payload JSON>
//! 200 {"success": true,  "output_ref": "..."}
//! 4xx/5xx or {"success": false, "error": {"code": "...", "message": "..."}}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use vidgen_core::failure::ProviderError;

use crate::provider::ProviderInvoker;

/// Errors building the HTTP invoker.
#[derive(Debug, thiserror::Error)]
pub enum ProviderInvokeError {
    #[error("HTTP client could not be built: {0}")]
    Client(#[from] reqwest::Error),
}

/// Response envelope returned by the provider gateway.
#[derive(Debug, Deserialize)]
struct InvokeResponse {
    success: bool,
    output_ref: Option<String>,
    error: Option<InvokeErrorBody>,
}

#[derive(Debug, Deserialize)]
struct InvokeErrorBody {
    code: Option<String>,
    message: Option<String>,
}

pub struct HttpProviderInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProviderInvoker {
    /// * `base_url` - Gateway URL, e.g. `http://providers:8090`.
    /// * `timeout` - Transport timeout of one call.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderInvokeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProviderInvoker for HttpProviderInvoker {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/providers/{provider_id}/invoke", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(transport_error)?;
        interpret(status, &body)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    let error = ProviderError::new(err.to_string());
    if err.is_timeout() {
        error.with_code("timeout")
    } else if err.is_connect() || err.is_request() {
        error.with_code("network")
    } else {
        error
    }
}

/// Map a gateway response to an output ref or a classifiable error.
fn interpret(status: u16, body: &str) -> Result<String, ProviderError> {
    let parsed: Option<InvokeResponse> = serde_json::from_str(body).ok();

    if (200..300).contains(&status) {
        return match parsed {
            Some(InvokeResponse {
                success: true,
                output_ref: Some(output_ref),
                ..
            }) => Ok(output_ref),
            Some(InvokeResponse {
                error: Some(error), ..
            }) => Err(envelope_error(error, None)),
            _ => Err(ProviderError::new(format!("malformed provider response: {body}"))),
        };
    }

    match parsed.and_then(|r| r.error) {
        Some(error) => Err(envelope_error(error, Some(status))),
        None => Err(ProviderError::new(truncate(body)).with_status(status)),
    }
}

fn envelope_error(body: InvokeErrorBody, status: Option<u16>) -> ProviderError {
    let mut error = ProviderError::new(body.message.unwrap_or_else(|| "provider error".into()));
    error.code = body.code;
    error.status = status;
    error
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
