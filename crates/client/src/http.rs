//! [`StatusSource`] backed by the `generation-status` HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use vidgen_core::snapshot::StatusSnapshot;
use vidgen_core::types::DbId;

use crate::poll::{PollError, StatusSource};

/// Envelope the API wraps every successful payload in.
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpStatusSource {
    client: reqwest::Client,
    api_url: String,
}

impl HttpStatusSource {
    /// * `api_url` - Base URL of the API, e.g. `http://localhost:3000`.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling across sources).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, id: DbId) -> Result<StatusSnapshot, PollError> {
        let response = self
            .client
            .get(format!("{}/api/v1/generation-status/{id}", self.api_url))
            .send()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;
        interpret(id, status, &body)
    }
}

fn interpret(id: DbId, status: u16, body: &str) -> Result<StatusSnapshot, PollError> {
    match status {
        200..=299 => serde_json::from_str::<DataResponse<StatusSnapshot>>(body)
            .map(|r| r.data)
            .map_err(|e| PollError::Transient(format!("unreadable status body: {e}"))),
        404 => Err(PollError::NotFound(id)),
        408 | 429 | 500..=599 => Err(PollError::Transient(format!("HTTP {status}"))),
        _ => {
            let message = serde_json::from_str::<ErrorBody>(body)
                .map(|b| b.error)
                .unwrap_or_else(|_| body.to_string());
            Err(PollError::Rejected { status, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use vidgen_core::steps::GenerationStatus;

    use super::*;

    const SNAPSHOT: &str = r#"{"data":{
        "generation_id": 9,
        "status": "generating_video",
        "steps": [],
        "progress": {"completed_steps": 2, "failed_steps": 0, "total_steps": 5,
                     "percentage": 45, "current_step": "video_generation",
                     "next_step": "audio_video_merge"},
        "can_resume": false,
        "retry_count": 0,
        "video_url": null,
        "lipsync_failed": false,
        "failed_at_step": null,
        "error_message": null,
        "error_hint": null,
        "poll_interval_ms": 10000,
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:05:00Z"
    }}"#;

    #[test]
    fn parses_wrapped_snapshot() {
        let snap = interpret(9, 200, SNAPSHOT).unwrap();
        assert_eq!(snap.status, GenerationStatus::GeneratingVideo);
        assert_eq!(snap.progress.percentage, 45);
        assert_eq!(snap.poll_interval_ms, 10_000);
    }

    #[test]
    fn maps_error_statuses() {
        assert_matches!(interpret(9, 404, ""), Err(PollError::NotFound(9)));
        assert_matches!(interpret(9, 503, ""), Err(PollError::Transient(_)));
        assert_matches!(interpret(9, 429, ""), Err(PollError::Transient(_)));
        assert_matches!(
            interpret(9, 400, r#"{"error":"bad id","code":"VALIDATION_ERROR"}"#),
            Err(PollError::Rejected { status: 400, ref message }) if message == "bad id"
        );
    }
}
