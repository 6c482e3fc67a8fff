//! Failure taxonomy for provider calls and stages.
//!
//! Every provider failure is classified once, at the point where it is
//! observed, into an [`ErrorKind`]. Fallback decisions, `can_resume` and the
//! user-facing text are all driven by the kind; the raw provider text is
//! only ever carried along as `detail`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Structured classification of a failed generation attempt.
    ErrorKind {
        /// The provider throttled the request.
        RateLimited = "rate_limited",
        /// The call or the stage exceeded its time budget.
        Timeout = "timeout",
        /// Connection reset, DNS failure and similar transport problems.
        Network = "network",
        /// The provider reported a temporary outage (5xx).
        ProviderUnavailable = "provider_unavailable",
        /// Credentials or endpoint configuration are wrong for this provider.
        ProviderMisconfigured = "provider_misconfigured",
        /// The prompt or payload was rejected as malformed.
        InvalidInput = "invalid_input",
        /// The content was rejected by the provider's policy filter.
        PolicyRejected = "policy_rejected",
        /// Unrecognised provider error.
        Unknown = "unknown",
    }
}

/// Whether a failure is worth retrying with another candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::InvalidInput | ErrorKind::PolicyRejected => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short human-readable description of the failure.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "The AI provider is rate limiting requests",
            ErrorKind::Timeout => "Generation took longer than the allowed time",
            ErrorKind::Network => "Could not reach the AI provider",
            ErrorKind::ProviderUnavailable => "The AI provider is temporarily unavailable",
            ErrorKind::ProviderMisconfigured => "The AI provider is not configured correctly",
            ErrorKind::InvalidInput => "The provider rejected the generation prompt as invalid",
            ErrorKind::PolicyRejected => "The content was rejected by the provider's content policy",
            ErrorKind::Unknown => "The AI provider returned an unexpected error",
        }
    }

    /// Actionable next step for the user, when there is one.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorKind::RateLimited | ErrorKind::ProviderUnavailable | ErrorKind::Network => {
                Some("Wait a few minutes, then resume the generation.")
            }
            ErrorKind::Timeout => Some("Resume the generation to retry the unfinished items."),
            ErrorKind::ProviderMisconfigured => Some(
                "Check the provider API key and endpoint settings, then resume the generation.",
            ),
            ErrorKind::InvalidInput | ErrorKind::PolicyRejected => {
                Some("Edit the affected scene descriptions before regenerating.")
            }
            ErrorKind::Unknown => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw provider errors and classification
// ---------------------------------------------------------------------------

/// Error as reported by a provider invocation, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    /// HTTP status returned by the provider, when the call reached it.
    pub status: Option<u16>,
    /// Machine-readable error code, when the provider supplies one.
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Classify a provider error. Error codes win over HTTP statuses because
/// providers often reuse 400 for both malformed input and policy refusals.
pub fn classify(error: &ProviderError) -> ErrorKind {
    if let Some(kind) = error.code.as_deref().and_then(classify_code) {
        return kind;
    }
    match error.status {
        Some(429) => ErrorKind::RateLimited,
        Some(408) | Some(504) => ErrorKind::Timeout,
        Some(401) | Some(403) | Some(404) => ErrorKind::ProviderMisconfigured,
        Some(400) | Some(413) | Some(422) => ErrorKind::InvalidInput,
        Some(451) => ErrorKind::PolicyRejected,
        Some(status) if status >= 500 => ErrorKind::ProviderUnavailable,
        _ => ErrorKind::Unknown,
    }
}

fn classify_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "rate_limited" | "rate_limit_exceeded" | "too_many_requests" => ErrorKind::RateLimited,
        "timeout" | "deadline_exceeded" => ErrorKind::Timeout,
        "network" | "connection_error" => ErrorKind::Network,
        "unavailable" | "overloaded" | "server_error" => ErrorKind::ProviderUnavailable,
        "unauthorized" | "invalid_api_key" | "misconfigured" | "model_not_found" => {
            ErrorKind::ProviderMisconfigured
        }
        "invalid_input" | "invalid_prompt" | "validation_error" => ErrorKind::InvalidInput,
        "content_policy" | "content_policy_violation" | "safety" => ErrorKind::PolicyRejected,
        _ => return None,
    };
    Some(kind)
}

// ---------------------------------------------------------------------------
// Unit failures
// ---------------------------------------------------------------------------

/// Terminal failure of one generation unit after the waterfall gave up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: ErrorKind,
    /// Raw provider text, kept for debugging and never shown as the headline.
    pub detail: String,
    /// Provider that produced the last failure, if any was attempted.
    pub provider: Option<String>,
}

impl UnitFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// The dominant error class across a stage's failed units.
///
/// Transient wins ties so a stage with mixed failures stays resumable.
/// Returns `None` when there are no failures.
pub fn dominant_class<I>(kinds: I) -> Option<ErrorClass>
where
    I: IntoIterator<Item = ErrorKind>,
{
    let (mut transient, mut fatal) = (0usize, 0usize);
    for kind in kinds {
        match kind.class() {
            ErrorClass::Transient => transient += 1,
            ErrorClass::Fatal => fatal += 1,
        }
    }
    match (transient, fatal) {
        (0, 0) => None,
        (t, f) if t >= f => Some(ErrorClass::Transient),
        _ => Some(ErrorClass::Fatal),
    }
}

/// Compose the user-facing stage error message from its failure kind.
pub fn stage_error_message(stage_label: &str, kind: ErrorKind) -> String {
    format!("{stage_label} failed: {}", kind.user_message())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Classes --

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::PolicyRejected.is_retryable());
    }

    #[test]
    fn transient_kinds_are_retryable() {
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::ProviderUnavailable,
            ErrorKind::ProviderMisconfigured,
            ErrorKind::Unknown,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
    }

    // -- Classification --

    #[test]
    fn classify_by_status() {
        assert_eq!(classify(&ProviderError::new("x").with_status(429)), ErrorKind::RateLimited);
        assert_eq!(classify(&ProviderError::new("x").with_status(504)), ErrorKind::Timeout);
        assert_eq!(
            classify(&ProviderError::new("x").with_status(503)),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            classify(&ProviderError::new("x").with_status(401)),
            ErrorKind::ProviderMisconfigured
        );
        assert_eq!(classify(&ProviderError::new("x").with_status(422)), ErrorKind::InvalidInput);
        assert_eq!(classify(&ProviderError::new("x").with_status(451)), ErrorKind::PolicyRejected);
    }

    #[test]
    fn code_takes_precedence_over_status() {
        let err = ProviderError::new("flagged")
            .with_status(400)
            .with_code("content_policy_violation");
        assert_eq!(classify(&err), ErrorKind::PolicyRejected);
    }

    #[test]
    fn unknown_code_falls_back_to_status() {
        let err = ProviderError::new("x").with_status(429).with_code("quota");
        assert_eq!(classify(&err), ErrorKind::RateLimited);
    }

    #[test]
    fn message_text_is_never_inspected() {
        let err = ProviderError::new("rate limit exceeded, content policy, timeout");
        assert_eq!(classify(&err), ErrorKind::Unknown);
    }

    // -- Dominant class --

    #[test]
    fn dominant_class_empty_is_none() {
        assert_eq!(dominant_class(Vec::new()), None);
    }

    #[test]
    fn dominant_class_majority_fatal() {
        let kinds = [ErrorKind::InvalidInput, ErrorKind::PolicyRejected, ErrorKind::Timeout];
        assert_eq!(dominant_class(kinds), Some(ErrorClass::Fatal));
    }

    #[test]
    fn dominant_class_tie_is_transient() {
        let kinds = [ErrorKind::InvalidInput, ErrorKind::Timeout];
        assert_eq!(dominant_class(kinds), Some(ErrorClass::Transient));
    }

    // -- Messages --

    #[test]
    fn misconfiguration_carries_actionable_hint() {
        let hint = ErrorKind::ProviderMisconfigured.hint().unwrap();
        assert!(hint.contains("API key"));
    }

    #[test]
    fn stage_message_uses_kind_text() {
        assert_eq!(
            stage_error_message("Audio generation", ErrorKind::Timeout),
            "Audio generation failed: Generation took longer than the allowed time"
        );
    }
}
