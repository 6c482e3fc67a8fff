//! Generation Unit Executor: one unit through the provider waterfall.
//!
//! Candidates are tried strictly in order. A transient failure moves on to
//! the next attempt (same candidate while its per-candidate budget lasts,
//! then the next candidate); a fatal failure ends the unit immediately.
//! The total number of calls per unit is capped regardless of how many
//! candidates are configured.

use std::sync::Arc;
use std::time::Duration;

use vidgen_core::failure::{classify, ErrorClass, ErrorKind, ProviderError, UnitFailure};
use vidgen_core::providers::{Capability, QualityTier};
use vidgen_core::units::UnitKey;

use crate::config::PipelineConfig;
use crate::provider::{ProviderInvoker, ProviderSelector};

/// Result of running one unit through the waterfall.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded {
        provider: String,
        output_ref: String,
        attempts: u32,
    },
    Failed {
        failure: UnitFailure,
        attempts: u32,
    },
}

pub struct UnitExecutor {
    invoker: Arc<dyn ProviderInvoker>,
    selector: ProviderSelector,
    attempts_per_candidate: u32,
    max_attempts: u32,
    call_timeout: Duration,
}

impl UnitExecutor {
    pub fn new(
        invoker: Arc<dyn ProviderInvoker>,
        selector: ProviderSelector,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            invoker,
            selector,
            attempts_per_candidate: config.attempts_per_candidate.max(1),
            max_attempts: config.max_unit_attempts.max(1),
            call_timeout: config.provider_timeout,
        }
    }

    pub async fn execute(
        &self,
        key: &UnitKey,
        tier: QualityTier,
        payload: &serde_json::Value,
    ) -> UnitOutcome {
        let capability = Capability::for_step(key.step);
        let candidates = self.selector.candidates(capability, tier);
        if candidates.is_empty() {
            tracing::error!(unit = %key, %capability, %tier, "No provider candidates configured");
            return UnitOutcome::Failed {
                failure: UnitFailure::new(
                    ErrorKind::ProviderMisconfigured,
                    format!("no {capability} providers configured for tier {tier}"),
                ),
                attempts: 0,
            };
        }

        let mut attempts = 0u32;
        let mut last_failure: Option<UnitFailure> = None;

        'waterfall: for provider in &candidates {
            for _ in 0..self.attempts_per_candidate {
                if attempts >= self.max_attempts {
                    break 'waterfall;
                }
                attempts += 1;

                let error = match self.call(provider, payload).await {
                    Ok(output_ref) => {
                        tracing::debug!(unit = %key, provider = %provider, attempts, "Unit succeeded");
                        return UnitOutcome::Succeeded {
                            provider: provider.clone(),
                            output_ref,
                            attempts,
                        };
                    }
                    Err(error) => error,
                };

                let kind = classify(&error);
                let failure = UnitFailure::new(kind, error.message).with_provider(provider.as_str());

                if kind.class() == ErrorClass::Fatal {
                    tracing::warn!(
                        unit = %key,
                        provider = %provider,
                        error_kind = %kind,
                        detail = %failure.detail,
                        "Fatal provider error, stopping waterfall",
                    );
                    return UnitOutcome::Failed { failure, attempts };
                }

                tracing::warn!(
                    unit = %key,
                    provider = %provider,
                    error_kind = %kind,
                    attempt = attempts,
                    detail = %failure.detail,
                    "Transient provider error, falling back",
                );
                last_failure = Some(failure);
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            UnitFailure::new(ErrorKind::Unknown, "attempt budget exhausted before any call")
        });
        UnitOutcome::Failed { failure, attempts }
    }

    /// One provider call bounded by the per-call timeout.
    async fn call(
        &self,
        provider: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        match tokio::time::timeout(self.call_timeout, self.invoker.invoke(provider, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(format!(
                "no response within {}ms",
                self.call_timeout.as_millis()
            ))
            .with_code("timeout")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use vidgen_core::steps::StepName;
    use vidgen_core::units::UnitSubject;

    use super::*;

    /// Replies per provider id; unlisted providers succeed.
    struct Scripted {
        replies: HashMap<&'static str, ProviderError>,
        hang: Option<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: &[(&'static str, ProviderError)]) -> Self {
            Self {
                replies: replies.iter().cloned().collect(),
                hang: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderInvoker for Scripted {
        async fn invoke(
            &self,
            provider_id: &str,
            _payload: &serde_json::Value,
        ) -> Result<String, ProviderError> {
            self.calls.lock().unwrap().push(provider_id.to_string());
            if self.hang == Some(provider_id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            match self.replies.get(provider_id) {
                Some(err) => Err(err.clone()),
                None => Ok(format!("{provider_id}://out")),
            }
        }
    }

    fn executor(invoker: Arc<Scripted>, config: PipelineConfig) -> UnitExecutor {
        UnitExecutor::new(invoker, ProviderSelector::new(), &config)
    }

    fn image_key() -> UnitKey {
        UnitKey::new(StepName::ImageGeneration, UnitSubject::Scene(0))
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({ "prompt": "a lighthouse at dusk" })
    }

    // -- Waterfall --

    #[tokio::test]
    async fn primary_success_uses_one_attempt() {
        let invoker = Arc::new(Scripted::new(&[]));
        let outcome = executor(invoker.clone(), PipelineConfig::default())
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Succeeded { ref provider, attempts: 1, .. } if provider == "flux-dev");
        assert_eq!(invoker.calls(), vec!["flux-dev"]);
    }

    #[tokio::test]
    async fn transient_error_falls_back_to_next_candidate() {
        let invoker = Arc::new(Scripted::new(&[(
            "flux-dev",
            ProviderError::new("slow down").with_status(429),
        )]));
        let outcome = executor(invoker.clone(), PipelineConfig::default())
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Succeeded { ref provider, attempts: 2, .. } if provider == "sdxl");
        assert_eq!(invoker.calls(), vec!["flux-dev", "sdxl"]);
    }

    #[tokio::test]
    async fn fatal_error_stops_waterfall() {
        let invoker = Arc::new(Scripted::new(&[(
            "flux-dev",
            ProviderError::new("nsfw").with_code("content_policy"),
        )]));
        let outcome = executor(invoker.clone(), PipelineConfig::default())
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Failed { ref failure, attempts: 1 } => {
            assert_eq!(failure.kind, ErrorKind::PolicyRejected);
            assert_eq!(failure.provider.as_deref(), Some("flux-dev"));
            assert_eq!(failure.detail, "nsfw");
        });
        assert_eq!(invoker.calls(), vec!["flux-dev"]);
    }

    #[tokio::test]
    async fn exhausted_candidates_report_last_failure() {
        let invoker = Arc::new(Scripted::new(&[
            ("flux-dev", ProviderError::new("down").with_status(503)),
            ("sdxl", ProviderError::new("down").with_status(503)),
            ("dall-e-3", ProviderError::new("throttled").with_status(429)),
        ]));
        let outcome = executor(invoker.clone(), PipelineConfig::default())
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Failed { ref failure, attempts: 3 } => {
            assert_eq!(failure.kind, ErrorKind::RateLimited);
            assert_eq!(failure.provider.as_deref(), Some("dall-e-3"));
        });
    }

    #[tokio::test]
    async fn attempt_budget_caps_calls() {
        let invoker = Arc::new(Scripted::new(&[
            ("flux-dev", ProviderError::new("down").with_status(503)),
            ("sdxl", ProviderError::new("down").with_status(503)),
        ]));
        let config = PipelineConfig {
            attempts_per_candidate: 2,
            max_unit_attempts: 3,
            ..Default::default()
        };
        let outcome = executor(invoker.clone(), config)
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Failed { attempts: 3, .. });
        assert_eq!(invoker.calls(), vec!["flux-dev", "flux-dev", "sdxl"]);
    }

    #[tokio::test]
    async fn missing_candidates_is_misconfiguration() {
        let invoker = Arc::new(Scripted::new(&[]));
        let selector = ProviderSelector::new().with_candidates(
            Capability::Image,
            QualityTier::Standard,
            Vec::<String>::new(),
        );
        let outcome = UnitExecutor::new(invoker.clone(), selector, &PipelineConfig::default())
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Failed { ref failure, attempts: 0 } => {
            assert_eq!(failure.kind, ErrorKind::ProviderMisconfigured);
        });
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn slow_call_times_out_and_falls_back() {
        let mut scripted = Scripted::new(&[]);
        scripted.hang = Some("flux-dev");
        let invoker = Arc::new(scripted);
        let config = PipelineConfig {
            provider_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let outcome = executor(invoker.clone(), config)
            .execute(&image_key(), QualityTier::Standard, &payload())
            .await;

        assert_matches!(outcome, UnitOutcome::Succeeded { ref provider, attempts: 2, .. } if provider == "sdxl");
    }
}
