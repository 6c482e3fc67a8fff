//! Provider invocation contract and candidate selection.

use std::collections::HashMap;

use async_trait::async_trait;
use vidgen_core::failure::ProviderError;
use vidgen_core::providers::{resolve_candidates, Capability, QualityTier};

/// Invocation contract every generation backend is reached through.
///
/// Returns the provider's output reference on success. Errors carry the raw
/// HTTP status and error code so the executor can classify them.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError>;
}

/// Resolves the ordered waterfall of candidates for a capability and tier.
///
/// Defaults to the static table in `vidgen_core::providers`; deployments can
/// replace individual entries, for example to take a provider out of rotation.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    overrides: HashMap<(Capability, QualityTier), Vec<String>>,
}

impl ProviderSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the candidate list for one capability and tier.
    pub fn with_candidates<I, S>(mut self, capability: Capability, tier: QualityTier, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides
            .insert((capability, tier), ids.into_iter().map(Into::into).collect());
        self
    }

    /// Candidates in the order they must be tried: primary first.
    pub fn candidates(&self, capability: Capability, tier: QualityTier) -> Vec<String> {
        match self.overrides.get(&(capability, tier)) {
            Some(ids) => ids.clone(),
            None => resolve_candidates(capability, tier)
                .iter()
                .map(|id| id.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_static_table() {
        let selector = ProviderSelector::new();
        assert_eq!(
            selector.candidates(Capability::Image, QualityTier::Premium),
            vec!["flux-pro", "dall-e-3", "sdxl"]
        );
    }

    #[test]
    fn override_replaces_only_its_entry() {
        let selector =
            ProviderSelector::new().with_candidates(Capability::Video, QualityTier::Free, ["local"]);
        assert_eq!(selector.candidates(Capability::Video, QualityTier::Free), vec!["local"]);
        assert_eq!(
            selector.candidates(Capability::Video, QualityTier::Standard)[0],
            "kling-standard"
        );
    }
}
