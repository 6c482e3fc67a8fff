//! Provider capabilities, quality tiers and the waterfall candidate table.
//!
//! The candidate table is static configuration: for each capability and
//! tier it lists providers in the order the unit executor must try them
//! (primary, secondary, fallback). Higher tiers lead with higher-fidelity
//! providers.

use serde::Serialize;

use crate::steps::StepName;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Kind of generation a provider performs.
    Capability {
        Text = "text",
        Image = "image",
        Video = "video",
        Audio = "audio",
        Merge = "merge",
        LipSync = "lip_sync",
    }
}

impl Capability {
    /// Capability a pipeline stage draws its providers from.
    pub fn for_step(step: StepName) -> Self {
        match step {
            StepName::AudioGeneration => Capability::Audio,
            StepName::ImageGeneration => Capability::Image,
            StepName::VideoGeneration => Capability::Video,
            StepName::AudioVideoMerge => Capability::Merge,
            StepName::LipSync => Capability::LipSync,
        }
    }
}

// ---------------------------------------------------------------------------
// Quality tiers
// ---------------------------------------------------------------------------

define_str_enum! {
    /// Subscription-level quality tier.
    QualityTier {
        Free = "free",
        Standard = "standard",
        Premium = "premium",
    }
}

/// Output constraints a tier imposes on generated media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierPolicy {
    pub width: u32,
    pub height: u32,
    /// Longest clip a single video unit may request, in seconds.
    pub max_clip_duration_secs: u32,
    pub watermark: bool,
    pub lip_sync_allowed: bool,
}

impl QualityTier {
    pub fn policy(self) -> TierPolicy {
        match self {
            QualityTier::Free => TierPolicy {
                width: 854,
                height: 480,
                max_clip_duration_secs: 5,
                watermark: true,
                lip_sync_allowed: false,
            },
            QualityTier::Standard => TierPolicy {
                width: 1280,
                height: 720,
                max_clip_duration_secs: 10,
                watermark: false,
                lip_sync_allowed: true,
            },
            QualityTier::Premium => TierPolicy {
                width: 1920,
                height: 1080,
                max_clip_duration_secs: 20,
                watermark: false,
                lip_sync_allowed: true,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate table
// ---------------------------------------------------------------------------

/// Ordered provider candidates for a capability at a tier.
pub fn resolve_candidates(capability: Capability, tier: QualityTier) -> &'static [&'static str] {
    use Capability as C;
    use QualityTier as T;

    match (capability, tier) {
        (C::Text, T::Premium) => &["gpt-4o", "claude-sonnet", "gemini-pro"],
        (C::Text, _) => &["gpt-4o-mini", "claude-haiku", "gemini-flash"],

        (C::Image, T::Premium) => &["flux-pro", "dall-e-3", "sdxl"],
        (C::Image, T::Standard) => &["flux-dev", "sdxl", "dall-e-3"],
        (C::Image, T::Free) => &["sdxl", "flux-schnell", "sd-1.5"],

        (C::Video, T::Premium) => &["runway-gen3", "kling-pro", "luma-dream"],
        (C::Video, T::Standard) => &["kling-standard", "luma-dream", "stable-video"],
        (C::Video, T::Free) => &["stable-video", "animatediff", "kling-standard"],

        (C::Audio, T::Premium) => &["elevenlabs-multilingual", "openai-tts-hd", "google-tts"],
        (C::Audio, _) => &["openai-tts", "google-tts", "elevenlabs-turbo"],

        (C::Merge, _) => &["ffmpeg-gpu", "ffmpeg-cpu"],

        (C::LipSync, T::Premium) => &["sync-labs", "hedra", "wav2lip"],
        (C::LipSync, _) => &["wav2lip", "sadtalker", "sync-labs"],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_capability_and_tier_has_candidates() {
        for capability in Capability::ALL {
            for tier in QualityTier::ALL {
                let candidates = resolve_candidates(*capability, *tier);
                assert!(!candidates.is_empty(), "{capability}/{tier} has no candidates");
                assert!(candidates.len() <= 3);
            }
        }
    }

    #[test]
    fn premium_image_leads_with_high_fidelity_provider() {
        assert_eq!(resolve_candidates(Capability::Image, QualityTier::Premium)[0], "flux-pro");
        assert_eq!(resolve_candidates(Capability::Image, QualityTier::Free)[0], "sdxl");
    }

    #[test]
    fn candidates_have_no_duplicates() {
        for capability in Capability::ALL {
            for tier in QualityTier::ALL {
                let candidates = resolve_candidates(*capability, *tier);
                let mut seen = std::collections::HashSet::new();
                assert!(candidates.iter().all(|c| seen.insert(*c)));
            }
        }
    }

    #[test]
    fn each_step_maps_to_a_capability() {
        assert_eq!(Capability::for_step(StepName::AudioGeneration), Capability::Audio);
        assert_eq!(Capability::for_step(StepName::LipSync), Capability::LipSync);
    }

    #[test]
    fn free_tier_is_watermarked_without_lip_sync() {
        let policy = QualityTier::Free.policy();
        assert!(policy.watermark);
        assert!(!policy.lip_sync_allowed);
        assert_eq!(policy.height, 480);
    }

    #[test]
    fn tier_parse_rejects_unknown() {
        assert!(QualityTier::parse("enterprise").is_err());
        assert_eq!(QualityTier::parse("premium").unwrap(), QualityTier::Premium);
    }
}
