use std::str::FromStr;
use std::time::Duration;

use vidgen_core::steps::StepName;
use vidgen_core::units::DEFAULT_MIN_SUCCESS_RATE;

/// Pipeline tuning loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Units of one stage processed concurrently (default: `4`).
    pub unit_concurrency: usize,
    /// Calls made to one provider before falling back (default: `1`).
    pub attempts_per_candidate: u32,
    /// Provider calls allowed per unit across all candidates (default: `3`).
    pub max_unit_attempts: u32,
    /// Budget of a single provider call (default: `120s`).
    pub provider_timeout: Duration,
    /// Success rate a stage needs on top of one successful unit (default: `0.0`).
    pub min_success_rate: f64,
    pub audio_max_duration: Duration,
    pub images_max_duration: Duration,
    pub video_max_duration: Duration,
    pub merge_max_duration: Duration,
    pub lip_sync_max_duration: Duration,
    /// Base URL of the provider gateway used by the HTTP invoker.
    pub provider_gateway_url: String,
    /// How often the recovery sweeper looks for abandoned runs (default: `60s`).
    pub recovery_sweep_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unit_concurrency: 4,
            attempts_per_candidate: 1,
            max_unit_attempts: 3,
            provider_timeout: Duration::from_secs(120),
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            audio_max_duration: Duration::from_secs(600),
            images_max_duration: Duration::from_secs(900),
            video_max_duration: Duration::from_secs(1800),
            merge_max_duration: Duration::from_secs(600),
            lip_sync_max_duration: Duration::from_secs(900),
            provider_gateway_url: "http://localhost:8090".to_string(),
            recovery_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default                 |
    /// |-----------------------------------|-------------------------|
    /// | `PIPELINE_UNIT_CONCURRENCY`       | `4`                     |
    /// | `PIPELINE_ATTEMPTS_PER_CANDIDATE` | `1`                     |
    /// | `PIPELINE_MAX_UNIT_ATTEMPTS`      | `3`                     |
    /// | `PIPELINE_PROVIDER_TIMEOUT_SECS`  | `120`                   |
    /// | `PIPELINE_MIN_SUCCESS_RATE`       | `0.0`                   |
    /// | `PIPELINE_AUDIO_MAX_SECS`         | `600`                   |
    /// | `PIPELINE_IMAGES_MAX_SECS`        | `900`                   |
    /// | `PIPELINE_VIDEO_MAX_SECS`         | `1800`                  |
    /// | `PIPELINE_MERGE_MAX_SECS`         | `600`                   |
    /// | `PIPELINE_LIP_SYNC_MAX_SECS`      | `900`                   |
    /// | `PROVIDER_GATEWAY_URL`            | `http://localhost:8090` |
    /// | `RECOVERY_SWEEP_INTERVAL_SECS`    | `60`                    |
    ///
    /// Panics at startup on unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(env_parse(key, default.as_secs()))
        };

        Self {
            unit_concurrency: env_parse("PIPELINE_UNIT_CONCURRENCY", defaults.unit_concurrency)
                .max(1),
            attempts_per_candidate: env_parse(
                "PIPELINE_ATTEMPTS_PER_CANDIDATE",
                defaults.attempts_per_candidate,
            )
            .max(1),
            max_unit_attempts: env_parse("PIPELINE_MAX_UNIT_ATTEMPTS", defaults.max_unit_attempts)
                .max(1),
            provider_timeout: secs("PIPELINE_PROVIDER_TIMEOUT_SECS", defaults.provider_timeout),
            min_success_rate: env_parse("PIPELINE_MIN_SUCCESS_RATE", defaults.min_success_rate)
                .clamp(0.0, 1.0),
            audio_max_duration: secs("PIPELINE_AUDIO_MAX_SECS", defaults.audio_max_duration),
            images_max_duration: secs("PIPELINE_IMAGES_MAX_SECS", defaults.images_max_duration),
            video_max_duration: secs("PIPELINE_VIDEO_MAX_SECS", defaults.video_max_duration),
            merge_max_duration: secs("PIPELINE_MERGE_MAX_SECS", defaults.merge_max_duration),
            lip_sync_max_duration: secs(
                "PIPELINE_LIP_SYNC_MAX_SECS",
                defaults.lip_sync_max_duration,
            ),
            provider_gateway_url: std::env::var("PROVIDER_GATEWAY_URL")
                .unwrap_or(defaults.provider_gateway_url),
            recovery_sweep_interval: secs(
                "RECOVERY_SWEEP_INTERVAL_SECS",
                defaults.recovery_sweep_interval,
            )
            .max(Duration::from_secs(1)),
        }
    }

    /// Longest a stage worker may run before its unfinished units time out.
    pub fn stage_max_duration(&self, step: StepName) -> Duration {
        match step {
            StepName::AudioGeneration => self.audio_max_duration,
            StepName::ImageGeneration => self.images_max_duration,
            StepName::VideoGeneration => self.video_max_duration,
            StepName::AudioVideoMerge => self.merge_max_duration,
            StepName::LipSync => self.lip_sync_max_duration,
        }
    }

    /// The shortest stage budget; runs idle for longer are candidates for recovery.
    pub fn shortest_stage_duration(&self) -> Duration {
        StepName::ALL
            .iter()
            .map(|step| self.stage_max_duration(*step))
            .min()
            .unwrap_or(self.merge_max_duration)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
