//! Per-step training orchestration for diffusion models
//!
//! The modules here turn one data batch into a loss-ready prediction/target
//! record: timestep sampling, forward noising, the single-step prediction
//! path, the guided align-prop rollout, and the debug side channel.

pub mod debug_images;
pub mod noise;
pub mod predict;
pub mod rollout;
pub mod schedule;
pub mod setup;
pub mod target;
pub mod timestep;

// Re-export key types
pub use noise::{NoiseGenerator, NoiseInjector};
pub use predict::TrainStepOrchestrator;
pub use rollout::GuidedRolloutEngine;
pub use schedule::{BetaScheduleKind, NoiseSchedule, PredictionType, RolloutSchedule};
pub use setup::{AppliedOptimizations, AttentionBackend, AutocastContext, TrainDtype};
pub use target::{LossTargetBuilder, LossType, ModelOutputData};
pub use timestep::TimestepSampler;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::ModelVariant;

/// Configuration rejected before any tensor work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("noising strength window [{min}, {max}] must satisfy 0 <= min <= max <= 1")]
    NoisingWindow { min: f64, max: f64 },
    #[error("num_train_timesteps must be positive")]
    EmptySchedule,
    #[error("beta range [{start}, {end}] must satisfy 0 < start <= end < 1")]
    BetaRange { start: f64, end: f64 },
    #[error("offset noise weight {0} must be non-negative")]
    OffsetNoiseWeight(f64),
    #[error("align-prop probability {0} must lie in [0, 1]")]
    AlignPropProbability(f64),
    #[error("align-prop truncate fraction {0} must lie in [0, 1]")]
    TruncateFraction(f64),
    #[error("align-prop steps {steps} must lie in [1, {total}]")]
    RolloutSteps { steps: usize, total: usize },
    #[error("align-prop cfg scale {0} must be non-negative")]
    CfgScale(f64),
}

/// Noise schedule parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaScheduleKind,
    pub prediction_type: PredictionType,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaScheduleKind::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// Align-prop rollout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignPropConfig {
    pub enabled: bool,
    /// Per-step probability of taking the rollout path instead of the
    /// single-step path.
    pub probability: f64,
    /// Reduced rollout step count the schedule is fixed to.
    pub steps: usize,
    /// Fraction of the noised window whose gradients are truncated.
    pub truncate_steps: f64,
    /// Classifier-free guidance scale for the rollout.
    pub cfg_scale: f64,
}

impl Default for AlignPropConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.1,
            steps: 20,
            truncate_steps: 0.5,
            cfg_scale: 1.0,
        }
    }
}

/// Full configuration of the training-step core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainStepConfig {
    pub model_variant: ModelVariant,
    pub schedule: ScheduleConfig,
    pub min_noising_strength: f64,
    pub max_noising_strength: f64,
    pub offset_noise_weight: f64,
    pub text_encoder_layer_skip: usize,
    pub align_prop: AlignPropConfig,
    pub attention: AttentionBackend,
    pub gradient_checkpointing: bool,
    pub force_circular_padding: bool,
    pub train_dtype: TrainDtype,
    pub debug_mode: bool,
    pub debug_dir: PathBuf,
}

impl Default for TrainStepConfig {
    fn default() -> Self {
        Self {
            model_variant: ModelVariant::Base,
            schedule: ScheduleConfig::default(),
            min_noising_strength: 0.0,
            max_noising_strength: 1.0,
            offset_noise_weight: 0.0,
            text_encoder_layer_skip: 0,
            align_prop: AlignPropConfig::default(),
            attention: AttentionBackend::Default,
            gradient_checkpointing: false,
            force_circular_padding: false,
            train_dtype: TrainDtype::F32,
            debug_mode: false,
            debug_dir: PathBuf::from("debug"),
        }
    }
}

impl TrainStepConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.num_train_timesteps == 0 {
            return Err(ConfigError::EmptySchedule);
        }
        if self.schedule.beta_start <= 0.0
            || self.schedule.beta_start > self.schedule.beta_end
            || self.schedule.beta_end >= 1.0
        {
            return Err(ConfigError::BetaRange {
                start: self.schedule.beta_start,
                end: self.schedule.beta_end,
            });
        }
        if !(0.0..=1.0).contains(&self.min_noising_strength)
            || !(0.0..=1.0).contains(&self.max_noising_strength)
            || self.min_noising_strength > self.max_noising_strength
        {
            return Err(ConfigError::NoisingWindow {
                min: self.min_noising_strength,
                max: self.max_noising_strength,
            });
        }
        if self.offset_noise_weight < 0.0 {
            return Err(ConfigError::OffsetNoiseWeight(self.offset_noise_weight));
        }

        if self.align_prop.enabled {
            if !(0.0..=1.0).contains(&self.align_prop.probability) {
                return Err(ConfigError::AlignPropProbability(self.align_prop.probability));
            }
            if !(0.0..=1.0).contains(&self.align_prop.truncate_steps) {
                return Err(ConfigError::TruncateFraction(self.align_prop.truncate_steps));
            }
            if self.align_prop.steps == 0
                || self.align_prop.steps > self.schedule.num_train_timesteps
            {
                return Err(ConfigError::RolloutSteps {
                    steps: self.align_prop.steps,
                    total: self.schedule.num_train_timesteps,
                });
            }
            if self.align_prop.cfg_scale < 0.0 {
                return Err(ConfigError::CfgScale(self.align_prop.cfg_scale));
            }
        }

        Ok(())
    }
}

/// Load and validate a training-step configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainStepConfig> {
    let contents = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
    let config: TrainStepConfig =
        serde_yaml::from_str(&contents).context("Failed to parse config YAML")?;
    config.validate()?;
    Ok(config)
}
