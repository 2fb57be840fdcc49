//! Regression-target construction for the loss collaborator

use anyhow::Result;
use candle_core::Tensor;

use crate::trainstep::schedule::{NoiseSchedule, PredictionType};

/// Loss family the downstream collaborator should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    /// Direct regression of `predicted` against `target`.
    Target,
    /// Reward/perceptual loss on a decoded image; no explicit target.
    AlignProp,
}

/// Per-step output record, created fresh each call and consumed immediately
/// by the external loss computation.
pub struct ModelOutputData {
    pub loss_type: LossType,
    pub predicted: Tensor,
    pub target: Option<Tensor>,
    pub timesteps: Option<Tensor>,
    pub prediction_type: PredictionType,
}

/// Builds the regression target for the single-step path.
///
/// Dispatch is exhaustive over `PredictionType`, so there is no silent
/// fall-through for an unrecognized parameterization.
pub struct LossTargetBuilder;

impl LossTargetBuilder {
    pub fn build(
        &self,
        schedule: &NoiseSchedule,
        scaled_latent_image: &Tensor,
        latent_noise: &Tensor,
        timesteps: &Tensor,
        predicted_latent_noise: Tensor,
    ) -> Result<ModelOutputData> {
        let target = match schedule.prediction_type() {
            PredictionType::Epsilon => latent_noise.clone(),
            PredictionType::VPrediction => {
                schedule.get_velocity(scaled_latent_image, latent_noise, timesteps)?
            }
        };

        Ok(ModelOutputData {
            loss_type: LossType::Target,
            predicted: predicted_latent_noise,
            target: Some(target),
            timesteps: Some(timesteps.clone()),
            prediction_type: schedule.prediction_type(),
        })
    }
}
