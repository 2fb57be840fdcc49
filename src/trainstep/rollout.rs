//! Guided differentiable rollout ("align-prop")
//!
//! Instead of regressing a single denoising step, this path samples a full
//! reduced-step reverse trajectory under classifier-free guidance and hands
//! the decoded image to a reward/perceptual loss. Backpropagation depth is
//! bounded by detaching the rollout latent for every step before a randomly
//! drawn truncation boundary.

use anyhow::Result;
use candle_core::Tensor;
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::model::{Denoiser, ModelComponents, ModelVariant};
use crate::trainstep::debug_images::DebugWriter;
use crate::trainstep::schedule::NoiseSchedule;
use crate::trainstep::AlignPropConfig;

/// Denoiser captured once per step as a pure closure.
///
/// The rollout re-reads this wrapper for every forward pass; because the
/// denoiser must be free of hidden mutable state, replaying the forward
/// during a later backward produces identical outputs. Candle retains the
/// autograd graph of direct forward passes, so checkpointing currently
/// only marks the seam where recompute-in-backward would plug in.
struct CheckpointedDenoiser<'a> {
    denoiser: &'a dyn Denoiser,
    checkpointing: bool,
}

impl<'a> CheckpointedDenoiser<'a> {
    fn new(denoiser: &'a dyn Denoiser, checkpointing: bool) -> Self {
        Self {
            denoiser,
            checkpointing,
        }
    }

    fn forward(
        &self,
        latent_input: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        depth: Option<&Tensor>,
    ) -> Result<Tensor> {
        // Candle doesn't expose recompute-in-backward yet; when it does,
        // this is the seam that branches on the flag
        if self.checkpointing {
            log::trace!("checkpointed denoiser forward");
        }
        self.denoiser
            .forward(latent_input, timesteps, encoder_hidden_states, depth)
    }
}

/// Auxiliary conditioning tensors threaded through the rollout.
pub struct RolloutConditioning<'a> {
    pub text_encoder_output: &'a Tensor,
    pub negative_text_encoder_output: &'a Tensor,
    pub latent_mask: Option<&'a Tensor>,
    pub scaled_latent_conditioning_image: Option<&'a Tensor>,
    pub latent_depth: Option<&'a Tensor>,
}

/// Build the channel-stacked network input for a model variant.
///
/// A variant that declares no auxiliary channels passes the noisy latent
/// through unmodified. Missing required tensors surface as structural
/// errors here; a batch/variant mismatch is not recoverable.
pub(crate) fn build_latent_input(
    variant: ModelVariant,
    noisy_latent: &Tensor,
    latent_mask: Option<&Tensor>,
    scaled_latent_conditioning_image: Option<&Tensor>,
) -> Result<Tensor> {
    if variant.has_mask_input() && variant.has_conditioning_image_input() {
        let mask = latent_mask
            .ok_or_else(|| anyhow::anyhow!("model variant {:?} requires a latent mask", variant))?;
        let conditioning = scaled_latent_conditioning_image.ok_or_else(|| {
            anyhow::anyhow!(
                "model variant {:?} requires a latent conditioning image",
                variant
            )
        })?;
        Ok(Tensor::cat(&[noisy_latent, mask, conditioning], 1)?)
    } else {
        Ok(noisy_latent.clone())
    }
}

/// Multi-step differentiable sampling engine.
pub struct GuidedRolloutEngine {
    steps: usize,
    cfg_scale: f64,
    max_noising_strength: f64,
    truncate_fraction: f64,
    gradient_checkpointing: bool,
}

impl GuidedRolloutEngine {
    pub fn new(
        config: &AlignPropConfig,
        max_noising_strength: f64,
        gradient_checkpointing: bool,
    ) -> Self {
        Self {
            steps: config.steps,
            cfg_scale: config.cfg_scale,
            max_noising_strength,
            truncate_fraction: config.truncate_steps,
            gradient_checkpointing,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.steps
    }

    /// Step index below which the rollout latent is detached.
    ///
    /// `high = steps * max_strength`, `low = high * (1 - truncate_fraction)`,
    /// boundary = `steps - rand_int(low..=high)`. Always in `[0, steps]`.
    pub fn truncation_boundary(&self, rng: &mut StdRng) -> usize {
        let high = (self.steps as f64 * self.max_noising_strength) as usize;
        let low = (self.steps as f64 * self.max_noising_strength
            * (1.0 - self.truncate_fraction)) as usize;
        self.steps - rng.gen_range(low..=high)
    }

    /// Run the rollout from pure noise down to the image latent and decode.
    ///
    /// Returns the decoded image batch; gradients flow through every step
    /// at or after `truncate_index` and are cut before it.
    pub fn run(
        &self,
        schedule: &NoiseSchedule,
        model: &ModelComponents,
        variant: ModelVariant,
        initial_noise: Tensor,
        conditioning: &RolloutConditioning<'_>,
        truncate_index: usize,
        debug: Option<(&DebugWriter, u64)>,
    ) -> Result<Tensor> {
        let rollout = schedule.rollout(self.steps)?;
        let batch_size = initial_noise.dim(0)?;
        let device = initial_noise.device().clone();
        let vae_scaling_factor = model.decoder.scaling_factor();

        let checkpointed = CheckpointedDenoiser::new(model.denoiser.as_ref(), self.gradient_checkpointing);

        debug!(
            "align-prop rollout: {} steps, truncation boundary {}",
            self.steps, truncate_index
        );

        let mut scaled_noisy_latent = initial_noise;
        for (step, &timestep) in rollout.timesteps().iter().enumerate() {
            let timestep_batch = Tensor::from_vec(
                vec![timestep as i64; batch_size],
                &[batch_size],
                &device,
            )?;

            let latent_input = build_latent_input(
                variant,
                &scaled_noisy_latent,
                conditioning.latent_mask,
                conditioning.scaled_latent_conditioning_image,
            )?;
            let depth = if variant.has_depth_input() {
                Some(conditioning.latent_depth.ok_or_else(|| {
                    anyhow::anyhow!("model variant {:?} requires a latent depth map", variant)
                })?)
            } else {
                None
            };

            let predicted_latent_noise = checkpointed.forward(
                &latent_input,
                &timestep_batch,
                conditioning.text_encoder_output,
                depth,
            )?;
            let negative_predicted_latent_noise = checkpointed.forward(
                &latent_input,
                &timestep_batch,
                conditioning.negative_text_encoder_output,
                depth,
            )?;

            // Guidance extrapolation: negative + scale * (positive - negative)
            let cfg_grad = (&predicted_latent_noise - &negative_predicted_latent_noise)?;
            let cfg_predicted_latent_noise =
                (&negative_predicted_latent_noise + (cfg_grad * self.cfg_scale)?)?;

            scaled_noisy_latent =
                rollout.step(&cfg_predicted_latent_noise, timestep, &scaled_noisy_latent)?;

            // Bound backprop depth; once past the boundary, gradients
            // accumulate for all remaining steps
            if step < truncate_index {
                scaled_noisy_latent = scaled_noisy_latent.detach();
            }

            if let Some((writer, global_step)) = debug {
                let latent = (scaled_noisy_latent.detach() / vae_scaling_factor)?
                    .to_dtype(model.decoder.dtype())?;
                let image = model.decoder.decode(&latent)?.clamp(-1f32, 1f32)?;
                writer.save_image_batch(
                    &image,
                    &format!("2-predicted_image_{}", step),
                    global_step,
                )?;
            }
        }

        // Back to image-latent space, then decode one element at a time to
        // cap peak decoder memory
        let predicted_latent_image =
            (scaled_noisy_latent / vae_scaling_factor)?.to_dtype(model.decoder.dtype())?;

        let mut decoded = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let latent = predicted_latent_image.narrow(0, i, 1)?;
            decoded.push(model.decoder.decode(&latent)?);
        }
        Ok(Tensor::cat(&decoded, 0)?)
    }
}
