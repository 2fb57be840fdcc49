//! Boundary types for the external model collaborators
//!
//! The training-step core never owns network weights. It talks to the
//! denoiser, the latent decoder and the text encoder through the traits
//! below, so trainers can plug in any candle-backed implementation.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

/// Conditional denoising network, consumed as a pure function.
///
/// Implementations must be free of hidden mutable state: the rollout engine
/// may re-invoke the same call during a later backward pass and expects
/// identical outputs for identical inputs.
pub trait Denoiser {
    /// Predict latent noise for a (possibly channel-augmented) noisy latent.
    ///
    /// `timesteps` is an I64 tensor of shape `[batch]`. `depth` is only
    /// passed for depth-conditioned model variants.
    fn forward(
        &self,
        latent_input: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        depth: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Latent-space decoder (VAE side of the model).
pub trait LatentDecoder {
    /// Decode unscaled latents to image space, `[batch, 3, H, W]` in [-1, 1].
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Scaling factor between image latents and diffusion latents.
    fn scaling_factor(&self) -> f64;

    /// Compute dtype the decoder expects its input in.
    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// Text conditioning provider.
pub trait TextEncoder {
    /// Encode a tokenized prompt batch, `[batch, seq, dim]`.
    ///
    /// When the text encoder is frozen the data pipeline may carry a
    /// precomputed hidden state; callers pass it through `precomputed` and
    /// implementations should return it unchanged.
    fn encode_tokens(
        &self,
        tokens: &Tensor,
        layer_skip: usize,
        precomputed: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// Encode the empty prompt, `[1, seq, dim]`. Used for the negative
    /// branch of classifier-free guidance.
    fn encode_empty(&self, layer_skip: usize) -> Result<Tensor>;

    /// Decode a token batch back to prompt strings, one per batch element.
    /// Only used by the debug side channel.
    fn decode_tokens(&self, tokens: &Tensor) -> Result<Vec<String>>;
}

/// The bundle of collaborators a training step operates on.
pub struct ModelComponents {
    pub denoiser: Box<dyn Denoiser>,
    pub decoder: Box<dyn LatentDecoder>,
    pub text_encoder: Box<dyn TextEncoder>,
}

/// Model variants and the auxiliary inputs they consume.
///
/// Capability queries are driven by this tag instead of runtime inspection,
/// so a batch/variant mismatch fails at the concat site, loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Plain text-to-image model; the network input is the noisy latent.
    Base,
    /// Inpainting model: mask + conditioning-image channels are appended.
    Inpainting,
    /// Depth-to-image model: a depth map rides along as a separate input.
    Depth,
}

impl ModelVariant {
    pub fn has_mask_input(&self) -> bool {
        matches!(self, ModelVariant::Inpainting)
    }

    pub fn has_conditioning_image_input(&self) -> bool {
        matches!(self, ModelVariant::Inpainting)
    }

    pub fn has_depth_input(&self) -> bool {
        matches!(self, ModelVariant::Depth)
    }
}

/// One training batch, produced by the external data pipeline.
///
/// Optional entries are only read when the model variant requires them.
pub struct TrainBatch {
    pub latent_image: Tensor,
    pub latent_conditioning_image: Option<Tensor>,
    pub latent_mask: Option<Tensor>,
    pub latent_depth: Option<Tensor>,
    pub tokens: Tensor,
    pub text_encoder_hidden_state: Option<Tensor>,
}

impl TrainBatch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.latent_image.dim(0)?)
    }
}

/// Global training progress, owned by the outer training loop.
///
/// `global_step` doubles as the seed for every random draw inside a step,
/// which keeps debug runs reproducible across process restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainProgress {
    pub global_step: u64,
    pub epoch: u64,
    pub epoch_step: u64,
}

impl TrainProgress {
    pub fn new(global_step: u64, epoch: u64, epoch_step: u64) -> Self {
        Self {
            global_step,
            epoch,
            epoch_step,
        }
    }

    pub fn next_step(&mut self) {
        self.global_step += 1;
        self.epoch_step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_capabilities() {
        assert!(!ModelVariant::Base.has_mask_input());
        assert!(!ModelVariant::Base.has_conditioning_image_input());
        assert!(!ModelVariant::Base.has_depth_input());

        assert!(ModelVariant::Inpainting.has_mask_input());
        assert!(ModelVariant::Inpainting.has_conditioning_image_input());
        assert!(!ModelVariant::Inpainting.has_depth_input());

        assert!(ModelVariant::Depth.has_depth_input());
        assert!(!ModelVariant::Depth.has_mask_input());
    }

    #[test]
    fn test_progress_advance() {
        let mut progress = TrainProgress::new(10, 0, 10);
        progress.next_step();
        assert_eq!(progress.global_step, 11);
        assert_eq!(progress.epoch_step, 11);
    }
}
