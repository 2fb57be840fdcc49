//! Per-step prediction orchestration
//!
//! `TrainStepOrchestrator` owns the strategy objects (timestep sampler,
//! noise generator/injector, target builder, rollout engine) and wires one
//! training step end to end: seed the per-step RNG from the global step,
//! decide the prediction path, run it, and hand back a loss-ready record.

use anyhow::Result;
use candle_core::{Device, Tensor};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{ModelComponents, TrainBatch, TrainProgress};
use crate::trainstep::debug_images::DebugWriter;
use crate::trainstep::noise::{NoiseGenerator, NoiseInjector};
use crate::trainstep::rollout::{build_latent_input, GuidedRolloutEngine, RolloutConditioning};
use crate::trainstep::schedule::NoiseSchedule;
use crate::trainstep::setup::{setup_optimizations, AppliedOptimizations};
use crate::trainstep::target::{LossTargetBuilder, LossType, ModelOutputData};
use crate::trainstep::timestep::TimestepSampler;
use crate::trainstep::TrainStepConfig;

pub struct TrainStepOrchestrator {
    config: TrainStepConfig,
    schedule: NoiseSchedule,
    timestep_sampler: TimestepSampler,
    noise_generator: NoiseGenerator,
    noise_injector: NoiseInjector,
    target_builder: LossTargetBuilder,
    rollout_engine: Option<GuidedRolloutEngine>,
    optimizations: AppliedOptimizations,
    debug_writer: Option<DebugWriter>,
    device: Device,
}

impl TrainStepOrchestrator {
    pub fn new(config: TrainStepConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let schedule = NoiseSchedule::new(
            config.schedule.num_train_timesteps,
            config.schedule.beta_start,
            config.schedule.beta_end,
            config.schedule.beta_schedule,
            config.schedule.prediction_type,
            &device,
        )?;
        let timestep_sampler = TimestepSampler::new(
            config.schedule.num_train_timesteps,
            config.min_noising_strength,
            config.max_noising_strength,
        );
        let optimizations = setup_optimizations(&config, &device);
        let rollout_engine = config.align_prop.enabled.then(|| {
            GuidedRolloutEngine::new(
                &config.align_prop,
                config.max_noising_strength,
                optimizations.gradient_checkpointing,
            )
        });
        let debug_writer = config.debug_mode.then(|| DebugWriter::new(&config.debug_dir));

        Ok(Self {
            noise_generator: NoiseGenerator::new(config.offset_noise_weight),
            noise_injector: NoiseInjector,
            target_builder: LossTargetBuilder,
            schedule,
            timestep_sampler,
            rollout_engine,
            optimizations,
            debug_writer,
            config,
            device,
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn optimizations(&self) -> &AppliedOptimizations {
        &self.optimizations
    }

    /// Run one training step's prediction.
    ///
    /// All randomness derives from `progress.global_step`, so a step is
    /// reproducible across restarts. Exactly one of the two prediction
    /// paths executes; the align-prop gate is drawn once, before any
    /// tensor work.
    pub fn predict(
        &self,
        model: &ModelComponents,
        batch: &TrainBatch,
        progress: &TrainProgress,
        deterministic: bool,
    ) -> Result<ModelOutputData> {
        let mut rng = StdRng::seed_from_u64(progress.global_step);

        let is_align_prop_step = self.rollout_engine.is_some()
            && rng.gen::<f64>() < self.config.align_prop.probability;

        let autocast = &self.optimizations.autocast;
        let vae_scaling_factor = model.decoder.scaling_factor();

        let text_encoder_output = autocast.cast(&model.text_encoder.encode_tokens(
            &batch.tokens,
            self.config.text_encoder_layer_skip,
            batch.text_encoder_hidden_state.as_ref(),
        )?)?;

        let scaled_latent_image = autocast.cast(&(&batch.latent_image * vae_scaling_factor)?)?;

        let scaled_latent_conditioning_image =
            if self.config.model_variant.has_conditioning_image_input() {
                let conditioning = batch.latent_conditioning_image.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "model variant {:?} requires a latent conditioning image in the batch",
                        self.config.model_variant
                    )
                })?;
                Some(autocast.cast(&(conditioning * vae_scaling_factor)?)?)
            } else {
                None
            };

        // Mask and depth enter the denoiser input too, so they follow the
        // same dtype as the latents
        let latent_mask = batch
            .latent_mask
            .as_ref()
            .map(|mask| autocast.cast(mask))
            .transpose()?;
        let latent_depth = batch
            .latent_depth
            .as_ref()
            .map(|depth| autocast.cast(depth))
            .transpose()?;

        let latent_noise = self
            .noise_generator
            .sample(&scaled_latent_image, &mut rng)?;

        let output = if is_align_prop_step && !deterministic {
            self.predict_align_prop(
                model,
                batch,
                progress,
                &mut rng,
                &text_encoder_output,
                &scaled_latent_image,
                scaled_latent_conditioning_image.as_ref(),
                latent_mask.as_ref(),
                latent_depth.as_ref(),
                latent_noise,
            )?
        } else {
            self.predict_single_step(
                model,
                batch,
                progress,
                &mut rng,
                deterministic,
                &text_encoder_output,
                &scaled_latent_image,
                scaled_latent_conditioning_image.as_ref(),
                latent_mask.as_ref(),
                latent_depth.as_ref(),
                latent_noise,
            )?
        };

        if let Some(writer) = &self.debug_writer {
            let prompts = model.text_encoder.decode_tokens(&batch.tokens)?;
            writer.save_text(&prompts, "7-prompt", progress.global_step)?;
        }

        Ok(output)
    }

    /// Single forward denoising prediction plus regression target.
    #[allow(clippy::too_many_arguments)]
    fn predict_single_step(
        &self,
        model: &ModelComponents,
        batch: &TrainBatch,
        progress: &TrainProgress,
        rng: &mut StdRng,
        deterministic: bool,
        text_encoder_output: &Tensor,
        scaled_latent_image: &Tensor,
        scaled_latent_conditioning_image: Option<&Tensor>,
        latent_mask: Option<&Tensor>,
        latent_depth: Option<&Tensor>,
        latent_noise: Tensor,
    ) -> Result<ModelOutputData> {
        let batch_size = batch.batch_size()?;

        let timesteps =
            self.timestep_sampler
                .sample(deterministic, rng, batch_size, &self.device)?;

        let scaled_noisy_latent_image = self.noise_injector.inject(
            &self.schedule,
            scaled_latent_image,
            &latent_noise,
            &timesteps,
        )?;

        let latent_input = build_latent_input(
            self.config.model_variant,
            &scaled_noisy_latent_image,
            latent_mask,
            scaled_latent_conditioning_image,
        )?;
        let depth = self.depth_input(latent_depth)?;

        let predicted_latent_noise = model.denoiser.forward(
            &latent_input,
            &timesteps,
            text_encoder_output,
            depth,
        )?;

        if let Some(writer) = &self.debug_writer {
            self.save_single_step_debug(
                writer,
                model,
                batch,
                progress,
                &latent_noise,
                &scaled_noisy_latent_image,
                &predicted_latent_noise,
                &timesteps,
                scaled_latent_conditioning_image,
            )?;
        }

        self.target_builder.build(
            &self.schedule,
            scaled_latent_image,
            &latent_noise,
            &timesteps,
            predicted_latent_noise,
        )
    }

    /// Guided multi-step rollout producing a decoded image prediction.
    #[allow(clippy::too_many_arguments)]
    fn predict_align_prop(
        &self,
        model: &ModelComponents,
        batch: &TrainBatch,
        progress: &TrainProgress,
        rng: &mut StdRng,
        text_encoder_output: &Tensor,
        scaled_latent_image: &Tensor,
        scaled_latent_conditioning_image: Option<&Tensor>,
        latent_mask: Option<&Tensor>,
        latent_depth: Option<&Tensor>,
        latent_noise: Tensor,
    ) -> Result<ModelOutputData> {
        let engine = self
            .rollout_engine
            .as_ref()
            .expect("align-prop step gated on engine presence");
        let batch_size = batch.batch_size()?;
        let vae_scaling_factor = model.decoder.scaling_factor();

        let negative = model
            .text_encoder
            .encode_empty(self.config.text_encoder_layer_skip)?;
        let (_, seq, dim) = negative.dims3()?;
        let negative_text_encoder_output =
            self.optimizations
                .autocast
                .cast(&negative.expand((batch_size, seq, dim))?)?;

        let truncate_index = engine.truncation_boundary(rng);
        debug!(
            "step {}: align-prop rollout with boundary {}",
            progress.global_step, truncate_index
        );

        let conditioning = RolloutConditioning {
            text_encoder_output,
            negative_text_encoder_output: &negative_text_encoder_output,
            latent_mask,
            scaled_latent_conditioning_image,
            latent_depth,
        };

        // The rollout starts from pure noise, not a forward-noised latent
        let predicted_image = engine.run(
            &self.schedule,
            model,
            self.config.model_variant,
            latent_noise.clone(),
            &conditioning,
            truncate_index,
            self.debug_writer
                .as_ref()
                .map(|writer| (writer, progress.global_step)),
        )?;

        if let Some(writer) = &self.debug_writer {
            let noise_image =
                self.decode_for_debug(model, &latent_noise, vae_scaling_factor)?;
            writer.save_image_batch(&noise_image, "1-noise", progress.global_step)?;

            let image = self.decode_for_debug(model, scaled_latent_image, vae_scaling_factor)?;
            writer.save_image_batch(&image, "2-image", progress.global_step)?;
        }

        Ok(ModelOutputData {
            loss_type: LossType::AlignProp,
            predicted: predicted_image,
            target: None,
            timesteps: None,
            prediction_type: self.schedule.prediction_type(),
        })
    }

    fn depth_input<'a>(&self, latent_depth: Option<&'a Tensor>) -> Result<Option<&'a Tensor>> {
        if self.config.model_variant.has_depth_input() {
            Ok(Some(latent_depth.ok_or_else(|| {
                anyhow::anyhow!(
                    "model variant {:?} requires a latent depth map in the batch",
                    self.config.model_variant
                )
            })?))
        } else {
            Ok(None)
        }
    }

    /// Decode a diffusion-space latent for inspection, outside the gradient
    /// graph.
    fn decode_for_debug(
        &self,
        model: &ModelComponents,
        latent: &Tensor,
        vae_scaling_factor: f64,
    ) -> Result<Tensor> {
        let latent = (latent.detach() / vae_scaling_factor)?.to_dtype(model.decoder.dtype())?;
        Ok(model.decoder.decode(&latent)?.clamp(-1f32, 1f32)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn save_single_step_debug(
        &self,
        writer: &DebugWriter,
        model: &ModelComponents,
        batch: &TrainBatch,
        progress: &TrainProgress,
        latent_noise: &Tensor,
        scaled_noisy_latent_image: &Tensor,
        predicted_latent_noise: &Tensor,
        timesteps: &Tensor,
        scaled_latent_conditioning_image: Option<&Tensor>,
    ) -> Result<()> {
        let step = progress.global_step;
        let vae_scaling_factor = model.decoder.scaling_factor();

        let noise = self.decode_for_debug(model, latent_noise, vae_scaling_factor)?;
        writer.save_image_batch(&noise, "1-noise", step)?;

        let predicted_noise =
            self.decode_for_debug(model, predicted_latent_noise, vae_scaling_factor)?;
        writer.save_image_batch(&predicted_noise, "2-predicted_noise", step)?;

        let noisy = self.decode_for_debug(model, scaled_noisy_latent_image, vae_scaling_factor)?;
        writer.save_image_batch(&noisy, "3-noisy_image", step)?;

        // x0 reconstruction from the epsilon estimate; coefficients are
        // indexed by the sampled timesteps
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) = self
            .schedule
            .coefficients_at(timesteps, scaled_noisy_latent_image.dtype())?;
        let scaled_predicted_latent_image = scaled_noisy_latent_image
            .detach()
            .broadcast_sub(
                &sqrt_one_minus_alpha_prod.broadcast_mul(&predicted_latent_noise.detach())?,
            )?
            .broadcast_div(&sqrt_alpha_prod)?;
        let predicted_image =
            self.decode_for_debug(model, &scaled_predicted_latent_image, vae_scaling_factor)?;
        writer.save_image_batch(&predicted_image, "4-predicted_image", step)?;

        // The batch latent is unscaled, so decode it directly
        let image = model
            .decoder
            .decode(&batch.latent_image.detach().to_dtype(model.decoder.dtype())?)?
            .clamp(-1f32, 1f32)?;
        writer.save_image_batch(&image, "5-image", step)?;

        if let Some(conditioning) = scaled_latent_conditioning_image {
            let conditioning_image =
                self.decode_for_debug(model, conditioning, vae_scaling_factor)?;
            writer.save_image_batch(&conditioning_image, "6-conditioning_image", step)?;
        }

        Ok(())
    }
}
