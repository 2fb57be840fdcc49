//! End-to-end tests of the training-step orchestrator with stub
//! collaborators standing in for the denoiser, VAE and text encoder.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::sync::{Arc, Mutex};

use novadiffusion::{
    AlignPropConfig, Denoiser, LatentDecoder, LossType, ModelComponents, ModelVariant,
    PredictionType, TextEncoder, TrainBatch, TrainDtype, TrainProgress, TrainStepConfig,
    TrainStepOrchestrator,
};

/// Denoiser that records the channel count of every input it sees and
/// predicts a deterministic function of the latent.
struct RecordingDenoiser {
    seen_channels: Mutex<Vec<usize>>,
    seen_depth: Mutex<Vec<bool>>,
}

impl RecordingDenoiser {
    fn new() -> Self {
        Self {
            seen_channels: Mutex::new(Vec::new()),
            seen_depth: Mutex::new(Vec::new()),
        }
    }
}

impl Denoiser for RecordingDenoiser {
    fn forward(
        &self,
        latent_input: &Tensor,
        _timesteps: &Tensor,
        _encoder_hidden_states: &Tensor,
        depth: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.seen_channels
            .lock()
            .unwrap()
            .push(latent_input.dim(1)?);
        self.seen_depth.lock().unwrap().push(depth.is_some());
        // Prediction has latent shape regardless of input channel count
        Ok((latent_input.narrow(1, 0, 4)? * 0.5)?)
    }
}

/// Lets a test keep a handle on the recorder while the model owns the box.
struct SharedDenoiser(Arc<RecordingDenoiser>);

impl Denoiser for SharedDenoiser {
    fn forward(
        &self,
        latent_input: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        depth: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.0
            .forward(latent_input, timesteps, encoder_hidden_states, depth)
    }
}

fn recording_model() -> (ModelComponents, Arc<RecordingDenoiser>) {
    let recorder = Arc::new(RecordingDenoiser::new());
    let model = ModelComponents {
        denoiser: Box::new(SharedDenoiser(recorder.clone())),
        decoder: Box::new(StubDecoder),
        text_encoder: Box::new(StubTextEncoder),
    };
    (model, recorder)
}

struct StubDecoder;

impl LatentDecoder for StubDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(latents.narrow(1, 0, 3)?)
    }

    fn scaling_factor(&self) -> f64 {
        0.18215
    }
}

struct StubTextEncoder;

impl TextEncoder for StubTextEncoder {
    fn encode_tokens(
        &self,
        tokens: &Tensor,
        _layer_skip: usize,
        precomputed: Option<&Tensor>,
    ) -> Result<Tensor> {
        if let Some(hidden) = precomputed {
            return Ok(hidden.clone());
        }
        let batch = tokens.dim(0)?;
        Ok(Tensor::ones(&[batch, 8, 16], DType::F32, tokens.device())?)
    }

    fn encode_empty(&self, _layer_skip: usize) -> Result<Tensor> {
        Ok(Tensor::zeros(&[1, 8, 16], DType::F32, &Device::Cpu)?)
    }

    fn decode_tokens(&self, tokens: &Tensor) -> Result<Vec<String>> {
        Ok(vec!["stub prompt".to_string(); tokens.dim(0)?])
    }
}

fn stub_model() -> ModelComponents {
    ModelComponents {
        denoiser: Box::new(RecordingDenoiser::new()),
        decoder: Box::new(StubDecoder),
        text_encoder: Box::new(StubTextEncoder),
    }
}

fn batch(batch_size: usize, with_aux: bool) -> TrainBatch {
    let device = Device::Cpu;
    TrainBatch {
        latent_image: Tensor::randn(0f32, 1f32, &[batch_size, 4, 8, 8], &device).unwrap(),
        latent_conditioning_image: with_aux
            .then(|| Tensor::randn(0f32, 1f32, &[batch_size, 4, 8, 8], &device).unwrap()),
        latent_mask: with_aux
            .then(|| Tensor::ones(&[batch_size, 1, 8, 8], DType::F32, &device).unwrap()),
        latent_depth: with_aux
            .then(|| Tensor::zeros(&[batch_size, 1, 8, 8], DType::F32, &device).unwrap()),
        tokens: Tensor::zeros(&[batch_size, 77], DType::I64, &device).unwrap(),
        text_encoder_hidden_state: None,
    }
}

fn floats(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn single_step_epsilon_target_is_exactly_the_noise() {
    let orchestrator =
        TrainStepOrchestrator::new(TrainStepConfig::default(), Device::Cpu).unwrap();
    let model = stub_model();

    let output = orchestrator
        .predict(&model, &batch(2, false), &TrainProgress::new(3, 0, 3), false)
        .unwrap();

    assert_eq!(output.loss_type, LossType::Target);
    assert_eq!(output.prediction_type, PredictionType::Epsilon);
    assert!(output.timesteps.is_some());
    // Predicted and target share the latent shape
    let target = output.target.expect("single-step path must carry a target");
    assert_eq!(target.dims(), output.predicted.dims());
}

#[test]
fn identical_steps_are_bit_identical() {
    let orchestrator =
        TrainStepOrchestrator::new(TrainStepConfig::default(), Device::Cpu).unwrap();
    let model = stub_model();
    let batch = batch(2, false);
    let progress = TrainProgress::new(17, 0, 17);

    let a = orchestrator.predict(&model, &batch, &progress, false).unwrap();
    let b = orchestrator.predict(&model, &batch, &progress, false).unwrap();

    assert_eq!(
        a.timesteps.unwrap().to_vec1::<i64>().unwrap(),
        b.timesteps.unwrap().to_vec1::<i64>().unwrap()
    );
    assert_eq!(floats(&a.target.unwrap()), floats(&b.target.unwrap()));
    assert_eq!(floats(&a.predicted), floats(&b.predicted));
}

#[test]
fn base_variant_feeds_the_latent_unmodified() {
    let orchestrator =
        TrainStepOrchestrator::new(TrainStepConfig::default(), Device::Cpu).unwrap();
    let (model, recorder) = recording_model();

    orchestrator
        .predict(&model, &batch(2, false), &TrainProgress::default(), false)
        .unwrap();

    // No mask, conditioning or depth channels for the base variant
    assert_eq!(*recorder.seen_channels.lock().unwrap(), vec![4]);
    assert_eq!(*recorder.seen_depth.lock().unwrap(), vec![false]);
}

#[test]
fn inpainting_variant_stacks_mask_and_conditioning_channels() {
    let mut config = TrainStepConfig::default();
    config.model_variant = ModelVariant::Inpainting;
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let (model, recorder) = recording_model();

    let output = orchestrator
        .predict(&model, &batch(2, true), &TrainProgress::new(5, 0, 5), false)
        .unwrap();
    assert_eq!(output.loss_type, LossType::Target);
    // 4 latent + 1 mask + 4 conditioning-image channels
    assert_eq!(*recorder.seen_channels.lock().unwrap(), vec![9]);
}

#[test]
fn half_precision_inpainting_casts_every_stacked_input() {
    let mut config = TrainStepConfig::default();
    config.model_variant = ModelVariant::Inpainting;
    config.train_dtype = TrainDtype::F16;
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let (model, recorder) = recording_model();

    // The batch carries an F32 mask; the concat only works if it is cast
    // alongside the latents
    let output = orchestrator
        .predict(&model, &batch(1, true), &TrainProgress::new(6, 0, 6), false)
        .unwrap();

    assert_eq!(output.predicted.dtype(), DType::F16);
    assert_eq!(*recorder.seen_channels.lock().unwrap(), vec![9]);
}

#[test]
fn inpainting_variant_without_mask_fails() {
    let mut config = TrainStepConfig::default();
    config.model_variant = ModelVariant::Inpainting;
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let model = stub_model();

    let result = orchestrator.predict(&model, &batch(2, false), &TrainProgress::default(), false);
    assert!(result.is_err());
}

#[test]
fn v_prediction_target_uses_velocity() {
    let mut config = TrainStepConfig::default();
    config.schedule.prediction_type = PredictionType::VPrediction;
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let model = stub_model();

    let output = orchestrator
        .predict(&model, &batch(1, false), &TrainProgress::new(9, 0, 9), false)
        .unwrap();

    assert_eq!(output.prediction_type, PredictionType::VPrediction);
    assert!(output.target.is_some());
}

#[test]
fn align_prop_path_produces_decoded_image_without_target() {
    let mut config = TrainStepConfig::default();
    config.align_prop = AlignPropConfig {
        enabled: true,
        probability: 1.0,
        steps: 4,
        truncate_steps: 0.5,
        cfg_scale: 2.0,
    };
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let model = stub_model();

    let output = orchestrator
        .predict(&model, &batch(2, false), &TrainProgress::new(11, 0, 11), false)
        .unwrap();

    assert_eq!(output.loss_type, LossType::AlignProp);
    assert!(output.target.is_none());
    assert!(output.timesteps.is_none());
    assert_eq!(output.predicted.dims(), &[2, 3, 8, 8]);
}

#[test]
fn deterministic_mode_suppresses_align_prop() {
    let mut config = TrainStepConfig::default();
    config.align_prop = AlignPropConfig {
        enabled: true,
        probability: 1.0,
        steps: 4,
        truncate_steps: 0.5,
        cfg_scale: 2.0,
    };
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let model = stub_model();

    let output = orchestrator
        .predict(&model, &batch(1, false), &TrainProgress::new(11, 0, 11), true)
        .unwrap();

    // Deterministic eval always takes the single-step path
    assert_eq!(output.loss_type, LossType::Target);
    let timesteps = output.timesteps.unwrap().to_vec1::<i64>().unwrap();
    assert_eq!(timesteps, vec![499]);
}

#[test]
fn depth_variant_passes_depth_to_the_denoiser() {
    let mut config = TrainStepConfig::default();
    config.model_variant = ModelVariant::Depth;
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let (model, recorder) = recording_model();

    let output = orchestrator
        .predict(&model, &batch(1, true), &TrainProgress::new(2, 0, 2), false)
        .unwrap();
    assert_eq!(output.loss_type, LossType::Target);
    assert_eq!(*recorder.seen_depth.lock().unwrap(), vec![true]);

    let missing = orchestrator.predict(&model, &batch(1, false), &TrainProgress::default(), false);
    assert!(missing.is_err());
}

#[test]
fn precomputed_text_embedding_is_passed_through() {
    let orchestrator =
        TrainStepOrchestrator::new(TrainStepConfig::default(), Device::Cpu).unwrap();
    let model = stub_model();

    let mut batch = batch(1, false);
    batch.text_encoder_hidden_state =
        Some(Tensor::zeros(&[1, 8, 16], DType::F32, &Device::Cpu).unwrap());

    let output = orchestrator
        .predict(&model, &batch, &TrainProgress::new(4, 0, 4), false)
        .unwrap();
    assert_eq!(output.loss_type, LossType::Target);
}

#[test]
fn debug_mode_writes_step_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TrainStepConfig::default();
    config.debug_mode = true;
    config.debug_dir = dir.path().to_path_buf();
    let orchestrator = TrainStepOrchestrator::new(config, Device::Cpu).unwrap();
    let model = stub_model();

    orchestrator
        .predict(&model, &batch(1, false), &TrainProgress::new(8, 0, 8), false)
        .unwrap();

    let batches_dir = dir.path().join("training_batches");
    assert!(batches_dir.join("0000008-1-noise-0.png").exists());
    assert!(batches_dir.join("0000008-2-predicted_noise-0.png").exists());
    assert!(batches_dir.join("0000008-3-noisy_image-0.png").exists());
    assert!(batches_dir.join("0000008-4-predicted_image-0.png").exists());
    assert!(batches_dir.join("0000008-5-image-0.png").exists());
    assert!(batches_dir.join("0000008-7-prompt.txt").exists());
}
