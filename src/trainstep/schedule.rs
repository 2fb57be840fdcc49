//! Forward-diffusion noise schedule and rollout stepping
//!
//! Coefficient tables are computed once at model load and are read-only
//! afterwards. The same tables drive forward noising during regular
//! training and the reverse one-step updates of the align-prop rollout.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// Regression target convention of the trained model.
///
/// Exhaustive by construction: an unknown string in the config fails at
/// deserialization, so no "unsupported prediction type" path exists at
/// training time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionType {
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "v_prediction")]
    VPrediction,
}

/// Beta schedule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaScheduleKind {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

/// Immutable per-model table of diffusion coefficients.
pub struct NoiseSchedule {
    num_timesteps: usize,
    prediction_type: PredictionType,
    betas: Tensor,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
    // Scalar copy for the rollout's per-step f64 math
    alphas_cumprod_vec: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaScheduleKind,
        prediction_type: PredictionType,
        device: &Device,
    ) -> Result<Self> {
        let betas_vec = match beta_schedule {
            BetaScheduleKind::Linear => {
                linear_betas(num_timesteps, beta_start, beta_end)
            }
            BetaScheduleKind::ScaledLinear => {
                scaled_linear_betas(num_timesteps, beta_start, beta_end)
            }
            BetaScheduleKind::SquaredcosCapV2 => cosine_betas(num_timesteps),
        };

        let mut alphas_cumprod_vec = Vec::with_capacity(num_timesteps);
        let mut cumprod = 1.0f64;
        for beta in &betas_vec {
            cumprod *= 1.0 - beta;
            alphas_cumprod_vec.push(cumprod);
        }

        let betas = Tensor::from_vec(
            betas_vec.iter().map(|b| *b as f32).collect::<Vec<_>>(),
            &[num_timesteps],
            device,
        )?;
        let alphas_cumprod = Tensor::from_vec(
            alphas_cumprod_vec.iter().map(|a| *a as f32).collect::<Vec<_>>(),
            &[num_timesteps],
            device,
        )?;
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt()?;
        let sqrt_one_minus_alphas_cumprod = (1.0 - &alphas_cumprod)?.sqrt()?;

        Ok(Self {
            num_timesteps,
            prediction_type,
            betas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            alphas_cumprod_vec,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn betas(&self) -> &Tensor {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    pub fn alpha_cumprod_at(&self, timestep: usize) -> f64 {
        self.alphas_cumprod_vec[timestep]
    }

    /// sqrt(ac[t]) and sqrt(1 - ac[t]) gathered per batch element and
    /// reshaped to broadcast over `[batch, c, h, w]`.
    pub fn coefficients_at(&self, timesteps: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let batch_size = timesteps.dim(0)?;
        let timesteps = timesteps.to_dtype(DType::I64)?;

        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(&[batch_size, 1, 1, 1])?
            .to_dtype(dtype)?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(&[batch_size, 1, 1, 1])?
            .to_dtype(dtype)?;

        Ok((sqrt_alpha_prod, sqrt_one_minus_alpha_prod))
    }

    /// Forward diffusion: `sqrt(ac[t]) * x + sqrt(1 - ac[t]) * noise`.
    ///
    /// Supports a distinct timestep per batch element. Differentiable with
    /// respect to both `original_samples` and `noise`.
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) =
            self.coefficients_at(timesteps, original_samples.dtype())?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// v-prediction target: `sqrt(ac[t]) * noise - sqrt(1 - ac[t]) * x`.
    pub fn get_velocity(
        &self,
        sample: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) =
            self.coefficients_at(timesteps, sample.dtype())?;

        Ok((sqrt_alpha_prod.broadcast_mul(noise)?
            - sqrt_one_minus_alpha_prod.broadcast_mul(sample)?)?)
    }

    /// Signal-to-noise ratio per timestep, for external loss weighting.
    pub fn snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        let timesteps = timesteps.to_dtype(DType::I64)?;
        let alphas_cumprod = self.alphas_cumprod.index_select(&timesteps, 0)?;
        Ok((&alphas_cumprod / (1.0 - &alphas_cumprod)?)?)
    }

    /// Fix a reduced-step reverse schedule for an align-prop rollout.
    pub fn rollout(&self, num_rollout_steps: usize) -> Result<RolloutSchedule> {
        anyhow::ensure!(
            num_rollout_steps > 0 && num_rollout_steps <= self.num_timesteps,
            "rollout step count {} outside [1, {}]",
            num_rollout_steps,
            self.num_timesteps
        );

        let step_ratio = self.num_timesteps / num_rollout_steps;
        let timesteps: Vec<usize> = (0..num_rollout_steps)
            .map(|i| (num_rollout_steps - 1 - i) * step_ratio)
            .collect();

        Ok(RolloutSchedule {
            timesteps,
            step_ratio,
            alphas_cumprod: self.alphas_cumprod_vec.clone(),
            prediction_type: self.prediction_type,
        })
    }
}

/// Reverse schedule fixed to a reduced number of steps, iterated from high
/// noise to zero by the guided rollout engine.
pub struct RolloutSchedule {
    timesteps: Vec<usize>,
    step_ratio: usize,
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
}

impl RolloutSchedule {
    /// Timestep indices in decreasing order, one per rollout step.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn num_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// One deterministic reverse-diffusion update (DDIM, eta = 0).
    ///
    /// Differentiable with respect to `model_output` and `sample`; the
    /// rollout relies on that to backpropagate through its suffix.
    pub fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = if timestep >= self.step_ratio {
            self.alphas_cumprod[timestep - self.step_ratio]
        } else {
            1.0
        };

        let beta_prod_t = 1.0 - alpha_prod_t;
        let sqrt_alpha_prod_t = alpha_prod_t.sqrt();
        let sqrt_one_minus_alpha_prod_t = beta_prod_t.sqrt();

        // Recover x_0 and epsilon under the model's parameterization
        let (pred_original_sample, epsilon) = match self.prediction_type {
            PredictionType::Epsilon => {
                let x0 = ((sample - (model_output * sqrt_one_minus_alpha_prod_t)?)?
                    / sqrt_alpha_prod_t)?;
                (x0, model_output.clone())
            }
            PredictionType::VPrediction => {
                let x0 = ((sample * sqrt_alpha_prod_t)?
                    - (model_output * sqrt_one_minus_alpha_prod_t)?)?;
                let epsilon = ((sample - (&x0 * sqrt_alpha_prod_t)?)?
                    / sqrt_one_minus_alpha_prod_t)?;
                (x0, epsilon)
            }
        };

        // x_{t-1} = sqrt(ac_prev) * x_0 + sqrt(1 - ac_prev) * epsilon
        let sqrt_alpha_prod_t_prev = alpha_prod_t_prev.sqrt();
        let sqrt_one_minus_alpha_prod_t_prev = (1.0 - alpha_prod_t_prev).sqrt();
        let pred_sample_direction = (epsilon * sqrt_one_minus_alpha_prod_t_prev)?;

        Ok(((pred_original_sample * sqrt_alpha_prod_t_prev)? + pred_sample_direction)?)
    }
}

fn linear_betas(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    (0..num_timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * (i as f64) / (num_timesteps as f64 - 1.0))
        .collect()
}

fn scaled_linear_betas(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    let start = beta_start.sqrt();
    let end = beta_end.sqrt();
    (0..num_timesteps)
        .map(|i| {
            let b = start + (end - start) * (i as f64) / (num_timesteps as f64 - 1.0);
            b * b
        })
        .collect()
}

fn cosine_betas(num_timesteps: usize) -> Vec<f64> {
    let max_beta = 0.999;
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}
