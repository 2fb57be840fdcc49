//! Per-batch timestep sampling

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

/// Chooses one schedule index per batch element.
///
/// The noising-strength window restricts which portion of the schedule gets
/// sampled, biasing training toward high- or low-noise regimes. Window
/// bounds are validated with the rest of the config, not here.
pub struct TimestepSampler {
    num_train_timesteps: usize,
    min_noising_strength: f64,
    max_noising_strength: f64,
}

impl TimestepSampler {
    pub fn new(
        num_train_timesteps: usize,
        min_noising_strength: f64,
        max_noising_strength: f64,
    ) -> Self {
        Self {
            num_train_timesteps,
            min_noising_strength,
            max_noising_strength,
        }
    }

    /// Sample timestep indices in `[0, num_train_timesteps)`, I64 `[batch]`.
    ///
    /// Deterministic mode returns the mid-schedule index for every element,
    /// so eval batches see a fixed noise level regardless of call order.
    /// Stochastic mode draws independently per element from the configured
    /// window, using only the caller's seeded generator.
    pub fn sample(
        &self,
        deterministic: bool,
        rng: &mut StdRng,
        batch_size: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let timesteps: Vec<i64> = if deterministic {
            let mid = (self.num_train_timesteps / 2).saturating_sub(1) as i64;
            vec![mid; batch_size]
        } else {
            // Keep the window inside the schedule: a full-strength lower
            // bound collapses onto the final index instead of leaving an
            // empty range
            let min_timestep = ((self.num_train_timesteps as f64 * self.min_noising_strength)
                as usize)
                .min(self.num_train_timesteps - 1);
            let max_timestep = ((self.num_train_timesteps as f64 * self.max_noising_strength)
                as usize)
                .max(min_timestep + 1)
                .min(self.num_train_timesteps);

            (0..batch_size)
                .map(|_| rng.gen_range(min_timestep..max_timestep) as i64)
                .collect()
        };

        Ok(Tensor::from_vec(timesteps, &[batch_size], device)?)
    }
}
