//! Deterministic DDIM sampling schedule (eta = 0).

use ndarray::{ArrayD, Zip};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DdimConfig {
    pub train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub steps_offset: usize,
    /// Use 1.0 as the final cumulative alpha instead of the first training one.
    pub set_alpha_to_one: bool,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            train_timesteps: 1000,
            beta_start: 0.000_85,
            beta_end: 0.012,
            steps_offset: 1,
            set_alpha_to_one: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<usize>,
    step_ratio: usize,
    pub init_noise_sigma: f32,
}

impl DdimScheduler {
    /// Scaled-linear betas, "leading" timestep spacing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(inference_steps: usize, config: DdimConfig) -> Self {
        let n = config.train_timesteps;
        let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for i in 0..n {
            let frac = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            let beta = (end - start).mul_add(frac, start).powi(2);
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        let steps = inference_steps.clamp(1, n);
        let step_ratio = n / steps;
        let timesteps = (0..steps)
            .rev()
            .map(|i| (i * step_ratio + config.steps_offset).min(n - 1))
            .collect();

        Self {
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps,
            step_ratio,
            init_noise_sigma: 1.0,
        }
    }

    #[must_use]
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    #[must_use]
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// One reverse step from `timestep` given the predicted noise.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(&self, noise_pred: &ArrayD<f32>, timestep: usize, sample: &ArrayD<f32>) -> ArrayD<f32> {
        let alpha_t = self.alphas_cumprod[timestep];
        let alpha_prev = timestep
            .checked_sub(self.step_ratio)
            .map_or(self.final_alpha_cumprod, |prev| self.alphas_cumprod[prev]);
        let beta_t = 1.0 - alpha_t;

        let sqrt_alpha_t = alpha_t.sqrt() as f32;
        let sqrt_beta_t = beta_t.sqrt() as f32;
        let sqrt_alpha_prev = alpha_prev.sqrt() as f32;
        let sqrt_one_minus_prev = (1.0 - alpha_prev).sqrt() as f32;

        let mut out = sample.clone();
        Zip::from(&mut out)
            .and(noise_pred)
            .for_each(|x, &eps| {
                let pred_original = (*x - sqrt_beta_t * eps) / sqrt_alpha_t;
                *x = sqrt_alpha_prev.mul_add(pred_original, sqrt_one_minus_prev * eps);
            });
        out
    }
}
