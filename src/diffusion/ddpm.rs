//! Stochastic DDPM reverse step with the "fixed small" posterior variance.

use ndarray::Array2;
use rand::Rng;

use super::scheduler::{leading_timesteps, DiffusionScheduler, NoiseSchedule};
use crate::core::layers::randn;

/// Floor applied to the posterior variance before taking its root.
const MIN_VARIANCE: f64 = 1e-20;

#[derive(Clone, Debug)]
pub struct DdpmScheduler {
    pub schedule: NoiseSchedule,
    num_inference_steps: usize,
}

impl DdpmScheduler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        let num_inference_steps = schedule.num_train_timesteps();
        Self {
            schedule,
            num_inference_steps,
        }
    }

    fn previous_timestep(&self, timestep: usize) -> Option<usize> {
        let ratio = self.schedule.num_train_timesteps() / self.num_inference_steps.max(1);
        timestep.checked_sub(ratio.max(1))
    }
}

impl DiffusionScheduler for DdpmScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.schedule.num_train_timesteps()
    }

    fn set_inference_schedule(&mut self, num_inference_steps: usize) -> Vec<usize> {
        let timesteps = leading_timesteps(self.num_train_timesteps(), num_inference_steps);
        self.num_inference_steps = timesteps.len();
        timesteps
    }

    fn add_noise(&self, clean: &Array2<f32>, noise: &Array2<f32>, timesteps: &[usize]) -> Array2<f32> {
        self.schedule.add_noise(clean, noise, timesteps)
    }

    fn step<R: Rng + ?Sized>(
        &self,
        model_output: &Array2<f32>,
        timestep: usize,
        sample: &Array2<f32>,
        rng: &mut R,
    ) -> Array2<f32> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = self
            .previous_timestep(timestep)
            .map_or(1.0, |t| self.schedule.alpha_cumprod(t));
        let beta_prod = 1.0 - alpha_prod;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (original, _) = self.schedule.split_prediction(model_output, sample, alpha_prod);

        // Posterior mean μ̃_t(x_t, x_0).
        let original_coeff = (alpha_prod_prev.sqrt() * current_beta / beta_prod) as f32;
        let sample_coeff = (current_alpha.sqrt() * beta_prod_prev / beta_prod) as f32;
        let mean = original * original_coeff + sample * sample_coeff;

        if timestep == 0 {
            return mean;
        }
        let variance = (beta_prod_prev / beta_prod * current_beta).max(MIN_VARIANCE);
        let noise: Array2<f32> = randn(sample.raw_dim(), rng);
        mean + noise * variance.sqrt() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BetaSchedule, PredictionType};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scheduler(prediction_type: PredictionType) -> DdpmScheduler {
        DdpmScheduler::new(NoiseSchedule::new(
            100,
            1e-4,
            0.02,
            BetaSchedule::SquaredcosCapV2,
            prediction_type,
            None,
        ))
    }

    #[test]
    fn test_default_schedule_covers_every_timestep() {
        let mut ddpm = scheduler(PredictionType::Epsilon);
        let timesteps = ddpm.set_inference_schedule(100);
        assert_eq!(timesteps.len(), 100);
        assert_eq!(timesteps.first(), Some(&99));
        assert_eq!(timesteps.last(), Some(&0));
        assert_eq!(ddpm.previous_timestep(50), Some(49));
    }

    #[test]
    fn test_strided_previous_timestep() {
        let mut ddpm = scheduler(PredictionType::Epsilon);
        ddpm.set_inference_schedule(10);
        assert_eq!(ddpm.previous_timestep(90), Some(80));
        assert_eq!(ddpm.previous_timestep(0), None);
    }

    #[test]
    fn test_final_step_returns_clean_estimate() {
        let ddpm = scheduler(PredictionType::Sample);
        let target = array![[0.25, -0.5, 0.75]];
        let sample = array![[2.0, 2.0, 2.0]];
        let mut rng = StdRng::seed_from_u64(0);
        let out = ddpm.step(&target, 0, &sample, &mut rng);
        for (a, b) in out.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_exact_noise_prediction_recovers_clean_at_last_step() {
        let ddpm = scheduler(PredictionType::Epsilon);
        let clean = array![[0.1, -0.3], [0.6, 0.2]];
        let noise = array![[1.0, -1.5], [0.3, 0.9]];
        let noisy = ddpm.add_noise(&clean, &noise, &[0, 0]);
        let mut rng = StdRng::seed_from_u64(1);
        let out = ddpm.step(&noise, 0, &noisy, &mut rng);
        for (a, b) in out.iter().zip(clean.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_intermediate_step_is_stochastic() {
        let ddpm = scheduler(PredictionType::Epsilon);
        let sample = array![[0.5, 0.5]];
        let output = array![[0.0, 0.0]];
        let a = ddpm.step(&output, 50, &sample, &mut StdRng::seed_from_u64(2));
        let b = ddpm.step(&output, 50, &sample, &mut StdRng::seed_from_u64(3));
        let c = ddpm.step(&output, 50, &sample, &mut StdRng::seed_from_u64(2));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
