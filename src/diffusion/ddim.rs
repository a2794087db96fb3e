//! Deterministic DDIM reverse step (η = 0).

use ndarray::Array2;
use rand::Rng;

use super::scheduler::{leading_timesteps, DiffusionScheduler, NoiseSchedule};

#[derive(Clone, Debug)]
pub struct DdimScheduler {
    pub schedule: NoiseSchedule,
    num_inference_steps: usize,
}

impl DdimScheduler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        let num_inference_steps = schedule.num_train_timesteps();
        Self {
            schedule,
            num_inference_steps,
        }
    }

    /// ᾱ of the step after `timestep`; the step past zero is fully clean.
    fn alpha_cumprod_prev(&self, timestep: usize) -> f64 {
        let ratio = (self.schedule.num_train_timesteps() / self.num_inference_steps.max(1)).max(1);
        timestep
            .checked_sub(ratio)
            .map_or(1.0, |t| self.schedule.alpha_cumprod(t))
    }
}

impl DiffusionScheduler for DdimScheduler {
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
        _rng: &mut R,
    ) -> Array2<f32> {
        let alpha_prod = self.schedule.alpha_cumprod(timestep);
        let alpha_prod_prev = self.alpha_cumprod_prev(timestep);
        let (original, epsilon) = self.schedule.split_prediction(model_output, sample, alpha_prod);

        original * alpha_prod_prev.sqrt() as f32 + epsilon * (1.0 - alpha_prod_prev).sqrt() as f32
    }
}
