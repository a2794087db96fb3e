//! Reverse denoising loop.

use ndarray::{Array2, Array3, Array4};
use rand::Rng;
use tracing::trace;

use super::head::Denoiser;
use super::scheduler::DiffusionScheduler;
use crate::core::layers::randn;
use crate::error::Result;

/// Denoise a standard-normal trajectory conditioned on `readouts`.
///
/// Returns `[batch, horizon, action_dim]` in normalised action space.
pub fn conditional_sample<S, D, R>(
    scheduler: &mut S,
    denoiser: &D,
    readouts: &Array4<f32>,
    horizon: usize,
    action_dim: usize,
    num_inference_steps: usize,
    rng: &mut R,
) -> Result<Array3<f32>>
where
    S: DiffusionScheduler,
    D: Denoiser + ?Sized,
    R: Rng + ?Sized,
{
    let batch = readouts.shape()[0];
    let mut sample: Array2<f32> = randn((batch, horizon * action_dim), rng);

    let timesteps = scheduler.set_inference_schedule(num_inference_steps);
    trace!(steps = timesteps.len(), batch, "denoising");
    for t in timesteps {
        let model_output = denoiser.predict(readouts, &vec![t; batch], &sample)?;
        sample = scheduler.step(&model_output, t, &sample, rng);
    }

    Ok(sample.into_shape_with_order((batch, horizon, action_dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BetaSchedule, PredictionType};
    use crate::diffusion::ddim::DdimScheduler;
    use crate::diffusion::scheduler::{leading_timesteps, NoiseSchedule};
    use ndarray::Array1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;

    /// Leaves the sample untouched at every step.
    struct IdentityScheduler {
        steps: RefCell<Vec<usize>>,
    }

    impl DiffusionScheduler for IdentityScheduler {
        fn num_train_timesteps(&self) -> usize {
            10
        }

        fn set_inference_schedule(&mut self, num_inference_steps: usize) -> Vec<usize> {
            leading_timesteps(10, num_inference_steps)
        }

        fn add_noise(&self, clean: &Array2<f32>, _noise: &Array2<f32>, _timesteps: &[usize]) -> Array2<f32> {
            clean.clone()
        }

        fn step<R: Rng + ?Sized>(
            &self,
            _model_output: &Array2<f32>,
            timestep: usize,
            sample: &Array2<f32>,
            _rng: &mut R,
        ) -> Array2<f32> {
            self.steps.borrow_mut().push(timestep);
            sample.clone()
        }
    }

    /// Always predicts the same clean trajectory.
    struct ConstantDenoiser(Array1<f32>);

    impl Denoiser for ConstantDenoiser {
        fn predict(&self, _readouts: &Array4<f32>, timesteps: &[usize], noisy: &Array2<f32>) -> Result<Array2<f32>> {
            assert_eq!(timesteps.len(), noisy.nrows());
            Ok(Array2::from_shape_fn(noisy.raw_dim(), |(_, j)| self.0[j]))
        }
    }

    #[test]
    fn test_identity_scheduler_returns_initial_noise() {
        let mut scheduler = IdentityScheduler {
            steps: RefCell::new(Vec::new()),
        };
        let denoiser = ConstantDenoiser(Array1::zeros(6));
        let readouts = Array4::zeros((2, 2, 1, 4));

        let out = conditional_sample(
            &mut scheduler,
            &denoiser,
            &readouts,
            3,
            2,
            1,
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();

        let expected: Array2<f32> = randn((2, 6), &mut StdRng::seed_from_u64(7));
        assert_eq!(out, expected.into_shape_with_order((2, 3, 2)).unwrap());
        assert_eq!(*scheduler.steps.borrow(), vec![0]);
    }

    #[test]
    fn test_steps_visit_timesteps_in_decreasing_order() {
        let mut scheduler = IdentityScheduler {
            steps: RefCell::new(Vec::new()),
        };
        let denoiser = ConstantDenoiser(Array1::zeros(2));
        let readouts = Array4::zeros((1, 1, 1, 4));
        conditional_sample(
            &mut scheduler,
            &denoiser,
            &readouts,
            1,
            2,
            5,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_eq!(*scheduler.steps.borrow(), vec![8, 6, 4, 2, 0]);
    }

    #[test]
    fn test_ddim_with_exact_clean_prediction_converges() {
        let mut scheduler = DdimScheduler::new(NoiseSchedule::new(
            50,
            1e-4,
            0.02,
            BetaSchedule::SquaredcosCapV2,
            PredictionType::Sample,
            Some(1.0),
        ));
        let target = Array1::from(vec![0.5, -0.5, 0.25, 0.0]);
        let denoiser = ConstantDenoiser(target.clone());
        let readouts = Array4::zeros((3, 2, 1, 4));

        let out = conditional_sample(
            &mut scheduler,
            &denoiser,
            &readouts,
            2,
            2,
            10,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        assert_eq!(out.dim(), (3, 2, 2));
        for b in 0..3 {
            for (i, v) in out.slice(ndarray::s![b, .., ..]).iter().enumerate() {
                assert!((v - target[i]).abs() < 1e-5);
            }
        }
    }
}
