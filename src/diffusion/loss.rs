//! Forward-noising training objective.

use ndarray::{s, Array2, Array3, Array4};
use rand::Rng;

use super::head::Denoiser;
use super::scheduler::DiffusionScheduler;
use crate::config::{PredictionType, ACTION_IS_PAD};
use crate::core::layers::randn;
use crate::error::{PolicyError, Result};

/// Mean squared denoising error for one batch of clean trajectories.
///
/// `actions: [batch, horizon, action_dim]` are in normalised space.
/// `action_is_pad: [batch, horizon]`, when given, zeroes the error at padded
/// steps; the mean still runs over every element.
pub fn diffusion_loss<S, D, R>(
    scheduler: &S,
    denoiser: &D,
    readouts: &Array4<f32>,
    actions: &Array3<f32>,
    action_is_pad: Option<&Array2<bool>>,
    prediction_type: PredictionType,
    rng: &mut R,
) -> Result<f32>
where
    S: DiffusionScheduler,
    D: Denoiser + ?Sized,
    R: Rng + ?Sized,
{
    let (batch, horizon, action_dim) = actions.dim();
    if let Some(pad) = action_is_pad {
        if pad.dim() != (batch, horizon) {
            return Err(PolicyError::shape(ACTION_IS_PAD, &[batch, horizon], pad.shape()));
        }
    }

    let clean = actions
        .to_shape((batch, horizon * action_dim))?
        .into_owned();
    let noise: Array2<f32> = randn(clean.raw_dim(), rng);
    let timesteps: Vec<usize> = (0..batch)
        .map(|_| rng.gen_range(0..scheduler.num_train_timesteps()))
        .collect();
    let noisy = scheduler.add_noise(&clean, &noise, &timesteps);

    let pred = denoiser.predict(readouts, &timesteps, &noisy)?;
    if pred.dim() != noisy.dim() {
        return Err(PolicyError::shape("model output", noisy.shape(), pred.shape()));
    }
    let target = match prediction_type {
        PredictionType::Epsilon => noise,
        PredictionType::Sample => clean,
    };

    let mut error = (pred - target)
        .mapv(|d| d * d)
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, horizon, action_dim))?;
    if let Some(pad) = action_is_pad {
        for ((b, step), &padded) in pad.indexed_iter() {
            if padded {
                error.slice_mut(s![b, step, ..]).fill(0.0);
            }
        }
    }

    Ok(error.mean().unwrap_or(0.0))
}
