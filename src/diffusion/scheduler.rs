//! Noise-schedule interface and the shared β / ᾱ bookkeeping.
//!
//! Samples are flattened trajectories `[batch, horizon * action_dim]`. The
//! forward process is `x_t = √ᾱ_t · x_0 + √(1 − ᾱ_t) · ε`; each scheduler
//! variant supplies its own reverse step on top of the same [`NoiseSchedule`].

use ndarray::{Array2, Axis, Zip};
use rand::Rng;

use super::ddim::DdimScheduler;
use super::ddpm::DdpmScheduler;
use crate::config::{BetaSchedule, PolicyConfig, PredictionType, SchedulerKind};
use crate::error::Result;

/// Upper bound on β for the cosine schedule.
const MAX_BETA: f64 = 0.999;

/// The four operations the sampler and the training loss rely on.
pub trait DiffusionScheduler {
    /// Size of the training timestep range `[0, T)`.
    fn num_train_timesteps(&self) -> usize;

    /// Configure the reverse schedule and return its timesteps, noisiest first.
    fn set_inference_schedule(&mut self, num_inference_steps: usize) -> Vec<usize>;

    /// Forward-noise `clean` with `noise`, one timestep per row.
    fn add_noise(&self, clean: &Array2<f32>, noise: &Array2<f32>, timesteps: &[usize]) -> Array2<f32>;

    /// One reverse step `x_t -> x_{t-1}` for all rows at `timestep`.
    fn step<R: Rng + ?Sized>(
        &self,
        model_output: &Array2<f32>,
        timestep: usize,
        sample: &Array2<f32>,
        rng: &mut R,
    ) -> Array2<f32>;
}

/// β schedule with its cumulative products and the prediction convention.
#[derive(Clone, Debug)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub prediction_type: PredictionType,
    /// Clamp range for the predicted clean sample, if clipping is enabled.
    pub clip_range: Option<f32>,
}

impl NoiseSchedule {
    pub fn new(
        num_train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        schedule: BetaSchedule,
        prediction_type: PredictionType,
        clip_range: Option<f32>,
    ) -> Self {
        let betas = make_betas(num_train_timesteps, beta_start, beta_end, schedule);
        let alphas_cumprod = betas
            .iter()
            .scan(1.0_f64, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        Self {
            betas,
            alphas_cumprod,
            prediction_type,
            clip_range,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        Ok(Self::new(
            config.num_train_timesteps,
            config.beta_start as f64,
            config.beta_end as f64,
            config.beta_schedule.parse()?,
            config.prediction()?,
            config.clip_sample.then_some(config.clip_sample_range),
        ))
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// ᾱ_t; timesteps past the end read the last entry.
    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        let last = self.alphas_cumprod.len().saturating_sub(1);
        self.alphas_cumprod.get(timestep.min(last)).copied().unwrap_or(1.0)
    }

    pub fn add_noise(&self, clean: &Array2<f32>, noise: &Array2<f32>, timesteps: &[usize]) -> Array2<f32> {
        let mut noisy = Array2::zeros(clean.raw_dim());
        for (row, mut out) in noisy.axis_iter_mut(Axis(0)).enumerate() {
            let alpha = self.alpha_cumprod(timesteps.get(row).copied().unwrap_or(0));
            let signal = alpha.sqrt() as f32;
            let sigma = (1.0 - alpha).sqrt() as f32;
            Zip::from(&mut out)
                .and(clean.row(row))
                .and(noise.row(row))
                .for_each(|o, &x, &e| *o = signal * x + sigma * e);
        }
        noisy
    }

    /// Split a model output into `(predicted x_0, predicted ε)` at ᾱ = `alpha_prod`.
    /// The clean estimate is clipped when clipping is enabled.
    pub fn split_prediction(
        &self,
        model_output: &Array2<f32>,
        sample: &Array2<f32>,
        alpha_prod: f64,
    ) -> (Array2<f32>, Array2<f32>) {
        let signal = alpha_prod.sqrt() as f32;
        let sigma = (1.0 - alpha_prod).sqrt() as f32;
        let (original, epsilon) = match self.prediction_type {
            PredictionType::Epsilon => {
                let original = (sample - &(model_output * sigma)) / signal;
                (original, model_output.clone())
            }
            PredictionType::Sample => {
                let epsilon = (sample - &(model_output * signal)) / sigma.max(f32::EPSILON);
                (model_output.clone(), epsilon)
            }
        };
        let original = match self.clip_range {
            Some(range) => original.mapv(|v| v.clamp(-range, range)),
            None => original,
        };
        (original, epsilon)
    }
}

/// Evenly spaced ("leading") inference timesteps, noisiest first.
pub fn leading_timesteps(num_train_timesteps: usize, num_inference_steps: usize) -> Vec<usize> {
    let n = num_inference_steps.clamp(1, num_train_timesteps.max(1));
    let ratio = num_train_timesteps / n;
    (0..n).rev().map(|i| i * ratio).collect()
}

fn make_betas(num_train_timesteps: usize, beta_start: f64, beta_end: f64, schedule: BetaSchedule) -> Vec<f64> {
    let n = num_train_timesteps;
    let linspace = |start: f64, end: f64| -> Vec<f64> {
        if n == 1 {
            return vec![start];
        }
        (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect()
    };
    match schedule {
        BetaSchedule::Linear => linspace(beta_start, beta_end),
        BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt())
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
                })
                .collect()
        }
    }
}

/// Closed set of scheduler variants, selected by name at construction.
#[derive(Clone, Debug)]
pub enum NoiseScheduler {
    Ddpm(DdpmScheduler),
    Ddim(DdimScheduler),
}

impl NoiseScheduler {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let kind = config.scheduler_kind()?;
        let schedule = NoiseSchedule::from_config(config)?;
        Ok(match kind {
            SchedulerKind::Ddpm => Self::Ddpm(DdpmScheduler::new(schedule)),
            SchedulerKind::Ddim => Self::Ddim(DdimScheduler::new(schedule)),
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        match self {
            Self::Ddpm(s) => &s.schedule,
            Self::Ddim(s) => &s.schedule,
        }
    }
}

impl DiffusionScheduler for NoiseScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.schedule().num_train_timesteps()
    }

    fn set_inference_schedule(&mut self, num_inference_steps: usize) -> Vec<usize> {
        match self {
            Self::Ddpm(s) => s.set_inference_schedule(num_inference_steps),
            Self::Ddim(s) => s.set_inference_schedule(num_inference_steps),
        }
    }

    fn add_noise(&self, clean: &Array2<f32>, noise: &Array2<f32>, timesteps: &[usize]) -> Array2<f32> {
        self.schedule().add_noise(clean, noise, timesteps)
    }

    fn step<R: Rng + ?Sized>(
        &self,
        model_output: &Array2<f32>,
        timestep: usize,
        sample: &Array2<f32>,
        rng: &mut R,
    ) -> Array2<f32> {
        match self {
            Self::Ddpm(s) => s.step(model_output, timestep, sample, rng),
            Self::Ddim(s) => s.step(model_output, timestep, sample, rng),
        }
    }
}
