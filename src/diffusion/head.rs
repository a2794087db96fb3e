//! Diffusion action head.
//!
//! Conditions on the mean readout embedding and the denoising timestep and
//! predicts either the noise or the clean trajectory, flattened to
//! `[batch, horizon * action_dim]`.

use ndarray::{concatenate, Array1, Array2, Array4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::core::layers::{randn, silu, LayerNorm, Linear};
use crate::error::{PolicyError, Result};

/// Hidden expansion of an MLP-ResNet block.
const BLOCK_EXPANSION: usize = 4;

/// Anything that maps `(readouts, timesteps, noisy sample)` to a model output
/// of the same shape as the sample.
pub trait Denoiser {
    fn predict(&self, readouts: &Array4<f32>, timesteps: &[usize], noisy: &Array2<f32>) -> Result<Array2<f32>>;
}

/// Fourier embedding of a scalar timestep, `[cos(f) | sin(f)]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FourierFeatures {
    /// `f = 2π · t · k` with a trained kernel `k: [output_size / 2]`.
    Learnable { kernel: Array1<f32> },
    /// `f_i = t · exp(-i · ln(10000) / (half - 1))`.
    Fixed { frequencies: Array1<f32> },
}

impl FourierFeatures {
    pub fn learnable<R: Rng + ?Sized>(output_size: usize, rng: &mut R) -> Self {
        Self::Learnable {
            kernel: randn(output_size / 2, rng),
        }
    }

    pub fn fixed(output_size: usize) -> Self {
        let half = output_size / 2;
        let step = (10_000.0_f32).ln() / (half.saturating_sub(1).max(1)) as f32;
        Self::Fixed {
            frequencies: Array1::from_shape_fn(half, |i| (-(i as f32) * step).exp()),
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            Self::Learnable { kernel } => kernel.len() * 2,
            Self::Fixed { frequencies } => frequencies.len() * 2,
        }
    }

    /// `timesteps: [batch]` -> `[batch, output_size]`
    pub fn forward(&self, timesteps: &[usize]) -> Array2<f32> {
        let (freqs, scale) = match self {
            Self::Learnable { kernel } => (kernel, 2.0 * std::f32::consts::PI),
            Self::Fixed { frequencies } => (frequencies, 1.0),
        };
        let half = freqs.len();
        Array2::from_shape_fn((timesteps.len(), half * 2), |(row, col)| {
            let f = scale * timesteps[row] as f32 * freqs[col % half];
            if col < half {
                f.cos()
            } else {
                f.sin()
            }
        })
    }

    pub fn param_count(&self) -> usize {
        match self {
            Self::Learnable { kernel } => kernel.len(),
            Self::Fixed { .. } => 0,
        }
    }
}

/// Linear layers with SiLU between them (none after the last).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<Linear>,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(input_dim: usize, hidden_dims: &[usize], rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(hidden_dims.len());
        let mut in_dim = input_dim;
        for &dim in hidden_dims {
            layers.push(Linear::new(in_dim, dim, rng));
            in_dim = dim;
        }
        Self { layers }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let last = self.layers.len().saturating_sub(1);
        self.layers.iter().enumerate().fold(x.clone(), |h, (i, layer)| {
            let out = layer.forward(&h);
            if i < last {
                out.mapv(silu)
            } else {
                out
            }
        })
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Linear::param_count).sum()
    }
}

/// `x + W₂ · silu(W₁ · LN(x))`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlpResNetBlock {
    pub norm: LayerNorm,
    pub dense_in: Linear,
    pub dense_out: Linear,
}

impl MlpResNetBlock {
    pub fn new<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        Self {
            norm: LayerNorm::new(dim),
            dense_in: Linear::new(dim, dim * BLOCK_EXPANSION, rng),
            dense_out: Linear::new(dim * BLOCK_EXPANSION, dim, rng),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.dense_in.forward(&self.norm.forward(x)).mapv(silu);
        x + &self.dense_out.forward(&hidden)
    }

    pub fn param_count(&self) -> usize {
        self.norm.param_count() + self.dense_in.param_count() + self.dense_out.param_count()
    }
}

/// Input projection, residual blocks, SiLU and output projection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlpResNet {
    pub input: Linear,
    pub blocks: Vec<MlpResNetBlock>,
    pub output: Linear,
}

impl MlpResNet {
    pub fn new<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        hidden_dim: usize,
        num_blocks: usize,
        rng: &mut R,
    ) -> Self {
        let input = Linear::new(in_dim, hidden_dim, rng);
        let blocks = (0..num_blocks)
            .map(|_| MlpResNetBlock::new(hidden_dim, rng))
            .collect();
        let output = Linear::new(hidden_dim, out_dim, rng);
        Self { input, blocks, output }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let h = self
            .blocks
            .iter()
            .fold(self.input.forward(x), |h, block| block.forward(&h));
        self.output.forward(&h.mapv(silu))
    }

    pub fn param_count(&self) -> usize {
        self.input.param_count()
            + self.blocks.iter().map(MlpResNetBlock::param_count).sum::<usize>()
            + self.output.param_count()
    }
}

/// Time embedding, time MLP and MLP-ResNet over `[time | mean readout | sample]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffusionActionHead {
    pub time_features: FourierFeatures,
    pub time_encoder: Mlp,
    pub net: MlpResNet,
    pub embed_dim: usize,
    pub sample_dim: usize,
}

impl DiffusionActionHead {
    pub fn new<R: Rng + ?Sized>(config: &PolicyConfig, rng: &mut R) -> Result<Self> {
        let time_dim = config.time_dim;
        let sample_dim = config.horizon * config.action_dim()?;
        let time_features = if config.learnable_time_features {
            FourierFeatures::learnable(time_dim, rng)
        } else {
            FourierFeatures::fixed(time_dim)
        };
        let time_encoder = Mlp::new(time_dim, &[2 * time_dim, time_dim], rng);
        let net = MlpResNet::new(
            time_dim + config.embed_dim + sample_dim,
            sample_dim,
            config.diffusion_head_dim,
            config.n_diffusion_head_layers,
            rng,
        );
        Ok(Self {
            time_features,
            time_encoder,
            net,
            embed_dim: config.embed_dim,
            sample_dim,
        })
    }

    pub fn param_count(&self) -> usize {
        self.time_features.param_count() + self.time_encoder.param_count() + self.net.param_count()
    }
}

/// Mean over the step and readout axes: `[b, steps, readouts, e]` -> `[b, e]`.
pub fn mean_readout(readouts: &Array4<f32>) -> Result<Array2<f32>> {
    let (batch, steps, per_step, embed_dim) = readouts.dim();
    if steps * per_step == 0 {
        return Err(PolicyError::shape("readouts", &[batch, 1, 1, embed_dim], readouts.shape()));
    }
    let flat = readouts.to_shape((batch, steps * per_step, embed_dim))?;
    flat.mean_axis(Axis(1))
        .ok_or_else(|| PolicyError::shape("readouts", &[batch, 1, 1, embed_dim], readouts.shape()))
}

impl Denoiser for DiffusionActionHead {
    fn predict(&self, readouts: &Array4<f32>, timesteps: &[usize], noisy: &Array2<f32>) -> Result<Array2<f32>> {
        let batch = noisy.nrows();
        if noisy.ncols() != self.sample_dim {
            return Err(PolicyError::shape("noisy sample", &[batch, self.sample_dim], noisy.shape()));
        }
        if readouts.shape()[0] != batch || readouts.shape()[3] != self.embed_dim {
            let mut expected = readouts.shape().to_vec();
            expected[0] = batch;
            expected[3] = self.embed_dim;
            return Err(PolicyError::shape("readouts", &expected, readouts.shape()));
        }
        if timesteps.len() != batch {
            return Err(PolicyError::shape("timesteps", &[batch], &[timesteps.len()]));
        }

        let time_cond = self.time_encoder.forward(&self.time_features.forward(timesteps));
        let context = mean_readout(readouts)?;
        let input = concatenate(Axis(1), &[time_cond.view(), context.view(), noisy.view()])?;
        Ok(self.net.forward(&input))
    }
}
