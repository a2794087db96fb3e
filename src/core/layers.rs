//! Dense building blocks shared by the encoder and the action head.
//!
//! Activations are row-major `[rows, features]`; every layer maps rows
//! independently.

use ndarray::{Array, Array1, Array2, Axis, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Affine projection `y = x · Wᵀ + b`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    /// Weight: `[out_dim, in_dim]`
    pub weight: Array2<f32>,

    /// Bias: `[out_dim]`
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn zeros(in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((out_dim, in_dim)),
            bias: Array1::zeros(out_dim),
        }
    }

    /// Uniform `U(-1/√in, 1/√in)` initialisation for weight and bias.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let mut uniform = || (rng.gen::<f32>() * 2.0 - 1.0) * bound;
        let weight = Array2::from_shape_simple_fn((out_dim, in_dim), &mut uniform);
        let bias = Array1::from_shape_simple_fn(out_dim, &mut uniform);
        Self { weight, bias }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// `[rows, in_dim] -> [rows, out_dim]`
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Layer normalisation over the feature axis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap_or(0.0);
            let var = row.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
            let inv = 1.0 / (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) * inv);
        }
        out * &self.gamma + &self.beta
    }

    pub fn param_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

/// Exact (erf-based) GELU.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2))
}

/// SiLU / swish: `x · sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7.
fn erf(x: f32) -> f32 {
    let x = x as f64;
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    (sign * (1.0 - poly * (-x * x).exp())) as f32
}

/// Standard-normal tensor of the given shape, filled in logical (row-major) order.
pub fn randn<Sh, D, R>(shape: Sh, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    Array::from_shape_simple_fn(shape, || StandardNormal.sample(&mut *rng))
}

/// Zero-mean normal tensor with standard deviation `std`.
pub fn normal<Sh, D, R>(shape: Sh, std: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    randn(shape, rng) * std
}
