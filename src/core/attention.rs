//! Multi-head self-attention with an additive score bias.
//!
//! Scores for head `h` are `q_h · k_hᵀ / √head_dim + bias`; the bias carries
//! the block-wise causal mask, so blocked pairs receive `-inf` before the
//! row softmax.

use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::Linear;

/// Weights for one self-attention block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    /// Query projection `[embed_dim, embed_dim]`.
    pub q_proj: Linear,

    /// Key projection `[embed_dim, embed_dim]`.
    pub k_proj: Linear,

    /// Value projection `[embed_dim, embed_dim]`.
    pub v_proj: Linear,

    /// Output projection `[embed_dim, embed_dim]`.
    pub out_proj: Linear,

    pub n_heads: usize,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(embed_dim: usize, n_heads: usize, rng: &mut R) -> Self {
        Self {
            q_proj: Linear::new(embed_dim, embed_dim, rng),
            k_proj: Linear::new(embed_dim, embed_dim, rng),
            v_proj: Linear::new(embed_dim, embed_dim, rng),
            out_proj: Linear::new(embed_dim, embed_dim, rng),
            n_heads,
        }
    }

    pub fn zeros(embed_dim: usize, n_heads: usize) -> Self {
        Self {
            q_proj: Linear::zeros(embed_dim, embed_dim),
            k_proj: Linear::zeros(embed_dim, embed_dim),
            v_proj: Linear::zeros(embed_dim, embed_dim),
            out_proj: Linear::zeros(embed_dim, embed_dim),
            n_heads,
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.q_proj.out_dim()
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim() / self.n_heads.max(1)
    }

    /// Attend over a full sequence `x: [seq_len, embed_dim]` with `bias: [seq_len, seq_len]`.
    pub fn forward(&self, x: &Array2<f32>, bias: &Array2<f32>) -> Array2<f32> {
        let seq_len = x.nrows();
        let head_dim = self.head_dim();
        let scale = (head_dim as f32).sqrt();

        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);

        let mut attn_out = Array2::zeros((seq_len, self.embed_dim()));
        for head in 0..self.n_heads {
            let cols = head * head_dim..(head + 1) * head_dim;
            let q_h = q.slice(s![.., cols.clone()]);
            let k_h = k.slice(s![.., cols.clone()]);
            let v_h = v.slice(s![.., cols.clone()]);

            let mut scores = q_h.dot(&k_h.t()) / scale + bias;
            for mut row in scores.axis_iter_mut(Axis(0)) {
                let probs = softmax(row.view());
                row.assign(&probs);
            }

            attn_out.slice_mut(s![.., cols]).assign(&scores.dot(&v_h));
        }

        self.out_proj.forward(&attn_out)
    }

    pub fn param_count(&self) -> usize {
        self.q_proj.param_count()
            + self.k_proj.param_count()
            + self.v_proj.param_count()
            + self.out_proj.param_count()
    }
}

/// Softmax over one score row. `-inf` entries get zero weight; a row with no
/// finite entry yields all zeros.
pub fn softmax(x: ArrayView1<f32>) -> Array1<f32> {
    if x.is_empty() {
        return x.to_owned();
    }

    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        return Array1::zeros(x.len());
    }
    let exp = x.mapv(|v| (v - max_val).exp());
    let sum = exp.sum();

    if sum > 0.0 {
        exp / sum
    } else {
        Array1::from_elem(x.len(), 1.0 / x.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mask::make_causal_mask;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_softmax() {
        let x = array![1.0, 2.0, 3.0];
        let s = softmax(x.view());
        assert!((s.sum() - 1.0).abs() < 1e-5);
        assert!(s[2] > s[1] && s[1] > s[0]);
    }

    #[test]
    fn test_softmax_masked_entries() {
        let x = array![0.5, f32::NEG_INFINITY, 0.5];
        let s = softmax(x.view());
        assert_eq!(s[1], 0.0);
        assert!((s[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_empty() {
        let x: Array1<f32> = Array1::zeros(0);
        assert_eq!(softmax(x.view()).len(), 0);
    }

    #[test]
    fn test_zero_weights_output_zero() {
        let attn = MultiHeadAttention::zeros(8, 2);
        let x = Array2::ones((4, 8));
        let bias = Array2::zeros((4, 4));
        let out = attn.forward(&x, &bias);
        assert_eq!(out.dim(), (4, 8));
        assert!(out.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_masked_future_does_not_leak() {
        let mut rng = StdRng::seed_from_u64(4);
        let attn = MultiHeadAttention::new(8, 2, &mut rng);
        let bias = make_causal_mask(2, 2, 1);
        let x: Array2<f32> = crate::core::layers::randn((6, 8), &mut rng);

        let mut perturbed = x.clone();
        // Tokens of step 1 (rows 3..6) must not change any step-0 output.
        perturbed.slice_mut(s![3.., ..]).mapv_inplace(|v| v + 5.0);

        let a = attn.forward(&x, &bias);
        let b = attn.forward(&perturbed, &bias);
        for i in 0..3 {
            for d in 0..8 {
                assert!((a[[i, d]] - b[[i, d]]).abs() < 1e-5, "row {i} leaked");
            }
        }
    }

    #[test]
    fn test_param_count() {
        let attn = MultiHeadAttention::zeros(8, 2);
        assert_eq!(attn.param_count(), 4 * (64 + 8));
        assert_eq!(attn.head_dim(), 4);
    }
}
