//! Readout transformer: tokenizes an observation window and returns the
//! per-step readout embeddings.
//!
//! Each step contributes `1 + n_patches` observation tokens (state first,
//! then image patches) followed by `n_readouts_per_step` learned readout
//! tokens. The whole window is encoded in one pass under the block-wise
//! causal mask from [`super::mask`].

use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::attention::MultiHeadAttention;
use super::layers::{gelu, normal, randn, LayerNorm, Linear};
use super::mask::{make_causal_mask, sequence_len};
use crate::config::PolicyConfig;
use crate::error::{PolicyError, Result};

/// Standard deviation of the positional-bias initialisation.
const POS_EMB_STD: f32 = 0.02;

/// Pre-norm encoder layer with a GELU feed-forward block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderLayer {
    pub attn_norm: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ffn_norm: LayerNorm,
    pub ffn_in: Linear,
    pub ffn_out: Linear,
}

impl EncoderLayer {
    pub fn new<R: Rng + ?Sized>(embed_dim: usize, n_heads: usize, d_ffn: usize, rng: &mut R) -> Self {
        Self {
            attn_norm: LayerNorm::new(embed_dim),
            attn: MultiHeadAttention::new(embed_dim, n_heads, rng),
            ffn_norm: LayerNorm::new(embed_dim),
            ffn_in: Linear::new(embed_dim, d_ffn, rng),
            ffn_out: Linear::new(d_ffn, embed_dim, rng),
        }
    }

    /// `x: [seq_len, embed_dim]`
    pub fn forward(&self, x: &Array2<f32>, bias: &Array2<f32>) -> Array2<f32> {
        let h = x + &self.attn.forward(&self.attn_norm.forward(x), bias);
        let hidden = self.ffn_in.forward(&self.ffn_norm.forward(&h)).mapv(gelu);
        &h + &self.ffn_out.forward(&hidden)
    }

    pub fn param_count(&self) -> usize {
        self.attn_norm.param_count()
            + self.attn.param_count()
            + self.ffn_norm.param_count()
            + self.ffn_in.param_count()
            + self.ffn_out.param_count()
    }
}

/// Tokenizer plus encoder stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadoutTransformer {
    /// State projection `state_dim -> embed_dim`.
    pub state_proj: Linear,

    /// Image patch projection `img_dim -> embed_dim`.
    pub img_proj: Linear,

    /// Learned readout tokens: `[n_obs_steps, n_readouts_per_step, embed_dim]`
    pub readout_tokens: Array3<f32>,

    /// Positional bias of observation tokens: `[n_obs_steps, n_obs_tokens_per_step, embed_dim]`
    pub obs_pos_emb: Array3<f32>,

    /// Positional bias of readout tokens: `[n_obs_steps, n_readouts_per_step, embed_dim]`
    pub readout_pos_emb: Array3<f32>,

    pub layers: Vec<EncoderLayer>,

    pub final_norm: LayerNorm,

    /// Block-wise causal bias, built once for this geometry.
    pub mask: Array2<f32>,

    pub n_obs_steps: usize,
    pub n_obs_tokens_per_step: usize,
    pub n_readouts_per_step: usize,
}

impl ReadoutTransformer {
    /// Build with random weights.
    ///
    /// `img_dim` is the channel width of a backbone patch and
    /// `n_obs_tokens_per_step` counts the state token plus all patches.
    pub fn new<R: Rng + ?Sized>(
        config: &PolicyConfig,
        img_dim: usize,
        n_obs_tokens_per_step: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if n_obs_tokens_per_step < 2 {
            return Err(PolicyError::InvalidConfig(format!(
                "need a state token and at least one image token per step, got {n_obs_tokens_per_step}"
            )));
        }
        let state_dim = config.state_dim()?;
        let embed_dim = config.embed_dim;
        let n_obs_steps = config.n_obs_steps;
        let n_readouts = config.n_readouts_per_step;

        let state_proj = Linear::new(state_dim, embed_dim, rng);
        let img_proj = Linear::new(img_dim, embed_dim, rng);
        let readout_tokens = randn((n_obs_steps, n_readouts, embed_dim), rng);
        let obs_pos_emb = normal((n_obs_steps, n_obs_tokens_per_step, embed_dim), POS_EMB_STD, rng);
        let readout_pos_emb = normal((n_obs_steps, n_readouts, embed_dim), POS_EMB_STD, rng);
        let layers = (0..config.n_layers)
            .map(|_| EncoderLayer::new(embed_dim, config.n_heads, config.d_ffn, rng))
            .collect();

        Ok(Self {
            state_proj,
            img_proj,
            readout_tokens,
            obs_pos_emb,
            readout_pos_emb,
            layers,
            final_norm: LayerNorm::new(embed_dim),
            mask: make_causal_mask(n_obs_tokens_per_step, n_obs_steps, n_readouts),
            n_obs_steps,
            n_obs_tokens_per_step,
            n_readouts_per_step: n_readouts,
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.state_proj.out_dim()
    }

    pub fn seq_len(&self) -> usize {
        sequence_len(self.n_obs_tokens_per_step, self.n_obs_steps, self.n_readouts_per_step)
    }

    /// Encode a batch.
    ///
    /// `state: [batch, n_obs_steps, state_dim]`,
    /// `img_feats: [batch, n_obs_steps, n_patches, img_dim]`,
    /// returns `[batch, n_obs_steps, n_readouts_per_step, embed_dim]`.
    pub fn forward(&self, state: &Array3<f32>, img_feats: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, steps, state_dim) = state.dim();
        let expected_state = [batch, self.n_obs_steps, self.state_proj.in_dim()];
        if [batch, steps, state_dim] != expected_state {
            return Err(PolicyError::shape("observation.state", &expected_state, state.shape()));
        }
        let expected_img = [
            batch,
            self.n_obs_steps,
            self.n_obs_tokens_per_step - 1,
            self.img_proj.in_dim(),
        ];
        if img_feats.shape() != expected_img {
            return Err(PolicyError::shape("image features", &expected_img, img_feats.shape()));
        }

        let encoded: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| -> Result<Array3<f32>> {
                let tokens = self.tokenize(
                    state.index_axis(Axis(0), b),
                    img_feats.index_axis(Axis(0), b),
                )?;
                let hidden = self.encode(tokens);
                Ok(extract_readouts(
                    &hidden,
                    self.n_obs_steps,
                    self.n_obs_tokens_per_step,
                    self.n_readouts_per_step,
                ))
            })
            .collect::<Result<_>>()?;

        let mut out = Array4::zeros((batch, self.n_obs_steps, self.n_readouts_per_step, self.embed_dim()));
        for (b, readouts) in encoded.iter().enumerate() {
            out.index_axis_mut(Axis(0), b).assign(readouts);
        }
        Ok(out)
    }

    /// Build the flattened token sequence for one batch element.
    ///
    /// `state: [n_obs_steps, state_dim]`, `img_feats: [n_obs_steps, n_patches, img_dim]`.
    pub fn tokenize(&self, state: ArrayView2<f32>, img_feats: ArrayView3<f32>) -> Result<Array2<f32>> {
        let state_tokens = self.state_proj.forward(&state.to_owned());
        let mut sequence = Vec::with_capacity(self.n_obs_steps * 2);

        for step in 0..self.n_obs_steps {
            let patches = self.img_proj.forward(&img_feats.index_axis(Axis(0), step).to_owned());
            let state_token = state_tokens.slice(s![step..step + 1, ..]);
            let obs_tokens = concatenate(Axis(0), &[state_token, patches.view()])?
                + &self.obs_pos_emb.index_axis(Axis(0), step);
            let readouts = &self.readout_tokens.index_axis(Axis(0), step)
                + &self.readout_pos_emb.index_axis(Axis(0), step);
            sequence.push(obs_tokens);
            sequence.push(readouts);
        }

        let views: Vec<ArrayView2<f32>> = sequence.iter().map(|t| t.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Run the encoder stack over one token sequence.
    pub fn encode(&self, tokens: Array2<f32>) -> Array2<f32> {
        let hidden = self
            .layers
            .iter()
            .fold(tokens, |h, layer| layer.forward(&h, &self.mask));
        self.final_norm.forward(&hidden)
    }

    pub fn param_count(&self) -> usize {
        self.state_proj.param_count()
            + self.img_proj.param_count()
            + self.readout_tokens.len()
            + self.obs_pos_emb.len()
            + self.readout_pos_emb.len()
            + self.layers.iter().map(EncoderLayer::param_count).sum::<usize>()
            + self.final_norm.param_count()
    }
}

/// Slice the last `n_readouts_per_step` rows of every step block.
///
/// `hidden: [n_obs_steps * block, embed_dim]` -> `[n_obs_steps, n_readouts_per_step, embed_dim]`
pub fn extract_readouts(
    hidden: &Array2<f32>,
    n_obs_steps: usize,
    n_obs_tokens_per_step: usize,
    n_readouts_per_step: usize,
) -> Array3<f32> {
    let block = n_obs_tokens_per_step + n_readouts_per_step;
    let embed_dim = hidden.ncols();
    let mut out = Array3::zeros((n_obs_steps, n_readouts_per_step, embed_dim));
    for step in 0..n_obs_steps {
        let end = (step + 1) * block;
        out.index_axis_mut(Axis(0), step)
            .assign(&hidden.slice(s![end - n_readouts_per_step..end, ..]));
    }
    out
}
