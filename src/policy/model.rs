//! Model assembly: RGB encoder, readout transformer, diffusion action head
//! and noise scheduler.

use ndarray::{Array2, Array3, Array4, Array5};
use rand::Rng;
use tracing::debug;

use crate::config::{PolicyConfig, ACTION, OBS_STATE};
use crate::core::transformer::ReadoutTransformer;
use crate::diffusion::head::DiffusionActionHead;
use crate::diffusion::loss::diffusion_loss;
use crate::diffusion::sampler::conditional_sample;
use crate::diffusion::scheduler::NoiseScheduler;
use crate::error::{PolicyError, Result};
use crate::vision::backbone::RgbEncoder;

/// The single proprioceptive token that leads every observation step.
const STATE_TOKENS_PER_STEP: usize = 1;

#[derive(Clone, Debug)]
pub struct ActionModel {
    config: PolicyConfig,
    pub rgb_encoder: RgbEncoder,
    pub transformer: ReadoutTransformer,
    pub action_head: DiffusionActionHead,
    pub scheduler: NoiseScheduler,
    num_inference_steps: usize,
    action_dim: usize,
    training: bool,
}

impl ActionModel {
    pub fn new<R: Rng + ?Sized>(config: &PolicyConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let rgb_encoder = RgbEncoder::from_config(config, rng)?;
        let n_obs_tokens_per_step = rgb_encoder.num_patches() + STATE_TOKENS_PER_STEP;
        let transformer = ReadoutTransformer::new(config, rgb_encoder.feature_dim(), n_obs_tokens_per_step, rng)?;
        let action_head = DiffusionActionHead::new(config, rng)?;
        let scheduler = NoiseScheduler::from_config(config)?;

        let model = Self {
            config: config.clone(),
            rgb_encoder,
            transformer,
            action_head,
            scheduler,
            num_inference_steps: config.num_inference_steps(),
            action_dim: config.action_dim()?,
            training: false,
        };
        debug!(
            params = model.param_count(),
            tokens_per_step = n_obs_tokens_per_step,
            seq_len = model.transformer.seq_len(),
            "built action model"
        );
        Ok(model)
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn param_count(&self) -> usize {
        self.rgb_encoder.backbone.param_count() + self.transformer.param_count() + self.action_head.param_count()
    }

    /// Readout embeddings `[batch, n_obs_steps, n_readouts_per_step, embed_dim]`.
    ///
    /// `state: [batch, n_obs_steps, state_dim]`, `image: [batch, n_obs_steps, C, H, W]`.
    pub fn readouts<R: Rng + ?Sized>(&self, state: &Array3<f32>, image: &Array5<f32>, rng: &mut R) -> Result<Array4<f32>> {
        let (batch, steps, _) = state.dim();
        if steps != self.config.n_obs_steps {
            let mut expected = state.shape().to_vec();
            expected[1] = self.config.n_obs_steps;
            return Err(PolicyError::shape(OBS_STATE, &expected, state.shape()));
        }
        let (img_batch, img_steps, channels, height, width) = image.dim();
        if img_batch != batch || img_steps != steps {
            return Err(PolicyError::shape(
                self.config.image_key()?,
                &[batch, steps, channels, height, width],
                image.shape(),
            ));
        }

        // Fold steps into the batch for the backbone, then lay each feature
        // map out as one token per spatial cell.
        let flat = image.to_shape((batch * steps, channels, height, width))?;
        let fmaps = self.rgb_encoder.encode(&flat.into_owned(), self.training, rng)?;
        let (_, features, rows, cols) = fmaps.dim();
        let tokens = fmaps
            .into_shape_with_order((batch, steps, features, rows * cols))?
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .into_owned();

        self.transformer.forward(state, &tokens)
    }

    /// Full denoised trajectory `[batch, horizon, action_dim]` in normalised space.
    pub fn generate_trajectory<R: Rng + ?Sized>(
        &mut self,
        state: &Array3<f32>,
        image: &Array5<f32>,
        rng: &mut R,
    ) -> Result<Array3<f32>> {
        let readouts = self.readouts(state, image, rng)?;
        conditional_sample(
            &mut self.scheduler,
            &self.action_head,
            &readouts,
            self.config.horizon,
            self.action_dim,
            self.num_inference_steps,
            rng,
        )
    }

    /// Denoising loss for one normalised training batch.
    ///
    /// `actions: [batch, horizon, action_dim]`; `action_is_pad: [batch, horizon]`
    /// is honoured only when padding masking is enabled.
    pub fn compute_loss<R: Rng + ?Sized>(
        &self,
        state: &Array3<f32>,
        image: &Array5<f32>,
        actions: &Array3<f32>,
        action_is_pad: Option<&Array2<bool>>,
        rng: &mut R,
    ) -> Result<f32> {
        let expected = [state.shape()[0], self.config.horizon, self.action_dim];
        if actions.shape() != expected {
            return Err(PolicyError::shape(ACTION, &expected, actions.shape()));
        }
        let readouts = self.readouts(state, image, rng)?;
        let pad = action_is_pad.filter(|_| self.config.do_mask_loss_for_padding);
        diffusion_loss(
            &self.scheduler,
            &self.action_head,
            &readouts,
            actions,
            pad,
            self.config.prediction()?,
            rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OBS_IMAGE;
    use crate::core::layers::randn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_config() -> PolicyConfig {
        let mut config = PolicyConfig {
            n_obs_steps: 2,
            horizon: 6,
            n_action_steps: 3,
            crop_shape: Some([12, 12]),
            backbone_patch_size: 4,
            backbone_feature_dim: 16,
            embed_dim: 8,
            n_heads: 2,
            n_layers: 1,
            d_ffn: 16,
            time_dim: 4,
            diffusion_head_dim: 16,
            n_diffusion_head_layers: 1,
            num_train_timesteps: 20,
            num_inference_steps: Some(5),
            seed: Some(0),
            ..Default::default()
        };
        config.input_shapes.insert(OBS_IMAGE.to_string(), vec![3, 16, 16]);
        config
    }

    #[test]
    fn test_token_geometry() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = ActionModel::new(&tiny_config(), &mut rng).unwrap();
        // 3x3 patches plus one state token per step, plus one readout.
        assert_eq!(model.rgb_encoder.num_patches(), 9);
        assert_eq!(model.transformer.seq_len(), 2 * (10 + 1));
    }

    #[test]
    fn test_generate_trajectory_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = ActionModel::new(&tiny_config(), &mut rng).unwrap();
        let state: Array3<f32> = randn((2, 2, 2), &mut rng);
        let image: Array5<f32> = randn((2, 2, 3, 16, 16), &mut rng);
        let traj = model.generate_trajectory(&state, &image, &mut rng).unwrap();
        assert_eq!(traj.dim(), (2, 6, 2));
        // The last DDPM step returns the clipped clean estimate.
        assert!(traj.iter().all(|v| v.abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn test_compute_loss_is_finite_and_positive() {
        let mut rng = StdRng::seed_from_u64(2);
        let model = ActionModel::new(&tiny_config(), &mut rng).unwrap();
        let state: Array3<f32> = randn((3, 2, 2), &mut rng);
        let image: Array5<f32> = randn((3, 2, 3, 16, 16), &mut rng);
        let actions: Array3<f32> = randn((3, 6, 2), &mut rng);
        let loss = model.compute_loss(&state, &image, &actions, None, &mut rng).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    fn loss_inputs(rng: &mut StdRng) -> (Array3<f32>, Array5<f32>, Array3<f32>) {
        (
            randn((2, 2, 2), rng),
            randn((2, 2, 3, 16, 16), rng),
            randn((2, 6, 2), rng),
        )
    }

    #[test]
    fn test_padding_mask_zeroes_loss_when_enabled() {
        let config = PolicyConfig {
            do_mask_loss_for_padding: true,
            ..tiny_config()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let model = ActionModel::new(&config, &mut rng).unwrap();
        let (state, image, actions) = loss_inputs(&mut rng);
        let all_padded = Array2::from_elem((2, 6), true);

        let loss = model
            .compute_loss(&state, &image, &actions, Some(&all_padded), &mut rng)
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_padding_mask_ignored_when_disabled() {
        let config = tiny_config();
        assert!(!config.do_mask_loss_for_padding);
        let mut rng = StdRng::seed_from_u64(6);
        let model = ActionModel::new(&config, &mut rng).unwrap();
        let (state, image, actions) = loss_inputs(&mut rng);
        let all_padded = Array2::from_elem((2, 6), true);

        let masked = model
            .compute_loss(&state, &image, &actions, Some(&all_padded), &mut StdRng::seed_from_u64(7))
            .unwrap();
        let unmasked = model
            .compute_loss(&state, &image, &actions, None, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert!(unmasked > 0.0);
        assert_eq!(masked, unmasked);
    }

    #[test]
    fn test_window_length_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = ActionModel::new(&tiny_config(), &mut rng).unwrap();
        let state = Array3::zeros((1, 3, 2));
        let image = Array5::zeros((1, 3, 3, 16, 16));
        assert!(matches!(
            model.generate_trajectory(&state, &image, &mut rng),
            Err(PolicyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_action_horizon() {
        let mut rng = StdRng::seed_from_u64(4);
        let model = ActionModel::new(&tiny_config(), &mut rng).unwrap();
        let state = Array3::zeros((1, 2, 2));
        let image = Array5::zeros((1, 2, 3, 16, 16));
        let actions = Array3::zeros((1, 5, 2));
        assert!(matches!(
            model.compute_loss(&state, &image, &actions, None, &mut rng),
            Err(PolicyError::ShapeMismatch { .. })
        ));
    }
}
