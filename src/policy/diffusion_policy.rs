//! Public policy surface: `reset`, `select_action`, `forward`.

use ndarray::{Array2, Array3, Array5, Ix2, Ix3, Ix4, Ix5};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::batch::Batch;
use super::model::ActionModel;
use super::normalize::{DatasetStats, Normalizer};
use super::queue::{ActionQueueController, ControllerStats, TrajectoryGenerator};
use crate::config::{PolicyConfig, ACTION, ACTION_IS_PAD, OBS_STATE};
use crate::error::Result;

/// Receding-horizon diffusion policy.
///
/// Inputs are normalised with the dataset statistics before they reach the
/// model; generated actions are mapped back to the raw action space.
pub struct DiffusionPolicy {
    config: PolicyConfig,
    image_key: String,
    normalize_inputs: Normalizer,
    normalize_outputs: Normalizer,
    controller: ActionQueueController,
    model: ActionModel,
    rng: StdRng,
}

impl DiffusionPolicy {
    pub fn new(config: PolicyConfig, stats: &DatasetStats) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let normalize_inputs = Normalizer::new(&config.input_shapes, &config.input_normalization_modes, stats)?;
        let normalize_outputs = Normalizer::new(&config.output_shapes, &config.output_normalization_modes, stats)?;
        let controller = ActionQueueController::new(config.n_obs_steps, config.horizon, config.n_action_steps)?;
        let model = ActionModel::new(&config, &mut rng)?;
        let image_key = config.image_key()?.to_string();

        info!(
            scheduler = %config.noise_scheduler_type,
            prediction = %config.prediction_type,
            params = model.param_count(),
            "diffusion policy ready"
        );
        Ok(Self {
            config,
            image_key,
            normalize_inputs,
            normalize_outputs,
            controller,
            model,
            rng,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    pub fn param_count(&self) -> usize {
        self.model.param_count()
    }

    /// Random crops in training mode, center crops otherwise.
    pub fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    /// Clear the observation and action queues. Call at every episode start.
    pub fn reset(&mut self) {
        self.controller.reset();
        debug!("policy queues cleared");
    }

    /// Return the action for the current step.
    ///
    /// `observation` holds `observation.state: [batch, state_dim]` and the image
    /// field `[batch, C, H, W]`; the result is `[batch, action_dim]` in raw units.
    pub fn select_action(&mut self, observation: &Batch) -> Result<Array2<f32>> {
        observation.batch_size()?;
        let mut observation = observation.clone();
        self.normalize_inputs.normalize(&mut observation)?;
        let state = observation.array::<Ix2>(OBS_STATE)?;
        let image = observation.array::<Ix4>(&self.image_key)?;

        let mut generator = Generator {
            model: &mut self.model,
            outputs: &self.normalize_outputs,
            rng: &mut self.rng,
        };
        self.controller.select_action(state, image, &mut generator)
    }

    /// Training loss for a batch holding `observation.state: [b, n_obs, d]`,
    /// the image field `[b, n_obs, C, H, W]`, `action: [b, horizon, a]` and
    /// optionally the `action_is_pad: [b, horizon]` mask.
    pub fn forward(&mut self, batch: &Batch) -> Result<f32> {
        batch.batch_size()?;
        let mut batch = batch.clone();
        self.normalize_inputs.normalize(&mut batch)?;
        self.normalize_outputs.normalize(&mut batch)?;

        let state: Array3<f32> = batch.array::<Ix3>(OBS_STATE)?;
        let image: Array5<f32> = batch.array::<Ix5>(&self.image_key)?;
        let actions: Array3<f32> = batch.array::<Ix3>(ACTION)?;
        let pad = batch.mask::<Ix2>(ACTION_IS_PAD)?;

        let loss = self
            .model
            .compute_loss(&state, &image, &actions, pad.as_ref(), &mut self.rng)?;
        debug!(loss, batch = state.shape()[0], "computed loss");
        Ok(loss)
    }
}

/// Runs the model and restores raw action units for the controller.
struct Generator<'a> {
    model: &'a mut ActionModel,
    outputs: &'a Normalizer,
    rng: &'a mut StdRng,
}

impl TrajectoryGenerator for Generator<'_> {
    fn generate_trajectory(&mut self, state: &Array3<f32>, image: &Array5<f32>) -> Result<Array3<f32>> {
        let trajectory = self.model.generate_trajectory(state, image, &mut *self.rng)?;
        let restored = self.outputs.unnormalize_array(ACTION, trajectory.into_dyn())?;
        Ok(restored.into_dimensionality::<Ix3>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OBS_IMAGE;
    use crate::error::PolicyError;
    use crate::policy::normalize::FieldStats;
    use ndarray::Array4;

    fn tiny_config() -> PolicyConfig {
        let mut config = PolicyConfig {
            n_obs_steps: 2,
            horizon: 8,
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
            num_train_timesteps: 10,
            num_inference_steps: Some(4),
            seed: Some(42),
            ..Default::default()
        };
        config.input_shapes.insert(OBS_IMAGE.to_string(), vec![3, 16, 16]);
        config
    }

    fn stats() -> DatasetStats {
        let mut stats = DatasetStats::default();
        stats.insert(
            OBS_IMAGE,
            FieldStats {
                mean: vec![0.5; 3],
                std: vec![0.25; 3],
                ..Default::default()
            },
        );
        stats.insert(
            OBS_STATE,
            FieldStats {
                min: vec![0.0, 0.0],
                max: vec![512.0, 512.0],
                ..Default::default()
            },
        );
        stats.insert(
            ACTION,
            FieldStats {
                min: vec![10.0, 20.0],
                max: vec![20.0, 40.0],
                ..Default::default()
            },
        );
        stats
    }

    fn observation(batch: usize) -> Batch {
        Batch::new()
            .with(OBS_STATE, Array2::from_elem((batch, 2), 100.0))
            .with(OBS_IMAGE, Array4::from_elem((batch, 3, 16, 16), 0.5))
    }

    #[test]
    fn test_select_action_shape_and_range() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let action = policy.select_action(&observation(2)).unwrap();
        assert_eq!(action.dim(), (2, 2));
        // Clipped samples unnormalise into the dataset range.
        for row in action.rows() {
            assert!(row[0] >= 10.0 - 1e-3 && row[0] <= 20.0 + 1e-3);
            assert!(row[1] >= 20.0 - 1e-3 && row[1] <= 40.0 + 1e-3);
        }
    }

    #[test]
    fn test_model_runs_once_per_chunk() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        for _ in 0..4 {
            policy.select_action(&observation(1)).unwrap();
        }
        assert_eq!(
            policy.stats(),
            ControllerStats {
                model_invocations: 2,
                actions_served: 4
            }
        );

        policy.reset();
        policy.select_action(&observation(1)).unwrap();
        assert_eq!(policy.stats().model_invocations, 3);
    }

    #[test]
    fn test_seeded_policies_agree() {
        let mut a = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let mut b = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        assert_eq!(
            a.select_action(&observation(1)).unwrap(),
            b.select_action(&observation(1)).unwrap()
        );
    }

    #[test]
    fn test_forward_loss() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        policy.set_training(true);
        let batch = Batch::new()
            .with(OBS_STATE, Array3::from_elem((2, 2, 2), 50.0))
            .with(OBS_IMAGE, Array5::from_elem((2, 2, 3, 16, 16), 0.3))
            .with(ACTION, Array3::from_elem((2, 8, 2), 15.0))
            .with_mask(ACTION_IS_PAD, Array2::from_elem((2, 8), false));
        let loss = policy.forward(&batch).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_forward_without_padding_mask() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let batch = Batch::new()
            .with(OBS_STATE, Array3::from_elem((2, 2, 2), 50.0))
            .with(OBS_IMAGE, Array5::from_elem((2, 2, 3, 16, 16), 0.3))
            .with(ACTION, Array3::from_elem((2, 8, 2), 15.0));
        let loss = policy.forward(&batch).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_forward_rejects_disagreeing_batch_sizes() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let batch = Batch::new()
            .with(OBS_STATE, Array3::from_elem((2, 2, 2), 50.0))
            .with(OBS_IMAGE, Array5::from_elem((2, 2, 3, 16, 16), 0.3))
            .with(ACTION, Array3::from_elem((2, 8, 2), 15.0))
            .with_mask(ACTION_IS_PAD, Array2::from_elem((3, 8), false));
        assert!(matches!(
            policy.forward(&batch),
            Err(PolicyError::ShapeMismatch { field, .. }) if field == ACTION_IS_PAD
        ));
    }

    #[test]
    fn test_forward_missing_action() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let batch = Batch::new()
            .with(OBS_STATE, Array3::from_elem((1, 2, 2), 50.0))
            .with(OBS_IMAGE, Array5::from_elem((1, 2, 3, 16, 16), 0.3));
        assert!(matches!(
            policy.forward(&batch),
            Err(PolicyError::MissingField(key)) if key == ACTION
        ));
    }

    #[test]
    fn test_forward_wrong_window_length() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let batch = Batch::new()
            .with(OBS_STATE, Array3::from_elem((1, 3, 2), 50.0))
            .with(OBS_IMAGE, Array5::from_elem((1, 3, 3, 16, 16), 0.3))
            .with(ACTION, Array3::from_elem((1, 8, 2), 15.0));
        assert!(matches!(
            policy.forward(&batch),
            Err(PolicyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_construction_errors() {
        let config = PolicyConfig {
            noise_scheduler_type: "PNDM".to_string(),
            ..tiny_config()
        };
        assert!(matches!(
            DiffusionPolicy::new(config, &stats()),
            Err(PolicyError::UnsupportedScheduler(_))
        ));

        let mut missing = stats();
        missing.0.remove(ACTION);
        assert!(matches!(
            DiffusionPolicy::new(tiny_config(), &missing),
            Err(PolicyError::MissingStats(_))
        ));

        let config = PolicyConfig {
            n_action_steps: 7,
            ..tiny_config()
        };
        assert!(matches!(
            DiffusionPolicy::new(config, &stats()),
            Err(PolicyError::InvalidActionSteps { .. })
        ));
    }

    #[test]
    fn test_missing_observation_field() {
        let mut policy = DiffusionPolicy::new(tiny_config(), &stats()).unwrap();
        let observation = Batch::new().with(OBS_STATE, Array2::<f32>::zeros((1, 2)));
        assert!(matches!(
            policy.select_action(&observation),
            Err(PolicyError::MissingField(key)) if key == OBS_IMAGE
        ));
    }
}
