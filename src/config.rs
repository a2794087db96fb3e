//! Policy configuration.
//!
//! A `PolicyConfig` is immutable once a policy has been built from it. All
//! relationships between fields are checked by [`PolicyConfig::validate`],
//! which every constructor calls, so a bad configuration fails before the
//! first control step.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};

/// Proprioceptive state field.
pub const OBS_STATE: &str = "observation.state";

/// Prefix shared by image fields. Exactly one such field is supported.
pub const OBS_IMAGE: &str = "observation.image";

/// Action trajectory field.
pub const ACTION: &str = "action";

/// Per-step padding flags for the action trajectory.
pub const ACTION_IS_PAD: &str = "action_is_pad";

/// What the action head is trained to output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionType {
    /// The noise that was added to the clean trajectory.
    Epsilon,
    /// The clean trajectory itself.
    Sample,
}

impl FromStr for PredictionType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "sample" => Ok(Self::Sample),
            other => Err(PolicyError::UnsupportedPredictionType(other.to_string())),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epsilon => write!(f, "epsilon"),
            Self::Sample => write!(f, "sample"),
        }
    }
}

/// The two supported reverse-step formulas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    Ddpm,
    Ddim,
}

impl FromStr for SchedulerKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DDPM" => Ok(Self::Ddpm),
            "DDIM" => Ok(Self::Ddim),
            other => Err(PolicyError::UnsupportedScheduler(other.to_string())),
        }
    }
}

/// How β ranges over the training timesteps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

impl FromStr for BetaSchedule {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredcosCapV2),
            other => Err(PolicyError::UnsupportedBetaSchedule(other.to_string())),
        }
    }
}

/// Full policy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Number of observation steps fed to the transformer.
    pub n_obs_steps: usize,

    /// Length of the predicted trajectory, measured from the oldest observation.
    pub horizon: usize,

    /// Number of predicted actions executed before replanning.
    pub n_action_steps: usize,

    /// Feature shapes of the input fields (without batch/time axes).
    pub input_shapes: BTreeMap<String, Vec<usize>>,

    /// Feature shapes of the output fields.
    pub output_shapes: BTreeMap<String, Vec<usize>>,

    /// Normalization mode per input field (`mean_std` or `min_max`).
    pub input_normalization_modes: BTreeMap<String, String>,

    /// Normalization mode per output field.
    pub output_normalization_modes: BTreeMap<String, String>,

    /// Spatial crop applied before the backbone, `[height, width]`.
    pub crop_shape: Option<[usize; 2]>,

    /// Use a random crop in training mode (center crop is always used in eval).
    pub crop_is_random: bool,

    /// Kernel size and stride of the patch convolution.
    pub backbone_patch_size: usize,

    /// Number of channels produced by the backbone.
    pub backbone_feature_dim: usize,

    /// Group norm (channels / 16 groups) instead of a batch-norm affine.
    pub use_group_norm: bool,

    /// Transformer width.
    pub embed_dim: usize,

    /// Attention heads per encoder layer.
    pub n_heads: usize,

    /// Encoder layers.
    pub n_layers: usize,

    /// Encoder feed-forward width.
    pub d_ffn: usize,

    /// Readout tokens appended after each observation step.
    pub n_readouts_per_step: usize,

    /// Width of the Fourier time embedding (must be even).
    pub time_dim: usize,

    /// Learned Fourier frequencies instead of fixed sinusoidal ones.
    pub learnable_time_features: bool,

    /// Hidden width of the MLP-ResNet.
    pub diffusion_head_dim: usize,

    /// Residual blocks in the MLP-ResNet.
    pub n_diffusion_head_layers: usize,

    /// `DDPM` or `DDIM`.
    pub noise_scheduler_type: String,

    pub num_train_timesteps: usize,

    /// `linear`, `scaled_linear` or `squaredcos_cap_v2`.
    pub beta_schedule: String,

    pub beta_start: f32,

    pub beta_end: f32,

    /// `epsilon` or `sample`.
    pub prediction_type: String,

    /// Clamp the predicted clean sample during reverse steps.
    pub clip_sample: bool,

    pub clip_sample_range: f32,

    /// Reverse steps at inference; `None` uses `num_train_timesteps`.
    pub num_inference_steps: Option<usize>,

    /// Zero the loss where `action_is_pad` is set.
    pub do_mask_loss_for_padding: bool,

    /// Seed for weight initialisation and sampling. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut input_shapes = BTreeMap::new();
        input_shapes.insert(OBS_IMAGE.to_string(), vec![3, 96, 96]);
        input_shapes.insert(OBS_STATE.to_string(), vec![2]);

        let mut output_shapes = BTreeMap::new();
        output_shapes.insert(ACTION.to_string(), vec![2]);

        let mut input_normalization_modes = BTreeMap::new();
        input_normalization_modes.insert(OBS_IMAGE.to_string(), "mean_std".to_string());
        input_normalization_modes.insert(OBS_STATE.to_string(), "min_max".to_string());

        let mut output_normalization_modes = BTreeMap::new();
        output_normalization_modes.insert(ACTION.to_string(), "min_max".to_string());

        Self {
            n_obs_steps: 2,
            horizon: 16,
            n_action_steps: 8,
            input_shapes,
            output_shapes,
            input_normalization_modes,
            output_normalization_modes,
            crop_shape: Some([84, 84]),
            crop_is_random: true,
            backbone_patch_size: 14,
            backbone_feature_dim: 256,
            use_group_norm: true,
            embed_dim: 384,
            n_heads: 6,
            n_layers: 12,
            d_ffn: 1536,
            n_readouts_per_step: 1,
            time_dim: 32,
            learnable_time_features: true,
            diffusion_head_dim: 256,
            n_diffusion_head_layers: 3,
            noise_scheduler_type: "DDPM".to_string(),
            num_train_timesteps: 100,
            beta_schedule: "squaredcos_cap_v2".to_string(),
            beta_start: 1e-4,
            beta_end: 0.02,
            prediction_type: "epsilon".to_string(),
            clip_sample: true,
            clip_sample_range: 1.0,
            num_inference_steps: None,
            do_mask_loss_for_padding: false,
            seed: None,
        }
    }
}

impl PolicyConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<()> {
        validate_action_steps(self.n_obs_steps, self.horizon, self.n_action_steps)?;

        self.scheduler_kind()?;
        self.prediction()?;
        self.beta_schedule.parse::<BetaSchedule>()?;

        let image_key = self.image_key()?;
        let image_shape = self.image_shape()?;
        if image_shape.len() != 3 {
            return Err(PolicyError::InvalidConfig(format!(
                "'{image_key}' must have a [channels, height, width] shape, got {image_shape:?}"
            )));
        }
        let (height, width) = match self.crop_shape {
            Some([h, w]) => {
                if h > image_shape[1] || w > image_shape[2] {
                    return Err(PolicyError::InvalidConfig(format!(
                        "crop {h}x{w} exceeds image {}x{}",
                        image_shape[1], image_shape[2]
                    )));
                }
                (h, w)
            }
            None => (image_shape[1], image_shape[2]),
        };
        if self.backbone_patch_size == 0
            || height < self.backbone_patch_size
            || width < self.backbone_patch_size
        {
            return Err(PolicyError::InvalidConfig(format!(
                "patch size {} does not fit a {height}x{width} image",
                self.backbone_patch_size
            )));
        }
        if self.backbone_feature_dim == 0
            || (self.use_group_norm && self.backbone_feature_dim % 16 != 0)
        {
            return Err(PolicyError::InvalidConfig(format!(
                "backbone_feature_dim must be positive (and divisible by 16 with group norm), got {}",
                self.backbone_feature_dim
            )));
        }

        self.state_dim()?;
        self.action_dim()?;

        if self.n_readouts_per_step == 0 {
            return Err(PolicyError::InvalidConfig(
                "n_readouts_per_step must be at least 1".to_string(),
            ));
        }
        if self.n_heads == 0 || self.embed_dim % self.n_heads != 0 {
            return Err(PolicyError::InvalidConfig(format!(
                "embed_dim {} is not divisible by n_heads {}",
                self.embed_dim, self.n_heads
            )));
        }
        if self.time_dim < 4 || self.time_dim % 2 != 0 {
            return Err(PolicyError::InvalidConfig(format!(
                "time_dim must be even and at least 4, got {}",
                self.time_dim
            )));
        }
        if self.num_train_timesteps == 0 {
            return Err(PolicyError::InvalidConfig(
                "num_train_timesteps must be positive".to_string(),
            ));
        }
        let inference_steps = self.num_inference_steps();
        if inference_steps == 0 || inference_steps > self.num_train_timesteps {
            return Err(PolicyError::InvalidConfig(format!(
                "num_inference_steps must be in 1..={}, got {inference_steps}",
                self.num_train_timesteps
            )));
        }
        Ok(())
    }

    pub fn scheduler_kind(&self) -> Result<SchedulerKind> {
        self.noise_scheduler_type.parse()
    }

    pub fn prediction(&self) -> Result<PredictionType> {
        self.prediction_type.parse()
    }

    /// The single image field.
    // TODO: lift this restriction once multi-camera tokens get their own position slots.
    pub fn image_key(&self) -> Result<&str> {
        let keys: Vec<&String> = self
            .input_shapes
            .keys()
            .filter(|k| k.starts_with(OBS_IMAGE))
            .collect();
        match keys.as_slice() {
            [key] => Ok(key.as_str()),
            _ => Err(PolicyError::ImageKeyCount(
                keys.into_iter().cloned().collect(),
            )),
        }
    }

    pub fn image_shape(&self) -> Result<&[usize]> {
        let key = self.image_key()?;
        self.input_shapes
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| PolicyError::MissingField(key.to_string()))
    }

    pub fn state_dim(&self) -> Result<usize> {
        feature_width(&self.input_shapes, OBS_STATE)
    }

    pub fn action_dim(&self) -> Result<usize> {
        feature_width(&self.output_shapes, ACTION)
    }

    pub fn num_inference_steps(&self) -> usize {
        self.num_inference_steps.unwrap_or(self.num_train_timesteps)
    }
}

/// The receding-horizon timing constraint between window sizes.
pub fn validate_action_steps(n_obs_steps: usize, horizon: usize, n_action_steps: usize) -> Result<()> {
    if n_obs_steps == 0 || n_action_steps == 0 || n_obs_steps > horizon {
        return Err(PolicyError::InvalidConfig(format!(
            "need 1 <= n_obs_steps <= horizon and n_action_steps >= 1 \
             (n_obs_steps={n_obs_steps}, horizon={horizon}, n_action_steps={n_action_steps})"
        )));
    }
    if n_action_steps >= horizon - n_obs_steps + 1 {
        return Err(PolicyError::InvalidActionSteps {
            n_action_steps,
            horizon,
            n_obs_steps,
        });
    }
    Ok(())
}

// One proprioceptive field with a flat feature vector.
fn feature_width(shapes: &BTreeMap<String, Vec<usize>>, key: &str) -> Result<usize> {
    match shapes.get(key).map(Vec::as_slice) {
        Some([width]) if *width > 0 => Ok(*width),
        Some(other) => Err(PolicyError::InvalidConfig(format!(
            "'{key}' must be a non-empty 1-D feature, got {other:?}"
        ))),
        None => Err(PolicyError::MissingField(key.to_string())),
    }
}
