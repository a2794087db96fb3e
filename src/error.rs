//! Error type shared by every fallible policy operation.

use thiserror::Error;

/// Errors raised while building or running a policy.
///
/// Configuration variants are only produced at construction time; shape and
/// missing-field variants are produced by the call that received bad input.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("unsupported noise scheduler type '{0}' (expected DDPM or DDIM)")]
    UnsupportedScheduler(String),

    #[error("unsupported prediction type '{0}' (expected epsilon or sample)")]
    UnsupportedPredictionType(String),

    #[error("unsupported beta schedule '{0}'")]
    UnsupportedBetaSchedule(String),

    #[error("unsupported normalization mode '{mode}' for field '{field}'")]
    UnsupportedNormalizationMode { field: String, mode: String },

    #[error("exactly one image input is supported, got {0:?}")]
    ImageKeyCount(Vec<String>),

    #[error(
        "n_action_steps ({n_action_steps}) must be < horizon ({horizon}) - n_obs_steps ({n_obs_steps}) + 1"
    )]
    InvalidActionSteps {
        n_action_steps: usize,
        horizon: usize,
        n_obs_steps: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("batch is missing required field '{0}'")]
    MissingField(String),

    #[error("no dataset statistics for normalized field '{0}'")]
    MissingStats(String),

    #[error("shape mismatch for '{field}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        field: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("'{field}' must have {expected} axes, got {actual}")]
    RankMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor shape error: {0}")]
    Tensor(#[from] ndarray::ShapeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PolicyError {
    pub(crate) fn shape(field: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            field: field.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
