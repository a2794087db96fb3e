//! # OCTO-POLICY
//!
//! **Readout-transformer diffusion policy** for receding-horizon robot control.
//!
//! ## Components
//!
//! 1. **Causal mask**: block-wise mask that keeps readout tokens private to their step
//! 2. **Readout transformer**: fuses state and image-patch tokens into per-step readouts
//! 3. **Diffusion action head**: Fourier time features + MLP-ResNet noise predictor
//! 4. **Schedulers**: DDPM (stochastic) and DDIM (deterministic) reverse steps
//! 5. **Action queue**: runs the model once per `n_action_steps` control steps
//!
//! ## Data flow
//!
//! observation → normalise → queue → [cache miss] encode → denoise →
//! unnormalise → action cache → one action per step

pub mod config;
pub mod core;
pub mod diffusion;
pub mod error;
pub mod policy;
pub mod vision;

pub use config::PolicyConfig;
pub use error::{PolicyError, Result};
pub use policy::{Batch, DatasetStats, DiffusionPolicy};
