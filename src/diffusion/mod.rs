//! Diffusion decoding: noise schedules, the conditional action head, the
//! reverse sampling loop and the training loss.

pub mod ddim;
pub mod ddpm;
pub mod head;
pub mod loss;
pub mod sampler;
pub mod scheduler;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use head::{Denoiser, DiffusionActionHead, FourierFeatures};
pub use loss::diffusion_loss;
pub use sampler::conditional_sample;
pub use scheduler::{DiffusionScheduler, NoiseSchedule, NoiseScheduler};
