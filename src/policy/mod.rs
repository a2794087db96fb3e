//! Policy surface: batches, normalisation, the action-queue controller and
//! the assembled model.

pub mod batch;
pub mod diffusion_policy;
pub mod model;
pub mod normalize;
pub mod queue;

pub use batch::Batch;
pub use diffusion_policy::DiffusionPolicy;
pub use model::ActionModel;
pub use normalize::{DatasetStats, FieldStats, NormalizationMode, Normalizer};
pub use queue::{ActionQueueController, BoundedQueue, ControllerStats, TrajectoryGenerator};
