//! Image preprocessing and feature extraction.

pub mod backbone;
pub mod crop;

pub use backbone::{FeatureNorm, PatchBackbone, RgbEncoder, VisionBackbone};
pub use crop::Crop;
