//! Dense layers, masked attention and the readout transformer.

pub mod attention;
pub mod layers;
pub mod mask;
pub mod transformer;
