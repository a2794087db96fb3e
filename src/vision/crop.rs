//! Spatial crops over `[N, C, H, W]` image batches.

use ndarray::{s, Array4};
use rand::Rng;

use crate::error::{PolicyError, Result};

/// Crop to a fixed `[height, width]`, either centered or at a random offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crop {
    pub height: usize,
    pub width: usize,
    /// Use a random offset when the encoder is in training mode.
    pub random_in_training: bool,
}

impl Crop {
    pub fn new([height, width]: [usize; 2], random_in_training: bool) -> Self {
        Self {
            height,
            width,
            random_in_training,
        }
    }

    /// Crop every image in the batch at the same offset.
    pub fn apply<R: Rng + ?Sized>(&self, images: &Array4<f32>, training: bool, rng: &mut R) -> Result<Array4<f32>> {
        let (n, c, height, width) = images.dim();
        if self.height > height || self.width > width {
            return Err(PolicyError::shape(
                "image",
                &[n, c, self.height.max(height), self.width.max(width)],
                images.shape(),
            ));
        }
        let (top, left) = if training && self.random_in_training {
            (
                rng.gen_range(0..=height - self.height),
                rng.gen_range(0..=width - self.width),
            )
        } else {
            center_offsets(height, width, self.height, self.width)
        };
        Ok(images
            .slice(s![.., .., top..top + self.height, left..left + self.width])
            .to_owned())
    }
}

/// Top-left corner of a centered crop; half-pixel offsets round to even.
pub fn center_offsets(height: usize, width: usize, crop_height: usize, crop_width: usize) -> (usize, usize) {
    let offset = |full: usize, crop: usize| ((full - crop) as f64 / 2.0).round_ties_even() as usize;
    (offset(height, crop_height), offset(width, crop_width))
}
