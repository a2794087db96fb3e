//! Visual backbone and the RGB encoder wrapping it.
//!
//! The backbone is a single strided patch convolution (kernel = stride =
//! `patch_size`) followed by a normalisation layer and ReLU. Its output is a
//! feature map `[N, feature_dim, H / patch, W / patch]` whose spatial cells
//! become image tokens.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::crop::Crop;
use crate::config::PolicyConfig;
use crate::error::{PolicyError, Result};

/// Channels per group when group norm is selected.
pub const GROUP_NORM_CHANNELS: usize = 16;

const NORM_EPS: f32 = 1e-5;

/// Image feature extractor.
pub trait VisionBackbone {
    /// `[N, C, H, W] -> [N, C', H', W']`
    fn encode(&self, images: &Array4<f32>) -> Result<Array4<f32>>;

    /// `[C', H', W']` produced for a `[channels, height, width]` input.
    fn feature_map_shape(&self, channels: usize, height: usize, width: usize) -> [usize; 3];
}

/// Normalisation applied to the convolution output, chosen at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FeatureNorm {
    /// Batch norm in inference form: running statistics and a per-channel affine.
    BatchNorm {
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        gamma: Array1<f32>,
        beta: Array1<f32>,
    },
    /// Per-sample group norm with a per-channel affine.
    GroupNorm {
        num_groups: usize,
        gamma: Array1<f32>,
        beta: Array1<f32>,
    },
}

impl FeatureNorm {
    pub fn batch_norm(channels: usize) -> Self {
        Self::BatchNorm {
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
        }
    }

    pub fn group_norm(channels: usize) -> Self {
        Self::GroupNorm {
            num_groups: (channels / GROUP_NORM_CHANNELS).max(1),
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
        }
    }

    /// Normalise one feature map `[C, H, W]` in place.
    pub fn apply(&self, fmap: &mut Array3<f32>) {
        match self {
            Self::BatchNorm {
                running_mean,
                running_var,
                gamma,
                beta,
            } => {
                for (c, mut channel) in fmap.axis_iter_mut(Axis(0)).enumerate() {
                    let scale = gamma[c] / (running_var[c] + NORM_EPS).sqrt();
                    let shift = beta[c] - running_mean[c] * scale;
                    channel.mapv_inplace(|v| v * scale + shift);
                }
            }
            Self::GroupNorm {
                num_groups,
                gamma,
                beta,
            } => {
                let per_group = fmap.shape()[0] / num_groups;
                for g in 0..*num_groups {
                    let channels = g * per_group..(g + 1) * per_group;
                    let mut group = fmap.slice_mut(s![channels.clone(), .., ..]);
                    let mean = group.mean().unwrap_or(0.0);
                    let var = group.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
                    let inv = 1.0 / (var + NORM_EPS).sqrt();
                    for (offset, mut channel) in group.axis_iter_mut(Axis(0)).enumerate() {
                        let c = channels.start + offset;
                        channel.mapv_inplace(|v| (v - mean) * inv * gamma[c] + beta[c]);
                    }
                }
            }
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            Self::BatchNorm { gamma, beta, .. } | Self::GroupNorm { gamma, beta, .. } => {
                gamma.len() + beta.len()
            }
        }
    }
}

/// Patch convolution, normalisation, ReLU.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchBackbone {
    /// Convolution kernel flattened to `[feature_dim, channels * patch * patch]`.
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    pub norm: FeatureNorm,
    pub in_channels: usize,
    pub patch_size: usize,
}

impl PatchBackbone {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        feature_dim: usize,
        patch_size: usize,
        use_group_norm: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * patch_size * patch_size;
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let mut uniform = || (rng.gen::<f32>() * 2.0 - 1.0) * bound;
        let weight = Array2::from_shape_simple_fn((feature_dim, fan_in), &mut uniform);
        let bias = Array1::from_shape_simple_fn(feature_dim, &mut uniform);
        let norm = if use_group_norm {
            FeatureNorm::group_norm(feature_dim)
        } else {
            FeatureNorm::batch_norm(feature_dim)
        };
        Self {
            weight,
            bias,
            norm,
            in_channels,
            patch_size,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Gather non-overlapping patches of one image into `[H' * W', C * p * p]`.
    fn patches(&self, image: ArrayView3<f32>) -> Array2<f32> {
        let p = self.patch_size;
        let (_, height, width) = image.dim();
        let (rows, cols) = (height / p, width / p);
        let mut out = Array2::zeros((rows * cols, self.weight.ncols()));
        for i in 0..rows {
            for j in 0..cols {
                let patch = image.slice(s![.., i * p..(i + 1) * p, j * p..(j + 1) * p]);
                out.row_mut(i * cols + j)
                    .iter_mut()
                    .zip(patch.iter())
                    .for_each(|(o, &v)| *o = v);
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len() + self.norm.param_count()
    }
}

impl VisionBackbone for PatchBackbone {
    fn encode(&self, images: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, channels, height, width) = images.dim();
        if channels != self.in_channels || height < self.patch_size || width < self.patch_size {
            return Err(PolicyError::shape(
                "image",
                &[n, self.in_channels, height.max(self.patch_size), width.max(self.patch_size)],
                images.shape(),
            ));
        }
        let [features, rows, cols] = self.feature_map_shape(channels, height, width);

        let maps: Vec<Array3<f32>> = (0..n)
            .into_par_iter()
            .map(|i| -> Result<Array3<f32>> {
                let conv = self.patches(images.index_axis(Axis(0), i)).dot(&self.weight.t()) + &self.bias;
                // [H'W', F] -> [F, H', W']
                let mut fmap = conv
                    .reversed_axes()
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order((features, rows, cols))?;
                self.norm.apply(&mut fmap);
                fmap.mapv_inplace(|v| v.max(0.0));
                Ok(fmap)
            })
            .collect::<Result<_>>()?;

        let mut out = Array4::zeros((n, features, rows, cols));
        for (i, fmap) in maps.iter().enumerate() {
            out.index_axis_mut(Axis(0), i).assign(fmap);
        }
        Ok(out)
    }

    fn feature_map_shape(&self, _channels: usize, height: usize, width: usize) -> [usize; 3] {
        [
            self.feature_dim(),
            height / self.patch_size,
            width / self.patch_size,
        ]
    }
}

/// Optional crop followed by a backbone.
#[derive(Clone, Debug)]
pub struct RgbEncoder<B = PatchBackbone> {
    pub crop: Option<Crop>,
    pub backbone: B,
    /// `[C', H', W']` for one cropped input image.
    pub feature_map_shape: [usize; 3],
}

impl RgbEncoder<PatchBackbone> {
    pub fn from_config<R: Rng + ?Sized>(config: &PolicyConfig, rng: &mut R) -> Result<Self> {
        let image_shape = config.image_shape()?;
        let [channels, height, width] = <[usize; 3]>::try_from(image_shape).map_err(|_| {
            PolicyError::InvalidConfig(format!("image shape must be [c, h, w], got {image_shape:?}"))
        })?;
        let backbone = PatchBackbone::new(
            channels,
            config.backbone_feature_dim,
            config.backbone_patch_size,
            config.use_group_norm,
            rng,
        );
        let crop = config
            .crop_shape
            .map(|shape| Crop::new(shape, config.crop_is_random));
        Ok(Self::new(crop, backbone, [channels, height, width]))
    }
}

impl<B: VisionBackbone> RgbEncoder<B> {
    /// `image_shape` is the uncropped `[channels, height, width]`.
    pub fn new(crop: Option<Crop>, backbone: B, image_shape: [usize; 3]) -> Self {
        let [channels, height, width] = image_shape;
        let (height, width) = crop.map_or((height, width), |c| (c.height, c.width));
        let feature_map_shape = backbone.feature_map_shape(channels, height, width);
        Self {
            crop,
            backbone,
            feature_map_shape,
        }
    }

    /// Image tokens per observation step.
    pub fn num_patches(&self) -> usize {
        self.feature_map_shape[1] * self.feature_map_shape[2]
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_map_shape[0]
    }

    /// Crop (random only when `training`) and encode `[N, C, H, W]`.
    pub fn encode<R: Rng + ?Sized>(&self, images: &Array4<f32>, training: bool, rng: &mut R) -> Result<Array4<f32>> {
        match &self.crop {
            Some(crop) => self.backbone.encode(&crop.apply(images, training, rng)?),
            None => self.backbone.encode(images),
        }
    }
}
