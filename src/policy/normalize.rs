//! Per-field affine normalisation keyed by dataset statistics.
//!
//! Statistics are per-channel vectors applied along the first feature axis:
//! for a field with feature shape `[C, H, W]` inside a tensor of rank `r`,
//! channel `c` is the index on axis `r - 3`.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use super::batch::Batch;
use crate::error::{PolicyError, Result};

/// Guards divisions against zero spread.
const EPS: f32 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizationMode {
    /// `(x - mean) / (std + eps)`
    MeanStd,
    /// `(x - min) / (max - min + eps) * 2 - 1`, mapping the range to `[-1, 1]`.
    MinMax,
}

impl FromStr for NormalizationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "mean_std" => Ok(Self::MeanStd),
            "min_max" => Ok(Self::MinMax),
            other => Err(other.to_string()),
        }
    }
}

/// Per-channel statistics for one field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl FieldStats {
    /// Statistics over every axis except `channel_axis`.
    pub fn from_samples(values: &ArrayD<f32>, channel_axis: usize) -> Self {
        let mut stats = Self::default();
        for lane in values.axis_iter(Axis(channel_axis)) {
            let n = lane.len().max(1) as f32;
            let mean = lane.sum() / n;
            let var = lane.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            stats.mean.push(mean);
            stats.std.push(var.sqrt());
            stats.min.push(lane.iter().copied().fold(f32::INFINITY, f32::min));
            stats.max.push(lane.iter().copied().fold(f32::NEG_INFINITY, f32::max));
        }
        stats
    }
}

/// Statistics for every field of a dataset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetStats(pub BTreeMap<String, FieldStats>);

impl DatasetStats {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, stats: FieldStats) {
        self.0.insert(key.into(), stats);
    }

    pub fn get(&self, key: &str) -> Option<&FieldStats> {
        self.0.get(key)
    }
}

/// Precomputed `y = x * scale + shift` per channel.
#[derive(Clone, Debug)]
struct FieldTransform {
    feature_shape: Vec<usize>,
    scale: Vec<f32>,
    shift: Vec<f32>,
}

impl FieldTransform {
    fn new(field: &str, feature_shape: &[usize], mode: NormalizationMode, stats: &FieldStats) -> Result<Self> {
        // Statistics are per channel along the first feature axis.
        let Some(&channels) = feature_shape.first() else {
            return Err(PolicyError::InvalidConfig(format!(
                "normalized field '{field}' needs at least one feature axis"
            )));
        };
        let (a, b) = match mode {
            NormalizationMode::MeanStd => (&stats.mean, &stats.std),
            NormalizationMode::MinMax => (&stats.min, &stats.max),
        };
        if a.len() != channels || b.len() != channels {
            return Err(PolicyError::shape(
                &format!("{field} statistics"),
                &[channels],
                &[a.len().min(b.len())],
            ));
        }
        let (scale, shift) = a
            .iter()
            .zip(b)
            .map(|(&a, &b)| match mode {
                NormalizationMode::MeanStd => {
                    let scale = 1.0 / (b + EPS);
                    (scale, -a * scale)
                }
                NormalizationMode::MinMax => {
                    let scale = 2.0 / (b - a + EPS);
                    (scale, -a * scale - 1.0)
                }
            })
            .unzip();
        Ok(Self {
            feature_shape: feature_shape.to_vec(),
            scale,
            shift,
        })
    }

    fn channel_axis(&self, field: &str, value: &ArrayD<f32>) -> Result<Axis> {
        let tail_start = value.ndim().checked_sub(self.feature_shape.len());
        match tail_start {
            Some(axis) if value.shape()[axis..] == self.feature_shape[..] => Ok(Axis(axis)),
            _ => {
                let mut expected = value.shape()[..tail_start.unwrap_or(0)].to_vec();
                expected.extend_from_slice(&self.feature_shape);
                Err(PolicyError::shape(field, &expected, value.shape()))
            }
        }
    }

    fn forward(&self, field: &str, value: &mut ArrayD<f32>) -> Result<()> {
        let axis = self.channel_axis(field, value)?;
        for (c, mut lane) in value.axis_iter_mut(axis).enumerate() {
            let (scale, shift) = (self.scale[c], self.shift[c]);
            lane.mapv_inplace(|v| v * scale + shift);
        }
        Ok(())
    }

    fn inverse(&self, field: &str, value: &mut ArrayD<f32>) -> Result<()> {
        let axis = self.channel_axis(field, value)?;
        for (c, mut lane) in value.axis_iter_mut(axis).enumerate() {
            let (scale, shift) = (self.scale[c], self.shift[c]);
            lane.mapv_inplace(|v| (v - shift) / scale);
        }
        Ok(())
    }
}

/// Normalises (or restores) the fields of a [`Batch`].
///
/// Fields without a configured mode pass through unchanged, as do configured
/// fields absent from a particular batch.
#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    fields: BTreeMap<String, FieldTransform>,
}

impl Normalizer {
    pub fn new(
        shapes: &BTreeMap<String, Vec<usize>>,
        modes: &BTreeMap<String, String>,
        stats: &DatasetStats,
    ) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for (field, shape) in shapes {
            let Some(mode) = modes.get(field) else {
                continue;
            };
            let mode: NormalizationMode = mode.parse().map_err(|mode| {
                PolicyError::UnsupportedNormalizationMode {
                    field: field.clone(),
                    mode,
                }
            })?;
            let field_stats = stats
                .get(field)
                .ok_or_else(|| PolicyError::MissingStats(field.clone()))?;
            fields.insert(field.clone(), FieldTransform::new(field, shape, mode, field_stats)?);
        }
        Ok(Self { fields })
    }

    pub fn normalize(&self, batch: &mut Batch) -> Result<()> {
        for (field, transform) in &self.fields {
            if let Some(value) = batch.get_mut(field) {
                transform.forward(field, value)?;
            }
        }
        Ok(())
    }

    /// Restore one tensor of `field`; unknown fields are returned unchanged.
    pub fn unnormalize_array(&self, field: &str, mut value: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if let Some(transform) = self.fields.get(field) {
            transform.inverse(field, &mut value)?;
        }
        Ok(value)
    }
}
