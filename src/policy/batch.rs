//! Keyed tensor container passed in and out of the policy.

use std::collections::BTreeMap;

use ndarray::{Array, ArrayD, ArrayView, Dimension};

use crate::error::{PolicyError, Result};

/// Named `f32` tensors plus named boolean masks, all with a leading batch axis.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    tensors: BTreeMap<String, ArrayD<f32>>,
    masks: BTreeMap<String, ArrayD<bool>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<D: Dimension>(mut self, key: impl Into<String>, value: Array<f32, D>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_mask<D: Dimension>(mut self, key: impl Into<String>, value: Array<bool, D>) -> Self {
        self.insert_mask(key, value);
        self
    }

    pub fn insert<D: Dimension>(&mut self, key: impl Into<String>, value: Array<f32, D>) {
        self.tensors.insert(key.into(), value.into_dyn());
    }

    pub fn insert_mask<D: Dimension>(&mut self, key: impl Into<String>, value: Array<bool, D>) {
        self.masks.insert(key.into(), value.into_dyn());
    }

    pub fn get(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.tensors
            .get(key)
            .ok_or_else(|| PolicyError::MissingField(key.to_string()))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(key)
    }

    /// Typed view with a fixed number of axes.
    pub fn view<D: Dimension>(&self, key: &str) -> Result<ArrayView<'_, f32, D>> {
        let value = self.get(key)?;
        let expected = D::NDIM.unwrap_or(value.ndim());
        value
            .view()
            .into_dimensionality::<D>()
            .map_err(|_| PolicyError::RankMismatch {
                field: key.to_string(),
                expected,
                actual: value.ndim(),
            })
    }

    /// Typed owned copy with a fixed number of axes.
    pub fn array<D: Dimension>(&self, key: &str) -> Result<Array<f32, D>> {
        Ok(self.view::<D>(key)?.to_owned())
    }

    /// Typed mask, or `None` when the batch does not carry it.
    pub fn mask<D: Dimension>(&self, key: &str) -> Result<Option<Array<bool, D>>> {
        self.masks
            .get(key)
            .map(|mask| {
                mask.clone()
                    .into_dimensionality::<D>()
                    .map_err(|_| PolicyError::RankMismatch {
                        field: key.to_string(),
                        expected: D::NDIM.unwrap_or(mask.ndim()),
                        actual: mask.ndim(),
                    })
            })
            .transpose()
    }

    /// Leading-axis length shared by every tensor, or `None` for an empty batch.
    pub fn batch_size(&self) -> Result<Option<usize>> {
        let mut sizes = self
            .tensors
            .iter()
            .map(|(k, v)| (k, v.shape()))
            .chain(self.masks.iter().map(|(k, v)| (k, v.shape())));
        let Some((_, first)) = sizes.next() else {
            return Ok(None);
        };
        let size = first.first().copied().unwrap_or(0);
        for (key, shape) in sizes {
            if shape.first().copied().unwrap_or(0) != size {
                let mut expected = shape.to_vec();
                if let Some(lead) = expected.first_mut() {
                    *lead = size;
                }
                return Err(PolicyError::shape(key, &expected, shape));
            }
        }
        Ok(Some(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Ix2, Ix3};

    #[test]
    fn test_typed_access() {
        let batch = Batch::new()
            .with("observation.state", array![[1.0, 2.0], [3.0, 4.0]])
            .with_mask("action_is_pad", array![[false, true]]);
        let state = batch.array::<Ix2>("observation.state").unwrap();
        assert_eq!(state[[1, 0]], 3.0);
        let pad = batch.mask::<Ix2>("action_is_pad").unwrap().unwrap();
        assert!(pad[[0, 1]]);
        assert!(batch.mask::<Ix2>("other").unwrap().is_none());
    }

    #[test]
    fn test_missing_field() {
        let batch = Batch::new();
        assert!(matches!(
            batch.array::<Ix2>("observation.state"),
            Err(PolicyError::MissingField(key)) if key == "observation.state"
        ));
    }

    #[test]
    fn test_wrong_rank() {
        let batch = Batch::new().with("action", Array2::<f32>::zeros((2, 3)));
        assert!(matches!(
            batch.view::<Ix3>("action"),
            Err(PolicyError::RankMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_batch_size_consistency() {
        let batch = Batch::new()
            .with("a", Array2::<f32>::zeros((2, 3)))
            .with("b", Array2::<f32>::zeros((2, 5)));
        assert_eq!(batch.batch_size().unwrap(), Some(2));
        assert_eq!(Batch::new().batch_size().unwrap(), None);

        let bad = batch.with("c", Array2::<f32>::zeros((3, 1)));
        assert!(bad.batch_size().is_err());
    }
}
