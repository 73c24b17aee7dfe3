use crate::error::{ConversionError, Result};

use ndarray::{Array3, ArrayD, ArrayView2, ArrayView3, Axis, Ix3, s};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use rayon::prelude::*;
use std::{collections::BTreeSet, path::Path};
use tracing::debug;

/// Label volume of a segmentation, indexed `(x, y, plane)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelVolume {
    pub data: Array3<u8>,
}

impl LabelVolume {
    pub fn new(data: Array3<u8>) -> Self {
        Self { data }
    }

    /// Read a NIfTI label volume (`.nii` or `.nii.gz`)
    ///
    /// Voxel values are rounded to the nearest integer label. Trailing axes
    /// of length one beyond the third are dropped.
    ///
    /// # Errors
    ///
    /// Returns `MissingResource` if the file does not exist and
    /// `InvalidVolume` if the data is not three dimensional or holds a value
    /// that does not round into `0..=255`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConversionError::MissingResource(path.to_path_buf()));
        }
        let object = ReaderOptions::new().read_file(path)?;
        let data = object.into_volume().into_ndarray::<f32>()?;
        let volume = Self::from_values(data)?;
        debug!(path = %path.display(), dim = ?volume.dim(), "loaded label volume");
        Ok(volume)
    }

    /// Coerce raw voxel values into a label volume
    pub fn from_values(mut data: ArrayD<f32>) -> Result<Self> {
        while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
            let last = Axis(data.ndim() - 1);
            data = data.index_axis_move(last, 0);
        }
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| ConversionError::InvalidVolume("expected a 3-D volume".to_string()))?;
        if let Some(value) = data.iter().find(|&&v| Self::coerce_label(v).is_none()) {
            return Err(ConversionError::InvalidVolume(format!(
                "voxel value {value} is not a label in 0..=255"
            )));
        }
        Ok(Self::new(data.mapv(|v| Self::coerce_label(v).unwrap_or_default())))
    }

    #[inline]
    fn coerce_label(value: f32) -> Option<u8> {
        let label = value.round();
        (0.0..=255.0).contains(&label).then_some(label as u8)
    }

    /// Get the dimensions of the volume (x, y, planes)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Number of planes along the last axis
    pub fn plane_count(&self) -> usize {
        self.data.dim().2
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    pub fn plane(&self, index: usize) -> Option<ArrayView2<'_, u8>> {
        (index < self.plane_count()).then(|| self.data.slice(s![.., .., index]))
    }

    pub fn planes(&self) -> impl Iterator<Item = ArrayView2<'_, u8>> {
        self.data.axis_iter(Axis(2))
    }

    /// Whether the plane at `index` has at least one labelled voxel
    pub fn is_plane_labelled(&self, index: usize) -> bool {
        self.plane(index)
            .is_some_and(|plane| plane.iter().any(|&v| v != 0))
    }

    /// Distinct non-zero labels present anywhere in the volume
    pub fn distinct_labels(&self) -> BTreeSet<u8> {
        let seen = self
            .data
            .par_iter()
            .fold(
                || [false; 256],
                |mut seen, &v| {
                    seen[v as usize] = true;
                    seen
                },
            )
            .reduce(
                || [false; 256],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(a, b)| *a |= b);
                    a
                },
            );
        (1..=u8::MAX).filter(|&v| seen[v as usize]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn volume_with_planes(planes: &[&[u8]]) -> LabelVolume {
        let mut data = Array3::<u8>::zeros((2, 2, planes.len()));
        for (i, values) in planes.iter().enumerate() {
            for (j, &v) in values.iter().enumerate() {
                data[[j % 2, j / 2, i]] = v;
            }
        }
        LabelVolume::new(data)
    }

    #[test]
    fn coerces_float_labels() {
        let raw = Array::from_shape_vec(IxDyn(&[1, 1, 5]), vec![-0.2, 0.9999, 2.0, 254.6, 255.0])
            .expect("shape");
        let volume = LabelVolume::from_values(raw).expect("3-D");
        assert_eq!(volume.data.as_slice_memory_order(), Some(&[0u8, 1, 2, 255, 255][..]));
    }

    #[test]
    fn out_of_range_labels_are_reported() {
        for value in [300.0, -3.0, f32::NAN] {
            let raw = Array::from_shape_vec(IxDyn(&[1, 1, 2]), vec![1.0, value]).expect("shape");
            match LabelVolume::from_values(raw) {
                Err(ConversionError::InvalidVolume(reason)) => {
                    assert!(reason.contains(&value.to_string()), "{reason}");
                }
                other => panic!("expected an invalid volume, got {other:?}"),
            }
        }
    }

    #[test]
    fn drops_trailing_singleton_axes() {
        let raw = ArrayD::<f32>::zeros(IxDyn(&[3, 4, 5, 1]));
        let volume = LabelVolume::from_values(raw).expect("3-D");
        assert_eq!(volume.dim(), (3, 4, 5));

        let raw = ArrayD::<f32>::zeros(IxDyn(&[3, 4, 5, 2]));
        assert!(matches!(
            LabelVolume::from_values(raw),
            Err(ConversionError::InvalidVolume(_))
        ));
    }

    #[test]
    fn labelled_planes() {
        let volume = volume_with_planes(&[&[0, 0, 0, 0], &[0, 1, 0, 0], &[0, 0, 0, 0]]);
        assert_eq!(volume.plane_count(), 3);
        assert!(!volume.is_plane_labelled(0));
        assert!(volume.is_plane_labelled(1));
        assert!(!volume.is_plane_labelled(2));
        assert!(!volume.is_plane_labelled(3));
        assert!(volume.plane(3).is_none());
    }

    #[test]
    fn distinct_labels_skip_background() {
        let volume = volume_with_planes(&[&[0, 2, 2, 0], &[7, 1, 0, 0]]);
        let labels: Vec<_> = volume.distinct_labels().into_iter().collect();
        assert_eq!(labels, vec![1, 2, 7]);
        assert!(LabelVolume::new(Array3::zeros((2, 2, 2))).distinct_labels().is_empty());
    }

    #[test]
    fn missing_volume_file() {
        assert!(matches!(
            LabelVolume::load("no/such/volume.nii.gz"),
            Err(ConversionError::MissingResource(_))
        ));
    }
}
