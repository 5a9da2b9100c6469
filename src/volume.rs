use crate::error::SegError;

use ndarray::{Array3, ArrayView3, Ix3, s};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::Path;

/// Voxel labels as produced by the segmentation engine, axes (X, Y, Z).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelVolume {
    pub data: Array3<u16>,
}

impl LabelVolume {
    pub fn new(data: Array3<u16>) -> Self {
        Self { data }
    }

    /// Read a multilabel NIfTI file. Voxel values are rounded to the
    /// nearest integer label; negative values become background.
    pub fn from_nifti(path: impl AsRef<Path>) -> Result<Self, SegError> {
        let object = ReaderOptions::new().read_file(path.as_ref())?;
        let volume = object.into_volume().into_ndarray::<f32>()?;
        let volume = volume
            .into_dimensionality::<Ix3>()
            .map_err(|e| SegError::Engine(format!("label volume is not 3D: {e}")))?;

        Ok(Self::new(volume.mapv(|v| v.round().max(0.0) as u16)))
    }

    /// Get the dimensions of the volume (X, Y, Z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    /// Rotate the volume in-plane into DICOM row/column order.
    ///
    /// The result has axes (rows, columns, slices).
    pub fn rotated(&self) -> Array3<u16> {
        rotate_in_plane(self.data.view())
    }
}

/// Quarter turn of the first two axes: `out[i, j, k] = in[j, n1 - 1 - i, k]`.
///
/// A (X, Y, Z) array becomes (Y, X, Z). Four turns give back the input.
pub fn rotate_in_plane<T: Clone>(volume: ArrayView3<'_, T>) -> Array3<T> {
    volume
        .slice_move(s![.., ..;-1, ..])
        .permuted_axes([1, 0, 2])
        .as_standard_layout()
        .into_owned()
}

/// Rotated labels rearranged into output frame order, axes
/// (frame, row, column).
///
/// The slice axis leads and is reversed, so the last slice of the rotated
/// volume is frame 0.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStack {
    pub data: Array3<u16>,
}

impl FrameStack {
    pub fn from_rotated(rotated: ArrayView3<'_, u16>) -> Self {
        let data = rotated
            .permuted_axes([2, 0, 1])
            .slice_move(s![..;-1, .., ..])
            .as_standard_layout()
            .into_owned();
        Self { data }
    }

    /// Get the dimensions of the stack (frames, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Binary mask of one label, 1 where the stack holds `label`.
    pub fn mask(&self, label: u16) -> Array3<u8> {
        self.data.mapv(|v| u8::from(v == label))
    }
}
