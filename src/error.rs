use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SegError {
    #[error(
        "No supported DICOM files found in {}. Supported modalities: CT, MR, PET, SPECT",
        .dir.display()
    )]
    NoSeriesFound { dir: PathBuf },

    #[error(
        "{rejected} DICOM files in {} were read but none is a CT, MR, PET or SPECT image",
        .dir.display()
    )]
    UnsupportedModality { dir: PathBuf, rejected: usize },

    #[error(
        "{skipped} images in {} lack a SOP Instance UID or Instance Number",
        .dir.display()
    )]
    UnidentifiedImages { dir: PathBuf, skipped: usize },

    #[error("Inconsistent image dimensions in reference series")]
    InconsistentDimensions,

    #[error("No non-empty segments found in the segmentation data")]
    EmptySegmentation,

    #[error(
        "Label volume shape {actual:?} does not match the reference series \
         (columns, rows, slices) {expected:?}"
    )]
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Failed to write DICOM object to {}", .path.display())]
    ContainerWrite {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to assemble DICOM object: {0}")]
    Assembly(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Segmentation engine failed: {0}")]
    Engine(String),

    #[error("DICOM to volume conversion failed: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}
